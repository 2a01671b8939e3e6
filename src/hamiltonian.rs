//! Matrix product operators for spin-chain observables.
//!
//! Each MPO is a chain of rank-4 tensors with axes (left, right, up, down).
//! The bulk tensor is shared between the interior sites; the first site is
//! the last row of the bulk tensor and the last site its first column.

use num_complex::Complex64 as C64;
use crate::tensor::{ t2, Tensor };

fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

/// 2×2 identity.
pub fn identity2() -> Tensor {
    t2(&[
        &[c(1.0, 0.0), c(0.0, 0.0)],
        &[c(0.0, 0.0), c(1.0, 0.0)],
    ])
}

/// Pauli X.
pub fn pauli_x() -> Tensor {
    t2(&[
        &[c(0.0, 0.0), c(1.0, 0.0)],
        &[c(1.0, 0.0), c(0.0, 0.0)],
    ])
}

/// Pauli Y.
pub fn pauli_y() -> Tensor {
    t2(&[
        &[c(0.0, 0.0), c(0.0, -1.0)],
        &[c(0.0, 1.0), c(0.0, 0.0)],
    ])
}

/// Pauli Z.
pub fn pauli_z() -> Tensor {
    t2(&[
        &[c(1.0, 0.0), c(0.0, 0.0)],
        &[c(0.0, 0.0), c(-1.0, 0.0)],
    ])
}

/// The MPO of the [transverse-field Ising model] on a chain of `len` sites
/// with field strength `h`, built from the bulk tensor
///
/// ```text
/// W = [[ I,     0,    0 ],
///      [ Z,     0,    0 ],
///      [ -h X, -Z,    I ]]
/// ```
///
/// [transverse-field Ising model]: https://en.wikipedia.org/wiki/Transverse-field_Ising_model
pub fn ising(len: usize, h: C64) -> Vec<Tensor> {
    let mut minus_hx = Tensor::zeros(&[1]);
    crate::tensor::scale(&mut minus_hx, -h, &pauli_x());
    let mut minus_z = Tensor::zeros(&[1]);
    crate::tensor::scale(&mut minus_z, c(-1.0, 0.0), &pauli_z());

    let mut w = Tensor::zeros(&[3, 3, 2, 2]);
    set_block(&mut w, 0, 0, &identity2());
    set_block(&mut w, 1, 0, &pauli_z());
    set_block(&mut w, 2, 0, &minus_hx);
    set_block(&mut w, 2, 1, &minus_z);
    set_block(&mut w, 2, 2, &identity2());

    new_mpo(&w, len)
}

/// The MPO of the total Z-axis magnetization on a chain of `len` sites.
pub fn magnetization_z(len: usize) -> Vec<Tensor> {
    let mut w = Tensor::zeros(&[2, 2, 2, 2]);
    set_block(&mut w, 0, 0, &identity2());
    set_block(&mut w, 1, 0, &pauli_z());
    set_block(&mut w, 1, 1, &identity2());

    new_mpo(&w, len)
}

fn set_block(w: &mut Tensor, i: usize, j: usize, op: &Tensor) {
    for a in 0..2 {
        for b in 0..2 {
            w.set_at(&[i, j, a, b], op.at(&[a, b]));
        }
    }
}

fn new_mpo(w: &Tensor, len: usize) -> Vec<Tensor> {
    assert!(len >= 2, "new_mpo: chain of length {len}");
    let (d0, d1) = (w.shape()[0] as isize, w.shape()[1] as isize);
    let mut mpo = Vec::with_capacity(len);

    // first site: the last row of w
    mpo.push(w.slice(&[[d0 - 1, d0], [0, d1], [0, 2], [0, 2]]));

    for _ in 0..len - 2 {
        mpo.push(w.clone());
    }

    // last site: the first column of w
    mpo.push(w.slice(&[[0, d0], [0, 1], [0, 2], [0, 2]]));

    mpo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mps::{ MPO_DOWN_AXIS, MPO_LEFT_AXIS, MPO_RIGHT_AXIS, MPO_UP_AXIS };

    #[test]
    fn mpo_shapes_and_boundaries() {
        let mpo = ising(5, c(1.0, 0.0));
        assert_eq!(mpo.len(), 5);
        assert_eq!(
            [
                mpo[0].shape()[MPO_LEFT_AXIS],
                mpo[0].shape()[MPO_RIGHT_AXIS],
                mpo[0].shape()[MPO_UP_AXIS],
                mpo[0].shape()[MPO_DOWN_AXIS],
            ],
            [1, 3, 2, 2],
        );
        assert_eq!(mpo[1].shape(), &[3, 3, 2, 2]);
        assert_eq!(mpo[4].shape(), &[3, 1, 2, 2]);

        // first site carries (-h X, -Z, I)
        assert_eq!(mpo[0].at(&[0, 0, 0, 1]), c(-1.0, 0.0)); // -h X off-diagonal
        assert_eq!(mpo[0].at(&[0, 1, 0, 0]), c(-1.0, 0.0)); // -Z
        assert_eq!(mpo[0].at(&[0, 2, 0, 0]), c(1.0, 0.0)); // I

        // last site carries (I, Z, -h X)^T
        assert_eq!(mpo[4].at(&[0, 0, 0, 0]), c(1.0, 0.0));
        assert_eq!(mpo[4].at(&[1, 0, 1, 1]), c(-1.0, 0.0)); // Z
        assert_eq!(mpo[4].at(&[2, 0, 1, 0]), c(-1.0, 0.0)); // -h X
    }

    #[test]
    fn paulis_square_to_identity() {
        let eye = identity2();
        for p in [pauli_x(), pauli_y(), pauli_z()] {
            let mut pp = Tensor::zeros(&[1]);
            crate::tensor::matmul(&mut pp, &p, &p);
            pp.close_to(&eye, 0.0).unwrap();
        }
    }
}
