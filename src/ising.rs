//! Transverse-field Ising Hamiltonians over the full 2^N dimensional basis,
//! as dense matrices and as a matrix-free operator, plus the magnetization
//! statistic of a dense state.
//!
//! Basis convention: basis state `b` encodes the lattice spins in binary
//! with site `(y, x)` at bit `N - 1 - (y n_1 + x)`, i.e. the first site is
//! the most significant bit, matching the Kronecker product order of the
//! dense assembly.

use log::warn;
use num_complex::Complex64 as C64;
use crate::arnoldi::LinearOp;
use crate::hamiltonian::{ identity2, pauli_x, pauli_z };
use crate::tensor::{ add, kron, Tensor };

/// Assemble the dense Hamiltonian of the transverse-field Ising model
///
/// ```text
/// H = -sum_{<i,j>} Z_i Z_j - h sum_i X_i
/// ```
///
/// on an `n[0]`×`n[1]` lattice with nearest-neighbor couplings, writing the
/// `2^N`×`2^N` matrix into `hamiltonian`. `buf` is scratch for the
/// Kronecker-product chains.
pub fn transverse_field_ising(hamiltonian: &mut Tensor, buf: &mut Tensor, n: [usize; 2], h: C64) {
    let spins = n[0] * n[1];
    let dim = 1usize << spins;
    hamiltonian.reset(&[dim, dim]);
    let mut tmp = Tensor::zeros(&[1]);

    let z = pauli_z();
    let x = pauli_x();
    let eye = identity2();

    for y in 0..n[0] {
        for x_ in 0..n[1] {
            if y >= 1 {
                // vertical bond
                kron_chain(buf, &mut tmp, n, |site| {
                    if site == (y - 1, x_) || site == (y, x_) { z.clone() } else { eye.clone() }
                });
                buf.scale_by(C64::new(-1.0, 0.0));
                let hc = hamiltonian.clone();
                add(hamiltonian, &hc, buf);
            }
            if x_ >= 1 {
                // horizontal bond
                kron_chain(buf, &mut tmp, n, |site| {
                    if site == (y, x_ - 1) || site == (y, x_) { z.clone() } else { eye.clone() }
                });
                buf.scale_by(C64::new(-1.0, 0.0));
                let hc = hamiltonian.clone();
                add(hamiltonian, &hc, buf);
            }

            // field term
            kron_chain(buf, &mut tmp, n, |site| {
                if site == (y, x_) { x.clone() } else { eye.clone() }
            });
            buf.scale_by(-h);
            let hc = hamiltonian.clone();
            add(hamiltonian, &hc, buf);
        }
    }
}

// out <- kron over all lattice sites of pick(site), ping-ponging between
// out and tmp
fn kron_chain(
    out: &mut Tensor,
    tmp: &mut Tensor,
    n: [usize; 2],
    pick: impl Fn((usize, usize)) -> Tensor,
) {
    out.reset(&[1, 1]);
    out.set_at(&[0, 0], C64::new(1.0, 0.0));
    let mut in_out = true;
    for y in 0..n[0] {
        for x in 0..n[1] {
            let m = pick((y, x));
            if in_out {
                kron(tmp, out, &m);
            } else {
                kron(out, tmp, &m);
            }
            in_out = !in_out;
        }
    }
    if !in_out {
        let t = tmp.clone();
        out.reset_copy(&t);
    }
}

/// The transverse-field Ising Hamiltonian as a matrix-free operator: the
/// coupling term is diagonal in the Z basis and the field term flips one
/// spin per column, so a matrix-vector product costs `O(2^N N)` without
/// ever materializing the matrix.
pub struct IsingOp {
    n: [usize; 2],
    h: C64,
    /// Spin-flip masks, one per lattice site.
    masks: Vec<usize>,
}

impl IsingOp {
    pub fn new(n: [usize; 2], h: C64) -> Self {
        let spins = n[0] * n[1];
        let masks = (0..spins).map(|site| 1usize << (spins - 1 - site)).collect();
        Self { n, h, masks }
    }

    // diagonal coupling coefficient of basis state `b`: -1 per aligned
    // nearest-neighbor pair, +1 per anti-aligned pair
    fn coupling(&self, b: usize) -> f64 {
        let [n0, n1] = self.n;
        let mut diag = 0.0f64;
        for y in 0..n0 {
            for x in 0..n1 {
                let spin = b & self.masks[y * n1 + x] != 0;
                if y >= 1 {
                    let other = b & self.masks[(y - 1) * n1 + x] != 0;
                    diag += if other == spin { -1.0 } else { 1.0 };
                }
                if x >= 1 {
                    let other = b & self.masks[y * n1 + x - 1] != 0;
                    diag += if other == spin { -1.0 } else { 1.0 };
                }
            }
        }
        diag
    }
}

impl LinearOp for IsingOp {
    fn nrows(&self) -> usize { 1 << (self.n[0] * self.n[1]) }

    fn apply(&self, dst: &mut Tensor, x: &Tensor) {
        let dim = self.nrows();
        assert_eq!(
            x.shape()[0], dim,
            "IsingOp: operand has {} rows, operator dimension is {dim}", x.shape()[0],
        );
        let cols = x.shape()[1];
        dst.reset(&[dim, cols]);
        for b in 0..dim {
            let diag = C64::new(self.coupling(b), 0.0);
            for c in 0..cols {
                let mut acc = diag * x.at(&[b, c]);
                for &mask in &self.masks {
                    acc -= self.h * x.at(&[b ^ mask, c]);
                }
                dst.set_at(&[b, c], acc);
            }
        }
    }

    fn frobenius_norm(&self) -> f64 {
        let dim = self.nrows();
        let spins = self.n[0] * self.n[1];
        let mut sum = 0.0f64;
        for b in 0..dim {
            let d = self.coupling(b);
            sum += d * d;
        }
        sum += (dim * spins) as f64 * self.h.norm_sqr();
        sum.sqrt()
    }
}

/// Mean |magnetization| per spin of a dense state over the computational
/// basis. Uses |M| rather than M because of finite-size effects.
pub fn magnetization(n: [usize; 2], state: &Tensor) -> f64 {
    let spins = n[0] * n[1];
    let dim = 1usize << spins;
    let flat = state.reshape(&[-1]);
    assert_eq!(
        flat.shape()[0], dim,
        "magnetization: state has {} amplitudes, expected {dim}", flat.shape()[0],
    );

    let mut total_prob = 0.0f64;
    let mut mean_m = 0.0f64;
    for b in 0..dim {
        let probability = flat.at(&[b]).norm_sqr();
        let ones = (b as u64).count_ones() as i64;
        let basis_m = (2 * ones - spins as i64).abs() as f64;
        total_prob += probability;
        mean_m += probability * basis_m;
    }
    // For large lattices and very unordered states, the probability mass
    // may drift from 1 through loss of precision; the distribution is then
    // almost uniform among the basis vectors.
    if (total_prob - 1.0).abs() > 1e-3 {
        warn!("probability not equal 1: {total_prob}");
        mean_m /= total_prob;
    }

    mean_m / spins as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::tensor::{ matmul, t2 };

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    #[test]
    fn dense_hamiltonian_4_spins() {
        let mut h = Tensor::zeros(&[1]);
        let mut buf = Tensor::zeros(&[1]);
        transverse_field_ising(&mut h, &mut buf, [4, 1], c(1.0, 0.0));
        assert_eq!(h.shape(), &[16, 16]);

        let rows: [[f64; 16]; 16] = [
            [-3.0, -1.0, -1.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [-1.0, -1.0, 0.0, -1.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [-1.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, -1.0, -1.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0],
            [-1.0, 0.0, 0.0, 0.0, 1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0],
            [0.0, -1.0, 0.0, 0.0, -1.0, 3.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0],
            [0.0, 0.0, -1.0, 0.0, -1.0, 0.0, 1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0],
            [0.0, 0.0, 0.0, -1.0, 0.0, -1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0],
            [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, -1.0, -1.0, 0.0, -1.0, 0.0, 0.0, 0.0],
            [0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 1.0, 0.0, -1.0, 0.0, -1.0, 0.0, 0.0],
            [0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 3.0, -1.0, 0.0, 0.0, -1.0, 0.0],
            [0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, -1.0, 1.0, 0.0, 0.0, 0.0, -1.0],
            [0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, -1.0, -1.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, -1.0, 1.0, 0.0, -1.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, -1.0, 0.0, -1.0, -1.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, -1.0, -1.0, -3.0],
        ];
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(h.at(&[i, j]), c(v, 0.0), "({i}, {j})");
            }
        }
    }

    #[test]
    fn matrix_free_operator_matches_dense() {
        let mut h = Tensor::zeros(&[1]);
        let mut buf = Tensor::zeros(&[1]);
        let n = [3, 2];
        transverse_field_ising(&mut h, &mut buf, n, c(0.7, 0.0));
        let op = IsingOp::new(n, c(0.7, 0.0));
        assert_eq!(op.nrows(), 64);

        let mut rng = StdRng::seed_from_u64(501);
        let mut x = Tensor::zeros(&[64, 3]);
        x.randomize(&mut rng);

        let mut dense = Tensor::zeros(&[1]);
        matmul(&mut dense, &h, &x);
        let mut free = Tensor::zeros(&[1]);
        op.apply(&mut free, &x);
        free.close_to(&dense, 1e-4).unwrap();

        assert!(
            (LinearOp::frobenius_norm(&op) - h.frobenius_norm()).abs()
                <= 1e-3 * h.frobenius_norm(),
        );
    }

    #[test]
    fn magnetization_of_product_states() {
        // all spins up
        let mut state = Tensor::zeros(&[16]);
        state.set_at(&[0], c(1.0, 0.0));
        assert_eq!(magnetization([4, 1], &state), 1.0);

        // two up, two down
        let mut state = Tensor::zeros(&[16]);
        state.set_at(&[0b0011], c(1.0, 0.0));
        assert_eq!(magnetization([4, 1], &state), 0.0);

        // equal mix of aligned states
        let mut state = Tensor::zeros(&[16]);
        let r = 0.5f64.sqrt();
        state.set_at(&[0b0000], c(r, 0.0));
        state.set_at(&[0b1111], c(0.0, r));
        let m = magnetization([4, 1], &state);
        assert_abs_diff_eq!(m, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn kron_chain_builds_operators() {
        // Z on site 0 of 2 spins: diag(1, 1, -1, -1)
        let z = pauli_z();
        let eye = identity2();
        let mut out = Tensor::zeros(&[1]);
        let mut tmp = Tensor::zeros(&[1]);
        kron_chain(&mut out, &mut tmp, [2, 1], |site| {
            if site == (0, 0) { z.clone() } else { eye.clone() }
        });
        let expected = t2(&[
            &[c(1.0, 0.0), c(0.0, 0.0), c(0.0, 0.0), c(0.0, 0.0)],
            &[c(0.0, 0.0), c(1.0, 0.0), c(0.0, 0.0), c(0.0, 0.0)],
            &[c(0.0, 0.0), c(0.0, 0.0), c(-1.0, 0.0), c(0.0, 0.0)],
            &[c(0.0, 0.0), c(0.0, 0.0), c(0.0, 0.0), c(-1.0, 0.0)],
        ]);
        out.close_to(&expected, 0.0).unwrap();
    }
}
