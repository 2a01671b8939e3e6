//! Householder reflectors and Givens rotations.
//!
//! These are the orthogonal building blocks of every factorization in the
//! crate. A [`Householder`] maps a chosen column vector onto a coordinate
//! axis; a [`Givens`] rotation zeroes a single element against another. Both
//! are applied in place to sub-blocks of larger matrices.
//!
//! References:
//!   - Section 5.1, Matrix Computations 4th Ed., G. H. Golub, C. F. Van Loan.

use num_complex::Complex64 as C64;
use crate::tensor::{ matmul, Tensor };

/// A Householder reflection `H = I - tau v v^H`, constructed so that
/// `H x = beta e_k` with `beta` real non-negative and `|beta| = ||x||`.
pub struct Householder {
    v: Tensor, // column vector, caller-provided storage
    /// The real non-negative image coefficient, `H x = beta e_k`.
    pub beta: f64,
    tau: C64,
}

/// Build a reflector from the column vector `x` and the target index `k`.
///
/// `v` is caller-provided storage of the same shape as `x`; the reflector
/// borrows it for its lifetime. When `x` is already a non-negative multiple
/// of `e_k`, the reflector degenerates to the identity.
pub fn householder(mut v: Tensor, x: &Tensor, k: usize) -> Householder {
    assert_eq!(
        x.rank(), 2,
        "householder: x must be a column vector, got rank {}", x.rank(),
    );
    assert_eq!(x.shape()[1], 1, "householder: x must have one column");
    assert_eq!(v.shape(), x.shape(), "householder: v and x shapes differ");
    let m = x.shape()[0];

    let beta = x.frobenius_norm();
    let xk = x.at(&[k, 0]);
    // sum |x_i|^2 over i != k, used for the cancellation-free form of v_k
    let sigma2 = (beta * beta - xk.norm_sqr()).max(0.0);

    for i in 0..m {
        v.set_at(&[i, 0], x.at(&[i, 0]));
    }
    if beta == 0.0 || (sigma2 == 0.0 && xk.im == 0.0 && xk.re >= 0.0) {
        // x is already beta e_k
        v.fill(C64::new(0.0, 0.0));
        return Householder { v, beta, tau: C64::new(0.0, 0.0) };
    }

    // v = x - beta e_k; when Re(x_k) > 0 the direct difference cancels, so
    // use v_k = (-sigma^2 + 2i beta Im(x_k)) / (conj(x_k) + beta) instead
    let vk = if xk.re > 0.0 {
        C64::new(-sigma2, 2.0 * beta * xk.im) / (xk.conj() + beta)
    } else {
        xk - beta
    };
    v.set_at(&[k, 0], vk);

    // H x = beta e_k requires tau = 1 / (v^H x) = -1 / (beta conj(v_k))
    let tau = -C64::new(1.0, 0.0) / (beta * vk.conj());
    Householder { v, beta, tau }
}

impl Householder {
    /// Overwrite `m` with `H m`, using `buf` as scratch for the row of inner
    /// products. The row count of `m` must match the reflector's dimension.
    pub fn apply_left(&self, m: &mut Tensor, buf: &mut Tensor) {
        if self.tau == C64::new(0.0, 0.0) { return; }
        matmul(buf, &self.v.adjoint(), m); // 1 x n
        let rows = m.shape()[0];
        let cols = m.shape()[1];
        for j in 0..cols {
            let w = self.tau * buf.at(&[0, j]);
            for i in 0..rows {
                let mij = m.at(&[i, j]) - w * self.v.at(&[i, 0]);
                m.set_at(&[i, j], mij);
            }
        }
    }

    /// Overwrite `m` with `m H^H`, the adjoint applied from the right. This
    /// pairs with [`apply_left`][Self::apply_left] for similarity transforms
    /// and for accumulating the unitary factor of a factorization. The
    /// column count of `m` must match the reflector's dimension.
    pub fn apply_right(&self, m: &mut Tensor, buf: &mut Tensor) {
        if self.tau == C64::new(0.0, 0.0) { return; }
        matmul(buf, m, &self.v); // rows x 1
        let rows = m.shape()[0];
        let cols = m.shape()[1];
        let tbar = self.tau.conj();
        for i in 0..rows {
            let w = tbar * buf.at(&[i, 0]);
            for j in 0..cols {
                let mij = m.at(&[i, j]) - w * self.v.at(&[j, 0]).conj();
                m.set_at(&[i, j], mij);
            }
        }
    }
}

/// A Givens rotation on index pair `(i, j)`:
///
/// ```text
/// [ c       s ] [ y ]   [ r ]
/// [ -s~  c~   ] [ z ] = [ 0 ]
/// ```
///
/// with `|c|^2 + |s|^2 = 1` (`~` denotes conjugation).
pub struct Givens {
    pub c: C64,
    pub s: C64,
    pub r: C64,
    pub i: usize,
    pub j: usize,
}

/// Construct the rotation zeroing `z` against `y`.
pub fn givens(y: C64, z: C64, i: usize, j: usize) -> Givens {
    if z == C64::new(0.0, 0.0) {
        return Givens { c: C64::new(1.0, 0.0), s: C64::new(0.0, 0.0), r: y, i, j };
    }
    if y == C64::new(0.0, 0.0) {
        let zn = z.norm();
        return Givens {
            c: C64::new(0.0, 0.0),
            s: z.conj() / zn,
            r: C64::new(zn, 0.0),
            i,
            j,
        };
    }
    let yn = y.norm();
    let d = (yn * yn + z.norm_sqr()).sqrt();
    let phase = y / yn;
    Givens {
        c: C64::new(yn / d, 0.0),
        s: phase * z.conj() / d,
        r: phase * d,
        i,
        j,
    }
}

impl Givens {
    /// Rotate rows `i` and `j` of `m`: `m <- G m` restricted to that pair.
    pub fn apply_left(&self, m: &mut Tensor) {
        let cols = m.shape()[1];
        for col in 0..cols {
            let y = m.at(&[self.i, col]);
            let z = m.at(&[self.j, col]);
            m.set_at(&[self.i, col], self.c * y + self.s * z);
            m.set_at(&[self.j, col], -self.s.conj() * y + self.c.conj() * z);
        }
    }

    /// Rotate columns `i` and `j` of `m` with the adjoint rotation:
    /// `m <- m G^H` restricted to that pair. This pairs with
    /// [`apply_left`][Self::apply_left] when accumulating unitary factors.
    pub fn apply_right(&self, m: &mut Tensor) {
        let rows = m.shape()[0];
        for row in 0..rows {
            let y = m.at(&[row, self.i]);
            let z = m.at(&[row, self.j]);
            m.set_at(&[row, self.i], self.c.conj() * y + self.s.conj() * z);
            m.set_at(&[row, self.j], -self.s * y + self.c * z);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use crate::EPSILON;

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    fn rand_col(m: usize, rng: &mut StdRng) -> Tensor {
        let mut x = Tensor::zeros(&[m, 1]);
        x.randomize(rng);
        x
    }

    #[test]
    fn householder_maps_to_axis() {
        let mut rng = StdRng::seed_from_u64(11);
        for m in [1usize, 2, 5, 9] {
            for k in [0usize, m / 2] {
                let x = rand_col(m, &mut rng);
                let norm = x.frobenius_norm();
                let v = Tensor::zeros(&[m, 1]);
                let h = householder(v, &x, k);
                assert_abs_diff_eq!(h.beta, norm, epsilon = 4.0 * EPSILON * norm.max(1.0));

                let mut hx = Tensor::zeros(&[1]);
                hx.reset_copy(&x);
                let mut buf = Tensor::zeros(&[1]);
                h.apply_left(&mut hx, &mut buf);
                for i in 0..m {
                    let expected = if i == k { c(h.beta, 0.0) } else { c(0.0, 0.0) };
                    assert!(
                        (hx.at(&[i, 0]) - expected).norm() <= 16.0 * EPSILON * norm.max(1.0),
                        "m = {m}, k = {k}, i = {i}: {} vs {}", hx.at(&[i, 0]), expected,
                    );
                }
            }
        }
    }

    #[test]
    fn householder_handles_aligned_input() {
        // x already along e_0 with a positive real coefficient
        let mut x = Tensor::zeros(&[3, 1]);
        x.set_at(&[0, 0], c(2.5, 0.0));
        let h = householder(Tensor::zeros(&[3, 1]), &x, 0);
        let mut m = Tensor::zeros(&[3, 3]);
        let mut rng = StdRng::seed_from_u64(3);
        m.randomize(&mut rng);
        let mut orig = Tensor::zeros(&[1]);
        orig.reset_copy(&m);
        let mut buf = Tensor::zeros(&[1]);
        h.apply_left(&mut m, &mut buf);
        m.close_to(&orig, 0.0).unwrap();
    }

    #[test]
    fn householder_apply_right_is_adjoint() {
        let mut rng = StdRng::seed_from_u64(23);
        let m = 6;
        let x = rand_col(m, &mut rng);
        let h = householder(Tensor::zeros(&[m, 1]), &x, 0);

        // (H a)^H = a^H H^H: left-apply to a copy, right-apply to the
        // adjoint, compare
        let mut a = Tensor::zeros(&[m, m]);
        a.randomize(&mut rng);
        let mut left = Tensor::zeros(&[1]);
        left.reset_copy(&a);
        let mut buf = Tensor::zeros(&[1]);
        h.apply_left(&mut left, &mut buf);

        let mut right = Tensor::zeros(&[1]);
        right.reset_copy(&a.adjoint());
        h.apply_right(&mut right, &mut buf);

        right.adjoint().close_to(&left, 16.0 * EPSILON * a.frobenius_norm()).unwrap();
    }

    #[test]
    fn givens_zeroes_and_preserves_norm() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..32 {
            let y = c(rng.gen::<f64>() * 2.0 - 1.0, rng.gen::<f64>() * 2.0 - 1.0);
            let z = c(rng.gen::<f64>() * 2.0 - 1.0, rng.gen::<f64>() * 2.0 - 1.0);
            let g = givens(y, z, 0, 1);
            // unitarity
            assert!((g.c.norm_sqr() + g.s.norm_sqr() - 1.0).abs() < 8.0 * EPSILON);
            // action on (y, z)
            let top = g.c * y + g.s * z;
            let bot = -g.s.conj() * y + g.c.conj() * z;
            let mag = (y.norm_sqr() + z.norm_sqr()).sqrt();
            assert!((top - g.r).norm() <= 8.0 * EPSILON * mag.max(1.0));
            assert!(bot.norm() <= 8.0 * EPSILON * mag.max(1.0));
        }
    }

    #[test]
    fn givens_left_right_roundtrip() {
        // G I G^H = I: a left apply followed by a right apply on the
        // identity recombines to the identity
        let g = givens(c(0.6, 0.3), c(-0.2, 0.7), 0, 1);
        let mut m = Tensor::eye(2, 0);
        g.apply_left(&mut m);
        g.apply_right(&mut m);
        m.close_to(&Tensor::eye(2, 0), 8.0 * EPSILON).unwrap();
    }
}
