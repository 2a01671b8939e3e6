//! Orthogonal factorizations: QR, LQ, Hessenberg reduction and Golub–Kahan
//! bidiagonalization.
//!
//! All routines work through caller-supplied scratch buffers and write their
//! results into the tensors they are handed; nothing is allocated inside the
//! reflector loops.
//!
//! References:
//!   - Sections 5.2, 5.4 and 7.4, Matrix Computations 4th Ed.,
//!     G. H. Golub, C. F. Van Loan.

use num_complex::Complex64 as C64;
use crate::house::householder;
use crate::tensor::Tensor;

// last column to reflect: for square matrices the final 1-vector reflector
// is skipped and the phase pass fixes the remaining diagonal
fn last_reflected(m: usize, n: usize) -> usize {
    if m > n { n } else { m - 1 }
}

// multiply row i of r and column i of q by the phase making r[i, i] real
// non-negative
fn fix_phases(r: &mut Tensor, q: &mut Tensor) {
    let (m, n) = (r.shape()[0], r.shape()[1]);
    let qm = q.shape()[0];
    for i in 0..m.min(n) {
        let rv = r.at(&[i, i]);
        if rv.norm() == 0.0 { continue; }
        let phs = rv.conj() / rv.norm();
        let mut row = r.slice(&[[i as isize, i as isize + 1], [0, n as isize]]);
        row.scale_by(phs);
        // the rotated pivot is |r[i, i]| up to roundoff; store it exactly real
        r.set_at(&[i, i], C64::new(rv.norm(), 0.0));
        let mut col = q.slice(&[[0, qm as isize], [i as isize, i as isize + 1]]);
        col.scale_by(phs.conj());
    }
}

/// Factor the `m`×`n` matrix `a` (`m >= n`) as `Q R` in place: on return `a`
/// holds the upper triangular `R` with real non-negative diagonal, and `q`
/// holds the full unitary `Q` with `Q R` equal to the original `a` within
/// `2 eps ||a||_F`.
pub fn qr_inplace(a: &mut Tensor, q: &mut Tensor, bufs: &mut [Tensor]) {
    let (m, n) = (a.shape()[0], a.shape()[1]);
    assert!(m >= n, "qr_inplace: matrix is wider than tall, {m} x {n}");
    factor_qr(a, q, bufs);
}

fn factor_qr(a: &mut Tensor, q: &mut Tensor, bufs: &mut [Tensor]) {
    let (m, n) = (a.shape()[0], a.shape()[1]);
    q.reset_eye(m, 0);
    bufs[0].reset(&[m, n]);

    for i in 0..last_reflected(m, n) {
        let (mi, ii) = (m as isize, i as isize);
        let ax = [[ii, mi], [ii, ii + 1]];
        let x = a.slice(&ax);
        let v = bufs[0].slice(&ax);
        let h = householder(v, &x, 0);

        let mut block = a.slice(&[[ii, mi], [ii, n as isize]]);
        h.apply_left(&mut block, &mut bufs[1]);
        a.set_at(&[i, i], C64::new(h.beta, 0.0));
        for r in i + 1..m {
            a.set_at(&[r, i], C64::new(0.0, 0.0));
        }

        let mut qblock = q.slice(&[[0, mi], [ii, mi]]);
        h.apply_right(&mut qblock, &mut bufs[1]);
    }

    fix_phases(a, q);
}

/// Factor `a` as `Q R`, overwriting the contents of `a` with `R` and writing
/// the economy-size `Q` into `q`. For tall `a` (`m > n`), `q` is `m`×`n` and
/// the returned `R` view is `n`×`n`; otherwise `q` is `m`×`m` and `R` is the
/// `m`×`n` upper trapezoid. The returned view shares `a`'s buffer.
pub fn qr(q: &mut Tensor, a: &Tensor, bufs: &mut [Tensor]) -> Tensor {
    let mut w = a.clone();
    let (m, n) = (w.shape()[0], w.shape()[1]);
    factor_qr(&mut w, q, bufs);
    if m > n {
        let (mi, ni) = (m as isize, n as isize);
        let econ = q.slice(&[[0, mi], [0, ni]]);
        q.reset_copy(&econ);
        w.slice(&[[0, ni], [0, ni]])
    } else {
        w
    }
}

/// Factor `a` as `L Q^H` with `L` lower triangular (or trapezoid), by way of
/// a QR factorization of `a^H`. The contents of `a` are consumed; on return
/// `a = L q^H` with `q^H q = I`.
pub fn lq(q: &mut Tensor, a: &Tensor, bufs: &mut [Tensor]) -> Tensor {
    let r = qr(q, &a.adjoint(), bufs);
    r.adjoint()
}

/// Reduce the square matrix `a` to upper Hessenberg form by a unitary
/// similarity, accumulating the transform into `q` (which is multiplied on
/// the right, not reset). On return every entry below the first subdiagonal
/// of `a` is exactly zero, the reflected subdiagonal entries are real, and
/// `q_new^H a_orig q_new = a` for the accumulated update.
pub fn hessenberg(a: &mut Tensor, q: &mut Tensor, bufs: &mut [Tensor]) {
    let m = a.shape()[0];
    assert_eq!(m, a.shape()[1], "hessenberg: matrix is not square: {:?}", a.shape());
    let mi = m as isize;
    for i in 1..m.saturating_sub(1) {
        let ii = i as isize;
        // note the column is i-1, one left of the QR pattern
        let x = a.slice(&[[ii, mi], [ii - 1, ii]]);
        bufs[0].reset(x.shape());
        let h = householder(bufs[0].clone(), &x, 0);

        let mut left = a.slice(&[[ii, mi], [ii - 1, mi]]);
        h.apply_left(&mut left, &mut bufs[1]);
        a.set_at(&[i, i - 1], C64::new(h.beta, 0.0));
        for r in i + 1..m {
            a.set_at(&[r, i - 1], C64::new(0.0, 0.0));
        }

        let mut right = a.slice(&[[0, mi], [ii, mi]]);
        h.apply_right(&mut right, &mut bufs[1]);
        let mut qblock = q.slice(&[[0, mi], [ii, mi]]);
        h.apply_right(&mut qblock, &mut bufs[1]);
    }
}

/// Golub–Kahan bidiagonalization of the `m`×`n` matrix `a` (`m >= n`), in
/// place: alternating left and right reflectors reduce `a` to an upper
/// bidiagonal with real entries on both kept diagonals, while `u` and `v`
/// accumulate the outer unitaries so that `u B v^H` equals the original `a`.
pub fn golub_kahan(a: &mut Tensor, u: &mut Tensor, v: &mut Tensor, bufs: &mut [Tensor]) {
    let (m, n) = (a.shape()[0], a.shape()[1]);
    assert!(m >= n, "golub_kahan: matrix is wider than tall, {m} x {n}");
    let (mi, ni) = (m as isize, n as isize);
    u.reset_eye(m, 0);
    v.reset_eye(n, 0);
    bufs[0].reset(&[m, n]);

    for j in 0..n {
        let ji = j as isize;
        let ax = [[ji, mi], [ji, ji + 1]];
        let x = a.slice(&ax);
        let hv = bufs[0].slice(&ax);
        let h = householder(hv, &x, 0);

        let mut block = a.slice(&[[ji, mi], [ji, ni]]);
        h.apply_left(&mut block, &mut bufs[1]);
        a.set_at(&[j, j], C64::new(h.beta, 0.0));
        for r in j + 1..m {
            a.set_at(&[r, j], C64::new(0.0, 0.0));
        }

        let mut ublock = u.slice(&[[0, mi], [ji, mi]]);
        h.apply_right(&mut ublock, &mut bufs[1]);

        if j + 1 < n {
            let ax = [[ji, ji + 1], [ji + 1, ni]];
            let x = a.slice(&ax).adjoint();
            let hv = bufs[0].slice(&ax).adjoint();
            let h = householder(hv, &x, 0);

            let mut block = a.slice(&[[ji, mi], [ji + 1, ni]]);
            h.apply_right(&mut block, &mut bufs[1]);
            a.set_at(&[j, j + 1], C64::new(h.beta, 0.0));
            for c in j + 2..n {
                a.set_at(&[j, c], C64::new(0.0, 0.0));
            }

            let mut vblock = v.slice(&[[0, ni], [ji + 1, ni]]);
            h.apply_right(&mut vblock, &mut bufs[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::EPSILON;
    use crate::tensor::{ matmul, t2, Tensor };

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    fn rand_mat(m: usize, n: usize, rng: &mut StdRng) -> Tensor {
        let mut a = Tensor::zeros(&[m, n]);
        a.randomize(rng);
        a
    }

    fn assert_unitary(q: &Tensor, tol: f64) {
        let mut qq = Tensor::zeros(&[1]);
        matmul(&mut qq, &q.adjoint(), q);
        let eye = Tensor::eye(qq.shape()[0], 0);
        qq.close_to(&eye, tol).unwrap();
    }

    #[test]
    fn qr_roundtrip() {
        let mut rng = StdRng::seed_from_u64(41);
        let mut bufs = [Tensor::zeros(&[1]), Tensor::zeros(&[1])];
        for (m, n) in [(1, 1), (3, 3), (5, 2), (16, 16), (16, 7)] {
            let orig = rand_mat(m, n, &mut rng);
            let mut a = Tensor::zeros(&[1]);
            a.reset_copy(&orig);
            let mut q = Tensor::zeros(&[1]);
            qr_inplace(&mut a, &mut q, &mut bufs);

            let norm = orig.frobenius_norm();
            let mut qr_prod = Tensor::zeros(&[1]);
            matmul(&mut qr_prod, &q, &a);
            qr_prod.close_to(&orig, 2.0 * EPSILON * norm).unwrap();
            assert_unitary(&q, 2.0 * EPSILON * m as f64);

            // R upper triangular with real non-negative diagonal
            for i in 0..m {
                for j in 0..n {
                    if j < i {
                        assert_eq!(a.at(&[i, j]), c(0.0, 0.0));
                    } else if j == i {
                        let d = a.at(&[i, j]);
                        assert!(d.im == 0.0 && d.re >= 0.0, "diag {d}");
                    }
                }
            }
        }
    }

    #[test]
    fn qr_economy_for_tall_matrices() {
        let mut rng = StdRng::seed_from_u64(43);
        let mut bufs = [Tensor::zeros(&[1]), Tensor::zeros(&[1])];
        let orig = rand_mat(8, 3, &mut rng);
        let mut a = Tensor::zeros(&[1]);
        a.reset_copy(&orig);
        let mut q = Tensor::zeros(&[1]);
        let r = qr(&mut q, &a, &mut bufs);
        assert_eq!(q.shape(), &[8, 3]);
        assert_eq!(r.shape(), &[3, 3]);
        assert_unitary(&q, 2.0 * EPSILON * 8.0);
        let mut qr_prod = Tensor::zeros(&[1]);
        matmul(&mut qr_prod, &q, &r);
        qr_prod.close_to(&orig, 2.0 * EPSILON * orig.frobenius_norm()).unwrap();
    }

    #[test]
    fn lq_reference_values() {
        // tabulated L factors; the second case exercises m > n
        let tests = [
            (
                t2(&[
                    &[c(1.0, 0.0), c(3.0, 0.0), c(5.0, 0.0), c(1.0, -3.0)],
                    &[c(1.0, 2.0), c(4.0, 0.0), c(6.0, 0.0), c(4.0, -1.0)],
                ]),
                t2(&[
                    &[c(6.7082, 0.0), c(0.0, 0.0)],
                    &[c(7.45356, 1.93793), c(3.83261, 0.0)],
                ]),
            ),
            (
                t2(&[
                    &[c(1.0, -1.0), c(-2.0, -7.0)],
                    &[c(5.0, -3.0), c(-4.0, 0.0)],
                    &[c(-1.0, 0.0), c(2.0, -1.0)],
                    &[c(4.0, 1.0), c(5.0, 0.0)],
                    &[c(3.0, 2.0), c(-1.0, -3.0)],
                ]),
                t2(&[
                    &[c(7.41619849, 0.0), c(0.0, 0.0)],
                    &[c(2.15743956, -3.50583928), c(5.74930826, 0.0)],
                    &[c(0.26967994, 2.02259959), c(-1.12898958, -0.74949728)],
                    &[c(-0.94387981, 5.3935989), c(3.12132412, 1.50848187)],
                    &[c(3.23615934, 0.53935989), c(1.37565957, 3.21619719)],
                ]),
            ),
        ];
        for (a, expected_l) in tests {
            let mut orig = Tensor::zeros(&[1]);
            orig.reset_copy(&a);
            let mut bufs = [Tensor::zeros(&[1]), Tensor::zeros(&[1])];
            let mut q = Tensor::zeros(&[1]);
            let l = lq(&mut q, &a, &mut bufs);

            let (m, n) = (orig.shape()[0], orig.shape()[1]);
            let expect_shape = if m < n { [m, m] } else { [m, n] };
            assert_eq!(l.shape(), &expect_shape);

            let norm = orig.frobenius_norm();
            let mut lqh = Tensor::zeros(&[1]);
            matmul(&mut lqh, &l, &q.adjoint());
            lqh.close_to(&orig, 2.0 * EPSILON * norm).unwrap();
            assert_unitary(&q, 2.0 * EPSILON * m as f64);
            // the tabulated factors carry six significant digits
            l.close_to(&expected_l, 1e-5).unwrap();
        }
    }

    #[test]
    fn hessenberg_form_and_similarity() {
        let mut rng = StdRng::seed_from_u64(47);
        let mut bufs = [Tensor::zeros(&[1]), Tensor::zeros(&[1])];
        for m in [2usize, 3, 8, 16] {
            let orig = rand_mat(m, m, &mut rng);
            let mut a = Tensor::zeros(&[1]);
            a.reset_copy(&orig);
            let mut q = Tensor::zeros(&[1]);
            q.reset_eye(m, 0);
            hessenberg(&mut a, &mut q, &mut bufs);

            // exactly zero below the first subdiagonal; the reflected
            // subdiagonal entries are real
            for i in 0..m {
                for j in 0..m {
                    if i > j + 1 {
                        assert_eq!(a.at(&[i, j]), c(0.0, 0.0));
                    } else if i == j + 1 && i + 1 < m {
                        assert_eq!(a.at(&[i, j]).im, 0.0);
                    }
                }
            }

            // q^H a_orig q = a
            let mut qa = Tensor::zeros(&[1]);
            matmul(&mut qa, &q.adjoint(), &orig);
            let mut qaq = Tensor::zeros(&[1]);
            matmul(&mut qaq, &qa, &q);
            qaq.close_to(&a, 10.0 * EPSILON * orig.frobenius_norm()).unwrap();
        }
    }

    #[test]
    fn golub_kahan_bidiagonalizes() {
        let mut rng = StdRng::seed_from_u64(53);
        let mut bufs = [Tensor::zeros(&[1]), Tensor::zeros(&[1])];
        for (m, n) in [(2, 2), (5, 5), (9, 4), (16, 16)] {
            let orig = rand_mat(m, n, &mut rng);
            let mut a = Tensor::zeros(&[1]);
            a.reset_copy(&orig);
            let mut u = Tensor::zeros(&[1]);
            let mut v = Tensor::zeros(&[1]);
            golub_kahan(&mut a, &mut u, &mut v, &mut bufs);

            for i in 0..m {
                for j in 0..n {
                    let x = a.at(&[i, j]);
                    if j == i || j == i + 1 {
                        assert_eq!(x.im, 0.0, "({i}, {j}) not real: {x}");
                    } else {
                        assert_eq!(x, c(0.0, 0.0), "({i}, {j}) not zero: {x}");
                    }
                }
            }

            // u B v^H = a_orig
            let mut ub = Tensor::zeros(&[1]);
            matmul(&mut ub, &u, &a);
            let mut ubv = Tensor::zeros(&[1]);
            matmul(&mut ubv, &ub, &v.adjoint());
            ubv.close_to(&orig, 10.0 * EPSILON * orig.frobenius_norm()).unwrap();
        }
    }
}
