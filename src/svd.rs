//! Singular value decomposition by Golub–Kahan bidiagonalization and
//! implicit QR on the bidiagonal with zero-shift safeguards.
//!
//! References:
//!   - Section 8.6, Matrix Computations 4th Ed., G. H. Golub, C. F. Van Loan.
//!   - Accurate Singular Values of Bidiagonal Matrices,
//!     James Demmel and W. Kahan.

use num_complex::Complex64 as C64;
use thiserror::Error;
use crate::EPSILON;
use crate::decomp::golub_kahan;
use crate::eig::{ sort_eigen, wilkinson_shift };
use crate::house::givens;
use crate::tensor::{ matmul, Tensor };

#[derive(Debug, Error)]
pub enum SvdError {
    /// The bidiagonal QR iteration hit its sweep cap. `off` is the stuck
    /// superdiagonal entry and `diag` the magnitude of its neighbors.
    #[error("SVD iteration not converged: |off| = {off}, diag = {diag} (ratio {ratio})")]
    NotConverged { ratio: f64, off: f64, diag: f64 },
}
pub type SvdResult<T> = Result<T, SvdError>;

/// Compute the singular value decomposition of `s` in place: on return the
/// leading diagonal of `s` carries the singular values, non-negative and
/// sorted descending, with unitary `u` and `v` such that `u diag(s) v^H`
/// reconstructs the original matrix. Matrices wider than tall are handled
/// through the conjugate transpose, swapping the roles of `u` and `v`.
pub fn svd(s: &mut Tensor, u: &mut Tensor, v: &mut Tensor, bufs: &mut [Tensor]) -> SvdResult<()> {
    let (m, n) = (s.shape()[0], s.shape()[1]);
    if m >= n {
        svd_tall(&mut s.clone(), u, v, bufs)
    } else {
        svd_tall(&mut s.adjoint(), v, u, bufs)
    }
}

fn svd_tall(
    s: &mut Tensor,
    u: &mut Tensor,
    v: &mut Tensor,
    bufs: &mut [Tensor],
) -> SvdResult<()> {
    let tol = 10.0f64.max(100.0f64.min(EPSILON.powf(-1.0 / 8.0))) * EPSILON;

    let (m, n) = (s.shape()[0], s.shape()[1]);
    let (mi, ni) = (m as isize, n as isize);
    golub_kahan(s, u, v, bufs);
    let mut b = s.slice(&[[0, ni], [0, ni]]);
    b.triu(0).tril(1);

    let (smin, _) = calc_smin_max(&b);
    let thresh = EPSILON * smin / (n as f64).sqrt();

    loop {
        let (p, q) = find_bidiagonal(&mut b, tol, thresh);
        if q == n { break; }
        let (pi, nqi) = (p as isize, (n - q) as isize);
        let mut b22 = b.slice(&[[pi, nqi], [pi, nqi]]);
        let bm = b22.shape()[0];

        // closed form for 2x2 blocks
        if bm == 2 {
            bufs[0].reset(&[4, 2]);
            let mut u22 = bufs[0].slice(&[[0, 2], [0, 2]]);
            let mut v22 = bufs[0].slice(&[[2, 4], [0, 2]]);
            svd22(&mut b22, &mut u22, &mut v22);
            let mut u2 = u.slice(&[[0, mi], [pi, nqi]]);
            matmul(&mut bufs[1], &u2, &u22);
            u2.set(&[0, 0], &bufs[1]);
            let mut v2 = v.slice(&[[0, ni], [pi, nqi]]);
            matmul(&mut bufs[1], &v2, &v22);
            v2.set(&[0, 0], &bufs[1]);
            continue;
        }

        let (smin22, smax22) = calc_smin_max(&b22);

        let mut converged = false;
        for _ in 0..(n - p - q).max(32) {
            // shift from the trailing 2x2 of b22^H b22, Wilkinson rule
            bufs[0].reset(&[2, 2]);
            for (ti, i) in [(0usize, bm - 2), (1, bm - 1)] {
                for (tj, j) in [(0usize, bm - 2), (1, bm - 1)] {
                    bufs[0].set_at(&[ti, tj], col_dot(&b22, i, j));
                }
            }
            let mut shift = wilkinson_shift(&bufs[0]);
            // zero-shift when shifting would ruin relative accuracy
            if (n as f64) * tol * (smin22 / smax22) < EPSILON.max(0.01 * tol) {
                shift = C64::new(0.0, 0.0);
            }

            let mut y = col_dot(&b22, 0, 0) - shift;
            let mut z = col_dot(&b22, 0, 1);
            for k in 0..bm - 1 {
                let (ki, bmi) = (k as isize, bm as isize);

                // right rotation removes the top-right bulge
                let g = givens(y.conj(), z.conj(), k, k + 1);
                let mut rows = b22.slice(&[[ki, ki + 2], [0, bmi]]);
                g.apply_right(&mut rows);
                if k > 0 {
                    b22.set_at(&[k - 1, k], g.r);
                    b22.set_at(&[k - 1, k + 1], C64::new(0.0, 0.0));
                }
                let mut vblk = v.slice(&[[0, ni], [pi, nqi]]);
                g.apply_right(&mut vblk);

                // left rotation removes the bottom-left bulge
                y = b22.at(&[k, k]);
                z = b22.at(&[k + 1, k]);
                let g = givens(y, z, k, k + 1);
                let mut cols = b22.slice(&[[0, bmi], [ki + 1, (k + 3).min(bm) as isize]]);
                g.apply_left(&mut cols);
                b22.set_at(&[k, k], g.r);
                b22.set_at(&[k + 1, k], C64::new(0.0, 0.0));
                let mut ublk = u.slice(&[[0, mi], [pi, nqi]]);
                g.apply_right(&mut ublk);

                if k + 2 < bm {
                    y = b22.at(&[k, k + 1]);
                    z = b22.at(&[k, k + 2]);
                }
            }

            let (p22, q22) = find_bidiagonal(&mut b22, tol, thresh);
            if !(p22 == 0 && q22 == 0) {
                converged = true;
                break;
            }
        }
        if !converged {
            let off = b22.at(&[bm - 2, bm - 1]).norm();
            let diag = b22.at(&[bm - 2, bm - 2]).norm() + b22.at(&[bm - 1, bm - 1]).norm();
            return Err(SvdError::NotConverged { ratio: off / EPSILON / diag, off, diag });
        }
    }

    // absorb signs into u so the singular values are non-negative
    for i in 0..n {
        let sii = s.at(&[i, i]);
        if sii.re < 0.0 {
            s.set_at(&[i, i], -sii);
            let mut ui = u.slice(&[[0, mi], [i as isize, i as isize + 1]]);
            ui.scale_by(C64::new(-1.0, 0.0));
        }
    }

    // sort descending, permuting u and v in lockstep
    bufs[0].reset(&[n]);
    for i in 0..n {
        bufs[0].set_at(&[i], s.at(&[i, i]));
    }
    let (sdiag, rest) = bufs.split_at_mut(1);
    sort_eigen(&mut sdiag[0], Some(u), Some(v), |x, y| y.re.total_cmp(&x.re), &mut rest[0]);
    for i in 0..n {
        s.set_at(&[i, i], sdiag[0].at(&[i]));
    }

    Ok(())
}

// (b^H b)[i, j] over the columns of b
fn col_dot(b: &Tensor, i: usize, j: usize) -> C64 {
    let rows = b.shape()[0];
    let mut sum = C64::new(0.0, 0.0);
    for l in 0..rows {
        sum += b.at(&[l, i]).conj() * b.at(&[l, j]);
    }
    sum
}

/// Closed-form SVD of a real upper triangular 2×2 block: overwrites `b` with
/// `diag(s1, s2)`, `s1 >= s2 >= 0`, and writes the rotations into `u` and
/// `v` so that the original block equals `u diag(s) v^H`.
fn svd22(b: &mut Tensor, u: &mut Tensor, v: &mut Tensor) {
    let f = b.at(&[0, 0]).re;
    let g = b.at(&[0, 1]).re;
    let h = b.at(&[1, 1]).re;

    // eigen decomposition of B^T B = [[f^2, f g], [f g, g^2 + h^2]]
    let m00 = f * f;
    let m01 = f * g;
    let m11 = g * g + h * h;
    let tr2 = 0.5 * (m00 + m11);
    let disc = (0.25 * (m00 - m11) * (m00 - m11) + m01 * m01).sqrt();
    let l1 = tr2 + disc;

    // right singular vector for the larger eigenvalue, choosing the better
    // conditioned of the two component formulas
    let (ca, sa) = (m01, l1 - m00);
    let (cb, sb) = (l1 - m11, m01);
    let (mut vx, mut vy) = if ca * ca + sa * sa >= cb * cb + sb * sb {
        (ca, sa)
    } else {
        (cb, sb)
    };
    let vn = (vx * vx + vy * vy).sqrt();
    if vn == 0.0 {
        vx = 1.0;
        vy = 0.0;
    } else {
        vx /= vn;
        vy /= vn;
    }

    // u_i = B v_i / s_i
    let (b1x, b1y) = (f * vx + g * vy, h * vy);
    let s1 = (b1x * b1x + b1y * b1y).sqrt();
    let (u1x, u1y) = if s1 > 0.0 { (b1x / s1, b1y / s1) } else { (1.0, 0.0) };
    let (b2x, b2y) = (f * -vy + g * vx, h * vx);
    let s2 = (b2x * b2x + b2y * b2y).sqrt();
    let (u2x, u2y) = if s2 > 0.0 { (b2x / s2, b2y / s2) } else { (-u1y, u1x) };

    b.set_at(&[0, 0], C64::new(s1, 0.0));
    b.set_at(&[0, 1], C64::new(0.0, 0.0));
    b.set_at(&[1, 0], C64::new(0.0, 0.0));
    b.set_at(&[1, 1], C64::new(s2, 0.0));
    u.set_at(&[0, 0], C64::new(u1x, 0.0));
    u.set_at(&[1, 0], C64::new(u1y, 0.0));
    u.set_at(&[0, 1], C64::new(u2x, 0.0));
    u.set_at(&[1, 1], C64::new(u2y, 0.0));
    v.set_at(&[0, 0], C64::new(vx, 0.0));
    v.set_at(&[1, 0], C64::new(vy, 0.0));
    v.set_at(&[0, 1], C64::new(-vy, 0.0));
    v.set_at(&[1, 1], C64::new(vx, 0.0));
}

/// Lower and upper singular value estimates of an upper bidiagonal matrix by
/// the Demmel–Kahan recurrence (Equation 2.4 of the paper).
fn calc_smin_max(a: &Tensor) -> (f64, f64) {
    let n = a.shape()[1];
    let mut smax = a.at(&[0, 0]).norm();
    for j in 1..n {
        smax = smax.max(a.at(&[j, j]).norm()).max(a.at(&[j - 1, j]).norm());
    }

    let mut mu = a.at(&[0, 0]).norm();
    let mut smin = mu;
    for j in 1..n {
        mu = a.at(&[j, j]).norm() * (mu / (mu + a.at(&[j - 1, j]).norm()));
        smin = smin.min(mu);
    }

    (smin, smax)
}

/// Find the largest trailing unreduced bidiagonal block, zeroing
/// superdiagonal entries under the relative tolerance or the absolute
/// threshold floor. Returns `(p, q)` with rows `p..m-q` unreduced.
fn find_bidiagonal(a: &mut Tensor, tol: f64, thresh: f64) -> (usize, usize) {
    let m = a.shape()[0];
    let zero = C64::new(0.0, 0.0);
    for i in 0..m.saturating_sub(1) {
        let f = a.at(&[i, i + 1]).norm();
        let d = a.at(&[i, i]).norm() + a.at(&[i + 1, i + 1]).norm();
        if f < tol * d || f < thresh {
            a.set_at(&[i, i + 1], zero);
        }
    }

    let mut q = m;
    if m >= 2 {
        for i in (0..=m - 2).rev() {
            if a.at(&[i, i + 1]) != zero {
                q = m - 2 - i;
                break;
            }
        }
    }

    let mut p = 0;
    if q < m {
        let top = (m - 2 - q) as isize - 1;
        let mut i = top;
        while i >= 0 {
            if a.at(&[i as usize, i as usize + 1]) == zero {
                p = i as usize + 1;
                break;
            }
            i -= 1;
        }
    }

    (p, q)
}
