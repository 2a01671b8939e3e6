//! Dense eigensolver for general complex matrices.
//!
//! The pipeline is the non-symmetric QR algorithm: diagonal balancing, a
//! Hessenberg reduction, shifted QR iterations with deflation, and
//! back-substitution on the resulting triangular factor for the
//! eigenvectors. Eigenvalues are returned sorted ascending by real part with
//! eigenvectors permuted in lockstep.
//!
//! References:
//!   - Sections 7.5 and 7.6, Matrix Computations 4th Ed.,
//!     G. H. Golub, C. F. Van Loan.
//!   - On Matrix Balancing and Eigenvector Computation,
//!     R. James, J. Langou, B. R. Lowery.

use std::cmp::Ordering;
use num_complex::Complex64 as C64;
use thiserror::Error;
use crate::EPSILON;
use crate::decomp::{ hessenberg, qr_inplace };
use crate::house::givens;
use crate::tensor::{ matmul, Tensor };

#[derive(Debug, Error)]
pub enum EigError {
    /// The shifted QR iteration hit its sweep cap on an unreduced block.
    /// `(p, q)` locate the block; `subdiag` is its last subdiagonal entry.
    #[error("QR iteration not converged on block ({p}, {q}), last subdiagonal {subdiag}")]
    NotConverged { p: usize, q: usize, subdiag: C64 },

    /// Inverse iteration hit its step cap before the residual bound.
    #[error("inverse iteration not converged: residual {residual} > {bound}")]
    InverseIterationNotConverged { residual: f64, bound: f64 },
}
pub type EigResult<T> = Result<T, EigError>;

/// Options for [`Eig::solve_with`].
#[derive(Copy, Clone, Debug)]
pub struct EigOptions {
    /// Compute eigenvectors in addition to eigenvalues.
    pub vectors: bool,
}

impl Default for EigOptions {
    fn default() -> Self { Self { vectors: true } }
}

/// Workspace for the dense eigensolver. All scratch tensors are owned by the
/// solver and reused across calls; the views returned by
/// [`solve`][Self::solve] stay valid until the next call.
pub struct Eig {
    eigvals: Tensor,
    eigvecs: Tensor,
    a: Tensor,
    q: Tensor,
    bufs: [Tensor; 2],
}

impl Default for Eig {
    fn default() -> Self { Self::new() }
}

impl Eig {
    pub fn new() -> Self {
        Self {
            eigvals: Tensor::zeros(&[1]),
            eigvecs: Tensor::zeros(&[1]),
            a: Tensor::zeros(&[1]),
            q: Tensor::zeros(&[1]),
            bufs: [Tensor::zeros(&[1]), Tensor::zeros(&[1])],
        }
    }

    /// Compute all eigenpairs of the square matrix `a`.
    ///
    /// Returns `(eigvals, eigvecs)` where `eigvals` holds the eigenvalues
    /// sorted ascending by real part and column `i` of `eigvecs` is the unit
    /// eigenvector of `eigvals[i]`. Both are views of solver-owned storage.
    pub fn solve(&mut self, a: &Tensor) -> EigResult<(Tensor, Tensor)> {
        self.solve_with(a, EigOptions::default())
    }

    /// Like [`solve`][Self::solve], with explicit options.
    pub fn solve_with(&mut self, a: &Tensor, opt: EigOptions) -> EigResult<(Tensor, Tensor)> {
        self.reduce(a, opt)?;
        sort_eigen(
            &mut self.eigvals,
            Some(&mut self.eigvecs),
            None,
            |x, y| x.re.total_cmp(&y.re),
            &mut self.bufs[0],
        );
        Ok((self.eigvals.clone(), self.eigvecs.clone()))
    }

    fn reduce(&mut self, a: &Tensor, opt: EigOptions) -> EigResult<()> {
        let m = a.shape()[0];
        assert_eq!(m, a.shape()[1], "eig: matrix is not square: {:?}", a.shape());
        let mi = m as isize;
        self.a.reset_copy(a);
        balance(&mut self.a, &mut self.q);
        hessenberg(&mut self.a, &mut self.q, &mut self.bufs);

        loop {
            let (p, q) = find_unreduced_hessenberg(&mut self.a);
            if q == m { break; }
            let (pi, mqi) = (p as isize, (m - q) as isize);
            let mut h22 = self.a.slice(&[[pi, mqi], [pi, mqi]]);
            let hm = h22.shape()[0];

            let mut converged = false;
            for _ in 0..32 {
                let shift = wilkinson_shift(&h22);

                // implicit QR step: subtract the shift, re-Hessenbergify by
                // a bulge chase, add the shift back
                for d in 0..hm {
                    h22.set_at(&[d, d], h22.at(&[d, d]) - shift);
                }
                chase_bulge_hessenberg(&mut h22, &mut self.eigvecs, &mut self.eigvals);
                for d in 0..hm {
                    h22.set_at(&[d, d], h22.at(&[d, d]) + shift);
                }

                if opt.vectors {
                    // drag the off-block rows and the accumulated basis along
                    if p > 0 {
                        let mut h12 = self.a.slice(&[[0, pi], [pi, mqi]]);
                        matmul(&mut self.bufs[0], &h12, &self.eigvecs);
                        h12.set(&[0, 0], &self.bufs[0]);
                    }
                    if q > 0 {
                        let mut h23 = self.a.slice(&[[pi, mqi], [mqi, mi]]);
                        matmul(&mut self.bufs[0], &self.eigvecs.adjoint(), &h23);
                        h23.set(&[0, 0], &self.bufs[0]);
                    }
                    let mut q2 = self.q.slice(&[[0, mi], [pi, mqi]]);
                    matmul(&mut self.bufs[0], &q2, &self.eigvecs);
                    q2.set(&[0, 0], &self.bufs[0]);
                }

                let (p22, q22) = find_unreduced_hessenberg(&mut h22);
                if !(p22 == 0 && q22 == 0) {
                    converged = true;
                    break;
                }
            }
            if !converged {
                return Err(EigError::NotConverged {
                    p,
                    q,
                    subdiag: h22.at(&[hm - 1, hm - 2]),
                });
            }
        }

        // collect eigenvalues from the triangular diagonal
        self.eigvals.reset(&[m]);
        self.eigvecs.reset(&[m, m]);
        for i in 0..m {
            let aii = self.a.at(&[i, i]);
            self.eigvals.set_at(&[i], aii);
        }
        if !opt.vectors {
            return Ok(());
        }

        // null-space vectors of (a - lambda_i I) by back-substitution
        self.bufs[0].reset_copy(&self.a);
        self.bufs[1].reset(&[m, 1]);
        for i in 0..m {
            let lambda = self.a.at(&[i, i]);
            for j in 0..m {
                self.bufs[0].set_at(&[j, j], self.a.at(&[j, j]) - lambda);
            }
            let mut vec = self.eigvecs.slice(&[[0, mi], [i as isize, i as isize + 1]]);
            back_substitution(&mut vec, &self.bufs[0], &self.bufs[1], Some(i));
        }

        // transform to the original basis and normalize
        matmul(&mut self.bufs[0], &self.q, &self.eigvecs);
        self.eigvecs.set(&[0, 0], &self.bufs[0]);
        for j in 0..m {
            let mut col = self.eigvecs.slice(&[[0, mi], [j as isize, j as isize + 1]]);
            let norm = col.frobenius_norm();
            col.scale_by(C64::new(1.0 / norm, 0.0));
        }

        Ok(())
    }

    /// Compute the eigenpair whose eigenvalue lies closest to `mu`, by
    /// inverse iteration on the QR factors of `a - mu I`. Returns the
    /// Rayleigh-quotient refined eigenvalue and the unit eigenvector.
    ///
    /// See Section 7.6.1, Matrix Computations 4th Ed., Golub and Van Loan.
    pub fn inverse_iteration(&mut self, a: &Tensor, mu: C64) -> EigResult<(C64, Tensor)> {
        let m = a.shape()[0];
        assert_eq!(m, a.shape()[1], "inverse_iteration: matrix is not square: {:?}", a.shape());
        let a_norm = a.inf_norm();

        // decompose (a - mu) = u t with t triangular
        self.a.reset_copy(a);
        for i in 0..m {
            self.a.set_at(&[i, i], self.a.at(&[i, i]) - mu);
        }
        qr_inplace(&mut self.a, &mut self.q, &mut self.bufs);
        // locate the zero pivot so back-substitution yields a non-trivial
        // null-space vector
        let mut zero_index = None;
        for i in 0..m {
            if self.a.at(&[i, i]).norm() < EPSILON {
                zero_index = Some(i);
                break;
            }
        }

        self.eigvecs.reset(&[m, 1]);
        self.eigvecs.fill(C64::new(1.0, 0.0));
        let norm = self.eigvecs.frobenius_norm();
        self.eigvecs.scale_by(C64::new(1.0 / norm, 0.0));

        let mut converged = false;
        let mut residual = 0.0f64;
        for _ in 0..16 {
            // solve (a - mu) z = q
            matmul(&mut self.bufs[0], &self.q.adjoint(), &self.eigvecs);
            back_substitution(&mut self.eigvecs, &self.a, &self.bufs[0], zero_index);
            let norm = self.eigvecs.frobenius_norm();
            self.eigvecs.scale_by(C64::new(1.0 / norm, 0.0));

            // residual (a - mu) q
            matmul(&mut self.bufs[0], a, &self.eigvecs);
            for i in 0..m {
                let ri = self.bufs[0].at(&[i, 0]) - mu * self.eigvecs.at(&[i, 0]);
                self.bufs[0].set_at(&[i, 0], ri);
            }
            residual = self.bufs[0].inf_norm();
            if residual < EPSILON * a_norm {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(EigError::InverseIterationNotConverged {
                residual,
                bound: EPSILON * a_norm,
            });
        }

        // refined eigenvalue from the Rayleigh quotient
        let (b0, b1) = self.bufs.split_at_mut(1);
        matmul(&mut b0[0], a, &self.eigvecs);
        matmul(&mut b1[0], &self.eigvecs.adjoint(), &b0[0]);
        Ok((b1[0].at(&[0, 0]), self.eigvecs.clone()))
    }
}

/// Eigenvalues of a 2×2 matrix in closed form.
fn eig22(a: &Tensor) -> (C64, C64) {
    let (a00, a01) = (a.at(&[0, 0]), a.at(&[0, 1]));
    let (a10, a11) = (a.at(&[1, 0]), a.at(&[1, 1]));
    let mean = (a00 + a11) * 0.5;
    let d = (mean * mean - (a00 * a11 - a01 * a10)).sqrt();
    (mean + d, mean - d)
}

/// The Wilkinson shift: the eigenvalue of the trailing 2×2 block closest to
/// the bottom-right entry.
pub(crate) fn wilkinson_shift(a: &Tensor) -> C64 {
    let m = a.shape()[0] as isize;
    let block = a.slice(&[[m - 2, m], [m - 2, m]]);
    let (l0, l1) = eig22(&block);
    let amm = a.at(&[m as usize - 1, m as usize - 1]);
    if (l0 - amm).norm() > (l1 - amm).norm() { l1 } else { l0 }
}

/// Zero every subdiagonal entry with `|a[i, i-1]| < eps (|a[i, i]| +
/// |a[i-1, i-1]|)`.
///
/// See Section 7.5.1 Deflation, Matrix Computations 4th Ed., Golub and
/// Van Loan; Section 5.1.8 XYapps, ARPACK Users' Guide, Lehoucq et al.
pub(crate) fn deflate(a: &mut Tensor) {
    let m = a.shape()[0];
    for i in 1..m {
        let sd = a.at(&[i, i - 1]).norm();
        let d = a.at(&[i, i]).norm() + a.at(&[i - 1, i - 1]).norm();
        if sd < EPSILON * d {
            a.set_at(&[i, i - 1], C64::new(0.0, 0.0));
        }
    }
}

/// Find the largest trailing unreduced Hessenberg block: after deflation,
/// rows `p..m-q` form the block and every subdiagonal at or below row `m-q`
/// is zero.
///
/// See Algorithm 7.5.2, Matrix Computations 4th Ed., Golub and Van Loan.
pub(crate) fn find_unreduced_hessenberg(a: &mut Tensor) -> (usize, usize) {
    let m = a.shape()[0];
    // deflate so the scans below can compare against exact zero
    deflate(a);
    let zero = C64::new(0.0, 0.0);

    let mut q = m;
    for i in (1..m).rev() {
        if a.at(&[i, i - 1]) != zero {
            q = m - 1 - i;
            break;
        }
    }

    let mut p = 0;
    if q < m {
        let top = (m - 1 - q).saturating_sub(1);
        for i in (1..=top).rev() {
            if a.at(&[i, i - 1]) == zero {
                p = i;
                break;
            }
        }
    }

    (p, q)
}

/// Diagonal-similarity balancing: scale rows and columns by powers of two
/// whenever this shrinks the combined norm by at least 5%, keeping the
/// accumulated diagonal inside `[eps, 1/eps]`. The scales multiply into `d`
/// (reset to the identity on entry).
///
/// See Algorithm 3, On Matrix Balancing and Eigenvector Computation, James,
/// Langou, Lowery; Section 7.5.7, Matrix Computations 4th Ed.
fn balance(a: &mut Tensor, d: &mut Tensor) {
    const B: f64 = 2.0; // f64 radix base
    let m = a.shape()[0];
    let mi = m as isize;
    d.reset_eye(m, 0);

    loop {
        let mut converged = true;
        for i in 0..m {
            let ii = i as isize;
            let mut col = a.slice(&[[0, mi], [ii, ii + 1]]);
            let mut row = a.slice(&[[ii, ii + 1], [0, mi]]);
            let mut c = col.frobenius_norm();
            let mut r = row.frobenius_norm();
            let s = c + r;

            let mut f = 1.0f64;
            while c < r / B && (c.max(f) < 1.0 / B / EPSILON && r > B * EPSILON) {
                c *= B;
                r /= B;
                f *= B;
            }
            while c >= r * B && (r < 1.0 / B / EPSILON && c.max(f) > B * EPSILON) {
                c /= B;
                r *= B;
                f /= B;
            }

            let dii = d.at(&[i, i]);
            if c + r < 0.95 * s && (dii.norm() * f > EPSILON && dii.norm() < 1.0 / f / EPSILON) {
                converged = false;
                col.scale_by(C64::new(f, 0.0));
                row.scale_by(C64::new(1.0 / f, 0.0));
                d.set_at(&[i, i], dii * f);
            }
        }
        if converged { break; }
    }
}

/// Implicit QR step on an upper Hessenberg `h`: factor `h = Z R` with Givens
/// rotations, then recombine `h <- R Z`. `z` receives the accumulated
/// unitary and `r` the triangular factor; both are reset.
pub(crate) fn chase_bulge_hessenberg(h: &mut Tensor, z: &mut Tensor, r: &mut Tensor) {
    let n = h.shape()[0];
    let ni = n as isize;
    z.reset_eye(n, 0);
    r.reset_copy(h);
    if n < 2 { return; }

    let mut rots = Vec::with_capacity(n - 1);
    for k in 0..n - 1 {
        let g = givens(r.at(&[k, k]), r.at(&[k + 1, k]), k, k + 1);
        // rows k and k+1 are zero left of column k by construction
        let mut cols = r.slice(&[[0, ni], [k as isize, ni]]);
        g.apply_left(&mut cols);
        r.set_at(&[k, k], g.r);
        r.set_at(&[k + 1, k], C64::new(0.0, 0.0));
        g.apply_right(z);
        rots.push(g);
    }

    h.set(&[0, 0], r);
    for g in &rots {
        g.apply_right(h);
    }
}

/// Solve `l x = b` for an upper triangular `l` whose diagonal may carry a
/// known zero at `zero_index`: tiny pivots produce 1 there and 0 elsewhere,
/// yielding a non-trivial null-space vector.
///
/// See Section 7.6.4 Eigenvector Bases, Matrix Computations 4th Ed.
pub(crate) fn back_substitution(
    x: &mut Tensor,
    l: &Tensor,
    b: &Tensor,
    zero_index: Option<usize>,
) {
    let m = x.shape()[0];
    for i in (0..m).rev() {
        let mut v = b.at(&[i, 0]);
        for j in (i + 1..m).rev() {
            v -= l.at(&[i, j]) * x.at(&[j, 0]);
        }
        let lii = l.at(&[i, i]);
        if lii.norm() < EPSILON {
            v = if zero_index == Some(i) { C64::new(1.0, 0.0) } else { C64::new(0.0, 0.0) };
        } else {
            v /= lii;
        }
        x.set_at(&[i, 0], v);
    }
}

/// Sort `vals` by the comparator, permuting the columns of the optional
/// `right` and `left` matrices in lockstep.
pub(crate) fn sort_eigen(
    vals: &mut Tensor,
    right: Option<&mut Tensor>,
    left: Option<&mut Tensor>,
    by: impl Fn(C64, C64) -> Ordering,
    buf: &mut Tensor,
) {
    let n = vals.shape()[0];
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| by(vals.at(&[i]), vals.at(&[j])));

    buf.reset(&[n]);
    for (inew, &src) in order.iter().enumerate() {
        buf.set_at(&[inew], vals.at(&[src]));
    }
    vals.set(&[0], buf);

    for mat in [right, left].into_iter().flatten() {
        let m = mat.shape()[0] as isize;
        buf.reset(&[m as usize, n]);
        for (inew, &src) in order.iter().enumerate() {
            let col = mat.slice(&[[0, m], [src as isize, src as isize + 1]]);
            buf.set(&[0, inew], &col);
        }
        mat.set(&[0, 0], buf);
    }
}
