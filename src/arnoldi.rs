//! Implicitly restarted Arnoldi method for the lowest eigenpairs of a large
//! operator.
//!
//! The operator only needs to provide its action on blocks of column vectors
//! through the [`LinearOp`] trait, so both dense matrices and matrix-free
//! Hamiltonians can be plugged in. Internally the method grows a Krylov
//! basis with modified Gram–Schmidt (with re-orthogonalization), projects
//! the operator to a small Hessenberg matrix diagonalized by the dense
//! [`Eig`] solver, and purges unwanted Ritz values with implicit shifts.
//!
//! References:
//!   - ARPACK Users' Guide, R. B. Lehoucq, D. C. Sorensen, C. Yang.
//!   - Chapter 11, Lecture notes of Numerical Methods for Solving Large
//!     Scale Eigenvalue Problems, Peter Arbenz.

use log::debug;
use num_complex::Complex64 as C64;
use rand::Rng;
use thiserror::Error;
use crate::EPSILON;
use crate::eig::{ chase_bulge_hessenberg, deflate, Eig, EigError };
use crate::tensor::{ add, matmul, scale, Tensor };

#[derive(Debug, Error)]
pub enum ArnoldiError {
    /// The outer restart loop exhausted its iteration budget. The fields
    /// report how many wanted Ritz pairs had converged and the worst
    /// remaining residual estimate.
    #[error("Arnoldi not converged: {num_converged} converged, largest diff {largest_diff} at {largest_diff_idx}")]
    NotConverged { num_converged: usize, largest_diff_idx: isize, largest_diff: f64 },

    /// The projected Hessenberg eigenproblem failed.
    #[error(transparent)]
    Eig(#[from] EigError),
}
pub type ArnoldiResult<T> = Result<T, ArnoldiError>;

/// The action of a linear operator on blocks of column vectors.
pub trait LinearOp {
    /// Dimension of the (square) operator.
    fn nrows(&self) -> usize;

    /// `dst <- A x`, where `x` holds one or more column vectors.
    fn apply(&self, dst: &mut Tensor, x: &Tensor);

    /// Frobenius norm of the operator, used to scale residual bounds.
    fn frobenius_norm(&self) -> f64;
}

impl LinearOp for Tensor {
    fn nrows(&self) -> usize { self.shape()[0] }

    fn apply(&self, dst: &mut Tensor, x: &Tensor) {
        matmul(dst, self, x);
    }

    fn frobenius_norm(&self) -> f64 { Tensor::frobenius_norm(self) }
}

/// Options for [`Arnoldi::solve`].
#[derive(Copy, Clone, Debug)]
pub struct ArnoldiOptions {
    /// Dimension of the Krylov subspace. Defaults to `max(2k + 1, 20)`,
    /// clipped to the operator dimension.
    pub krylov_dim: Option<usize>,
    /// Budget of outer restart iterations.
    pub max_iterations: usize,
}

impl Default for ArnoldiOptions {
    fn default() -> Self {
        Self { krylov_dim: None, max_iterations: 64 }
    }
}

impl ArnoldiOptions {
    pub fn krylov_dim(mut self, v: usize) -> Self {
        self.krylov_dim = Some(v);
        self
    }

    pub fn max_iterations(mut self, v: usize) -> Self {
        self.max_iterations = v;
        self
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct Convergence {
    converged: bool,
    num_converged: usize,
    largest_diff_idx: isize,
    largest_diff: f64,
}

/// Workspace for the implicitly restarted Arnoldi method. Scratch tensors
/// are reused across calls; the views returned by [`solve`][Self::solve]
/// stay valid until the next call.
pub struct Arnoldi {
    eig: Eig,
    eigvals: Tensor,
    eigvecs: Tensor,
    q: Tensor,
    h: Tensor,
    r: Tensor,
    buf0: Tensor,
    /// Verify the Arnoldi relation and the returned eigenpairs at every
    /// step. Expensive; panics on violation.
    pub debug: bool,
}

impl Default for Arnoldi {
    fn default() -> Self { Self::new() }
}

impl Arnoldi {
    pub fn new() -> Self {
        Self {
            eig: Eig::new(),
            eigvals: Tensor::zeros(&[1]),
            eigvecs: Tensor::zeros(&[1]),
            q: Tensor::zeros(&[1]),
            h: Tensor::zeros(&[1]),
            r: Tensor::zeros(&[1]),
            buf0: Tensor::zeros(&[1]),
            debug: false,
        }
    }

    /// Compute the `k` eigenvalues of `a` with smallest real part, together
    /// with their eigenvectors. Returns `(eigvals, eigvecs)` as views of
    /// solver-owned storage, eigenvalues ascending by real part.
    ///
    /// The starting vector and any collapse-recovery vectors are drawn from
    /// `rng`; seed it for reproducible iteration counts.
    pub fn solve<A, R>(
        &mut self,
        a: &A,
        k: usize,
        opt: ArnoldiOptions,
        rng: &mut R,
    ) -> ArnoldiResult<(Tensor, Tensor)>
    where
        A: LinearOp + ?Sized,
        R: Rng + ?Sized,
    {
        let m = a.nrows();
        assert!(k >= 1 && k <= m, "arnoldi: k = {k} out of range for dimension {m}");
        let kry = opt.krylov_dim.unwrap_or_else(|| (2 * k + 1).max(20)).min(m);
        assert!(kry >= k, "arnoldi: krylov dimension {kry} below k = {k}");

        self.h.reset(&[kry + 1, kry]);
        self.q.reset(&[m, kry + 1]);
        self.eigvecs.reset(&[m, 1]);
        rand_vec(&mut self.eigvecs, rng);
        self.q.set(&[0, 0], &self.eigvecs);
        self.r.reset(&[m, kry + 1]);
        let mut start = 1;

        let mut cvg = Convergence::default();
        for _ in 0..opt.max_iterations {
            let (q, h, r) = self.iterate(a, start, rng);
            let (eigvals, hvecs) = self.eig.solve(&h)?;
            let hrows = hvecs.shape()[0] as isize;
            let hvecs = hvecs.slice(&[[0, hrows], [0, k as isize]]);
            cvg = converged_pairs(&r, &hvecs, &eigvals);
            if cvg.converged {
                self.eigvals.reset(&[k]);
                self.eigvals.set(&[0], &eigvals.slice(&[[0, k as isize]]));
                matmul(&mut self.eigvecs, &q, &hvecs);
                break;
            }

            // Prevent stagnation by increasing the wanted set.
            // For more details, see Section 5.1.2 XYaup2, ARPACK Users'
            // Guide, Lehoucq et al.
            start = (k + cvg.num_converged).min(k + (kry - k) / 2);
            debug!(
                "arnoldi restart: {} of {k} converged, start = {start}",
                cvg.num_converged,
            );

            let unwanted =
                eigvals.slice(&[[start as isize, eigvals.shape()[0] as isize]]);
            let mut qv = q;
            let mut hv = h;
            let mut rv = r;
            self.implicitly_restart(a, &unwanted, &mut qv, &mut hv, &mut rv);
        }
        if !cvg.converged {
            return Err(ArnoldiError::NotConverged {
                num_converged: cvg.num_converged,
                largest_diff_idx: cvg.largest_diff_idx,
                largest_diff: cvg.largest_diff,
            });
        }

        if self.debug {
            self.check_eigenvectors(a);
        }
        Ok((self.eigvals.clone(), self.eigvecs.clone()))
    }

    // grow the Arnoldi factorization A Q[:, :kry] = Q[:, :kry] H + f e^T
    // from column `start`, returning views of the active Q, H and residual R
    fn iterate<A, R>(&mut self, a: &A, start: usize, rng: &mut R) -> (Tensor, Tensor, Tensor)
    where
        A: LinearOp + ?Sized,
        R: Rng + ?Sized,
    {
        let m = a.nrows();
        let mi = m as isize;
        let kry = self.h.shape()[1];

        for i in start..=kry {
            let ii = i as isize;
            let vi1 = self.q.slice(&[[0, mi], [ii - 1, ii]]);
            let v = self.q.slice(&[[0, mi], [0, ii]]);
            let mut hcol = self.h.slice(&[[0, ii], [ii - 1, ii]]);

            // modified Gram-Schmidt with re-orthogonalization
            a.apply(&mut self.buf0, &vi1);
            let fnorm = gram_schmidt(
                &mut self.buf0,
                &mut hcol,
                &v,
                &mut self.eigvals,
                &mut self.eigvecs,
            );

            if self.debug {
                self.r.fill(C64::new(0.0, 0.0));
                let mut rcol = self.r.slice(&[[0, mi], [ii - 1, ii]]);
                rcol.set(&[0, 0], &self.buf0);
                self.check_arnoldi_relation(a, "iterating", i);
            }

            self.h.set_at(&[i, i - 1], C64::new(fnorm, 0.0));
            let mut vi = self.q.slice(&[[0, mi], [ii, ii + 1]]);
            if fnorm < EPSILON {
                // If a @ q[:, i-1] collapses, simply use a random vector.
                // Section 5.1.3 XYaitr, ARPACK Users' Guide, Lehoucq et al.
                self.eigvecs.reset(&[m, 1]);
                rand_vec(&mut self.eigvecs, rng);
                vi.set(&[0, 0], &self.eigvecs);
            } else {
                scale(&mut vi, C64::new(1.0 / fnorm, 0.0), &self.buf0);
            }
        }

        let q = self.q.slice(&[[0, mi], [0, kry as isize]]);
        let h = self.h.slice(&[[0, kry as isize], [0, kry as isize]]);
        self.r.fill(C64::new(0.0, 0.0));
        let mut r = self.r.slice(&[[0, mi], [0, kry as isize]]);
        r.set(&[0, kry - 1], &self.buf0);
        if self.debug {
            self.check_arnoldi_relation(a, "iterate end", kry);
        }

        (q, h, r)
    }

    /// Purge the subspace of the unwanted shifts.
    /// For a graphical explanation, consult Figure 4.5, ARPACK Users'
    /// Guide, Lehoucq et al.; also Section 5.1.8 XYapps.
    fn implicitly_restart<A>(
        &mut self,
        a: &A,
        shifts: &Tensor,
        v: &mut Tensor,
        h: &mut Tensor,
        f: &mut Tensor,
    )
    where A: LinearOp + ?Sized
    {
        let hm = h.shape()[0];
        for i in 0..shifts.shape()[0] {
            let shift = shifts.at(&[i]);

            deflate(h);
            for d in 0..hm {
                h.set_at(&[d, d], h.at(&[d, d]) - shift);
            }
            chase_bulge_hessenberg(h, &mut self.buf0, &mut self.eigvecs);
            for d in 0..hm {
                h.set_at(&[d, d], h.at(&[d, d]) + shift);
            }

            matmul(&mut self.eigvecs, v, &self.buf0);
            v.set(&[0, 0], &self.eigvecs);
            matmul(&mut self.eigvecs, f, &self.buf0);
            f.set(&[0, 0], &self.eigvecs);

            if self.debug {
                self.check_arnoldi_relation(a, "implicit restart", hm);
            }
        }
    }

    // A Q = Q H + R must hold at every iterate
    fn check_arnoldi_relation<A>(&self, a: &A, prefix: &str, n: usize)
    where A: LinearOp + ?Sized
    {
        let m = self.q.shape()[0] as isize;
        let ni = n as isize;
        let q = self.q.slice(&[[0, m], [0, ni]]);
        let h = self.h.slice(&[[0, ni], [0, ni]]);
        let r = self.r.slice(&[[0, m], [0, ni]]);

        let mut aq = Tensor::zeros(&[1]);
        a.apply(&mut aq, &q);
        let mut qh = Tensor::zeros(&[1]);
        matmul(&mut qh, &q, &h);
        let mut diff = Tensor::zeros(&[1]);
        let mut buf = Tensor::zeros(&[1]);
        scale(&mut buf, C64::new(-1.0, 0.0), &qh);
        add(&mut diff, &aq, &buf);
        scale(&mut buf, C64::new(-1.0, 0.0), &r);
        let dc = diff.clone();
        add(&mut diff, &dc, &buf);

        let bound = 20.0 * EPSILON * a.frobenius_norm();
        if diff.frobenius_norm() > bound {
            panic!(
                "Arnoldi relation violated {prefix} {n}: {} > {bound}",
                diff.frobenius_norm(),
            );
        }
    }

    // If the Arnoldi relation holds, then a v - lambda v = r s, where r is
    // the relation residual and s is the eigenvector in Krylov space.
    fn check_eigenvectors<A>(&self, a: &A)
    where A: LinearOp + ?Sized
    {
        let m = self.eigvecs.shape()[0] as isize;
        for i in 0..self.eigvals.shape()[0] {
            let lambda = self.eigvals.at(&[i]);
            let vec = self.eigvecs.slice(&[[0, m], [i as isize, i as isize + 1]]);

            let mut av = Tensor::zeros(&[1]);
            a.apply(&mut av, &vec);
            let mut lv = Tensor::zeros(&[1]);
            scale(&mut lv, -lambda, &vec);
            let mut diff = Tensor::zeros(&[1]);
            add(&mut diff, &av, &lv);

            if diff.frobenius_norm() > 100.0 * EPSILON * lambda.norm() {
                panic!("eigenpair {i} violated: {lambda}, {}", diff.frobenius_norm());
            }
        }
    }

}

/// Orthogonalize `f` against the columns of `q`, accumulating the
/// coefficients into `h` so that `f_out = f_in - q h`. Up to three passes of
/// re-orthogonalization are attempted; gives up (returning 0) when the norm
/// keeps collapsing.
///
/// The re-orthogonalization criterion is explained in Remark 11.1, Chapter
/// 11, Lecture notes of Numerical Methods for Solving Large Scale
/// Eigenvalue Problems, Peter Arbenz. The sin(pi/4) angle follows Section
/// 5.1.3 XYaitr, ARPACK Users' Guide, Lehoucq et al.
fn gram_schmidt(
    f: &mut Tensor,
    h: &mut Tensor,
    q: &Tensor,
    c: &mut Tensor,
    buf: &mut Tensor,
) -> f64 {
    let sin_pi4 = std::f64::consts::FRAC_PI_4.sin();
    h.fill(C64::new(0.0, 0.0));

    for _ in 0..3 {
        let f0 = f.frobenius_norm();

        matmul(c, &q.adjoint(), f);
        matmul(buf, q, c);
        buf.scale_by(C64::new(-1.0, 0.0));
        let fc = f.clone();
        add(f, &fc, buf);
        let hc = h.clone();
        add(h, &hc, c);

        let fn_ = f.frobenius_norm();
        if fn_ > sin_pi4 * f0 {
            return fn_;
        }
    }

    0.0
}

/// Convergence test for the wanted Ritz pairs. A pair `(lambda_i, s_i)` has
/// converged when `||f|| |s_i[last]| < 2 eps max(1, |lambda_i|)`.
///
/// See Section 4.6 Stopping Criterion and Section 5.1.7 YConv, ARPACK
/// Users' Guide, Lehoucq et al.
fn converged_pairs(r: &Tensor, vecs: &Tensor, vals: &Tensor) -> Convergence {
    let tol = 2.0 * EPSILON;
    let rnorm = r.frobenius_norm();
    let m = vecs.shape()[0];
    let num_vecs = vecs.shape()[1];

    let mut c = Convergence { largest_diff_idx: -1, ..Convergence::default() };
    for i in 0..num_vecs {
        let lambda = vals.at(&[i]);
        let diff = rnorm * vecs.at(&[m - 1, i]).norm();

        if diff < tol * lambda.norm().max(1.0) {
            c.num_converged += 1;
        } else if diff > c.largest_diff {
            c.largest_diff_idx = i as isize;
            c.largest_diff = diff;
        }
    }

    if c.num_converged == num_vecs {
        c.converged = true;
    }
    c
}

/// Fill `vec` with a random unit vector, each component drawn uniformly
/// from `[-1, 1] + i [-1, 1]` before normalization.
fn rand_vec<R: Rng + ?Sized>(vec: &mut Tensor, rng: &mut R) {
    vec.randomize(rng);
    let norm = vec.frobenius_norm();
    vec.scale_by(C64::new(1.0 / norm, 0.0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };

    fn rand_mat(m: usize, rng: &mut StdRng) -> Tensor {
        let mut a = Tensor::zeros(&[m, m]);
        a.randomize(rng);
        a
    }

    #[test]
    fn matches_dense_solver_on_random_matrices() {
        let mut rng = StdRng::seed_from_u64(307);
        let m = 16;
        let k = 3;
        let a = rand_mat(m, &mut rng);

        let mut dense = Eig::new();
        let (dense_vals, _) = dense.solve(&a).unwrap();

        let mut solver = Arnoldi::new();
        solver.debug = true;
        let (vals, vecs) = solver
            .solve(&a, k, ArnoldiOptions::default(), &mut rng)
            .unwrap();

        for i in 0..k {
            let got = vals.at(&[i]);
            let want = dense_vals.at(&[i]);
            assert!(
                (got - want).norm() <= 1e-4 * want.norm().max(1.0),
                "ritz value {i}: {got} vs {want}",
            );
        }

        // eigenpair relation
        for i in 0..k {
            let lambda = vals.at(&[i]);
            let vec = vecs.slice(&[[0, m as isize], [i as isize, i as isize + 1]]);
            let mut av = Tensor::zeros(&[1]);
            matmul(&mut av, &a, &vec);
            let mut lv = Tensor::zeros(&[1]);
            scale(&mut lv, -lambda, &vec);
            let mut diff = Tensor::zeros(&[1]);
            add(&mut diff, &av, &lv);
            assert!(
                diff.frobenius_norm()
                    <= 100.0 * EPSILON * lambda.norm().max(1.0) * vec.frobenius_norm(),
                "pair {i} residual {}", diff.frobenius_norm(),
            );
        }
    }

    #[test]
    fn hermitian_ground_state() {
        // symmetrized random matrix: real spectrum, ground state well below
        let mut rng = StdRng::seed_from_u64(311);
        let m = 12;
        let b = rand_mat(m, &mut rng);
        let mut a = Tensor::zeros(&[1]);
        matmul(&mut a, &b.adjoint(), &b);
        // shift to make the spectrum sign-mixed
        for i in 0..m {
            a.set_at(&[i, i], a.at(&[i, i]) - C64::new(4.0, 0.0));
        }

        let mut dense = Eig::new();
        let (dense_vals, _) = dense.solve(&a).unwrap();
        let mut solver = Arnoldi::new();
        let (vals, _) = solver
            .solve(&a, 1, ArnoldiOptions::default(), &mut rng)
            .unwrap();
        assert!(
            (vals.at(&[0]) - dense_vals.at(&[0])).norm() < 1e-3,
            "{} vs {}", vals.at(&[0]), dense_vals.at(&[0]),
        );
    }

    #[test]
    fn krylov_dim_equal_to_matrix_dim() {
        // tiny operator: the Krylov space saturates the full space
        let mut rng = StdRng::seed_from_u64(313);
        let a = rand_mat(4, &mut rng);
        let mut dense = Eig::new();
        let (dense_vals, _) = dense.solve(&a).unwrap();
        let mut solver = Arnoldi::new();
        let (vals, _) = solver
            .solve(&a, 1, ArnoldiOptions::default(), &mut rng)
            .unwrap();
        assert!((vals.at(&[0]) - dense_vals.at(&[0])).norm() < 1e-4);
    }
}
