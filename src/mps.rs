//! Matrix product states and the iterative ground-state search.
//!
//! An MPS is a chain of rank-3 site tensors with axes (left bond, physical,
//! right bond); a matrix product operator (MPO) is a chain of rank-4
//! tensors with axes (left, right, up, down). The ground-state search keeps
//! the chain in mixed canonical form and sweeps back and forth, replacing
//! one site at a time with the lowest eigenvector of the effective local
//! Hamiltonian delivered by the [`Arnoldi`] solver. Convergence is judged
//! by the energy variance ⟨H²⟩ − ⟨H⟩².
//!
//! References:
//!   - The density-matrix renormalization group in the age of matrix
//!     product states, Ulrich Schollwöck.

use log::debug;
use num_complex::Complex64 as C64;
use rand::Rng;
use thiserror::Error;
use crate::EPSILON;
use crate::arnoldi::{ Arnoldi, ArnoldiError, ArnoldiOptions };
use crate::decomp::{ lq, qr };
use crate::tensor::{ product, Tensor };

/// Axis of `a_{l-1}` in Figure 6, Schollwöck.
pub const MPS_LEFT_AXIS: usize = 0;
pub const MPS_UP_AXIS: usize = 1;
pub const MPS_RIGHT_AXIS: usize = 2;
/// Axis of `b_{l-1}` in Figure 35, Schollwöck.
pub const MPO_LEFT_AXIS: usize = 0;
pub const MPO_RIGHT_AXIS: usize = 1;
pub const MPO_UP_AXIS: usize = 2;
pub const MPO_DOWN_AXIS: usize = 3;

#[derive(Debug, Error)]
pub enum MpsError {
    /// The sweep budget ran out before the energy variance fell below the
    /// tolerance.
    #[error("ground-state search not converged: variance {variance}")]
    NotConverged { variance: C64 },

    /// The state norm collapsed below machine precision.
    #[error("state norm degenerate: <psi|psi> = {norm}")]
    Degenerate { norm: C64 },

    /// A local eigenproblem failed, with the site it happened at.
    #[error("local eigenproblem at site {site}: {source}")]
    LocalEig { site: usize, source: ArnoldiError },
}
pub type MpsResult<T> = Result<T, MpsError>;

/// Factor a dense state tensor into a right-compatible matrix product
/// representation by repeated QR decompositions of its left unfoldings.
/// The contents of `state` are consumed in the process.
pub fn new_mps(state: &Tensor, bufs: &mut [Tensor]) -> Vec<Tensor> {
    let shape = state.shape().to_vec();
    let mut sites = Vec::with_capacity(shape.len());

    let mut cur = state.clone();
    let mut left_d = 1usize;
    for &phys_d in &shape[..shape.len() - 1] {
        let mut q = Tensor::zeros(&[1]);
        let r = qr(&mut q, &cur.reshape(&[(left_d * phys_d) as isize, -1]), bufs);

        left_d = r.shape()[0];
        cur = r;

        sites.push(q.reshape(&[-1, phys_d as isize, left_d as isize]));
    }

    let last = cur.reshape(&[left_d as isize, shape[shape.len() - 1] as isize, 1]);
    let mut site = Tensor::zeros(&[1]);
    site.reset_copy(&last);
    sites.push(site);

    sites
}

/// Allocate a random matrix product state compatible with the given MPO.
/// Bond dimensions grow geometrically towards the middle of the chain and
/// shrink symmetrically, capped at `max_d` (see the discussion below
/// equation 71 in Section 4.1.4, Schollwöck).
pub fn rand_mps<R: Rng + ?Sized>(mpo: &[Tensor], max_d: usize, rng: &mut R) -> Vec<Tensor> {
    let len = mpo.len();
    assert!(len >= 2, "rand_mps: chain of length {len}");
    let mut sites = Vec::with_capacity(len);

    let phys_d = mpo[0].shape()[MPO_DOWN_AXIS];
    let mut left_d = phys_d;
    sites.push(rand_tensor(&[1, phys_d, phys_d.min(max_d)], rng));

    for i in 1..=len - 2 {
        let phys_d = mpo[i].shape()[MPO_DOWN_AXIS];
        let right_d = if i < len / 2 {
            left_d * phys_d
        } else if i > len / 2 {
            left_d / phys_d
        } else if len % 2 == 0 {
            left_d / phys_d
        } else {
            left_d
        };
        left_d = right_d;

        let prev_right = sites[i - 1].shape()[MPS_RIGHT_AXIS];
        sites.push(rand_tensor(&[prev_right, phys_d, right_d.min(max_d)], rng));
    }

    let phys_d = mpo[len - 1].shape()[MPO_DOWN_AXIS];
    let prev_right = sites[len - 2].shape()[MPS_RIGHT_AXIS];
    sites.push(rand_tensor(&[prev_right, phys_d, 1], rng));

    sites
}

/// Inner product ⟨x|y⟩, contracting a two-index environment across the
/// chain from left to right.
///
/// See Section 4.2.1 Efficient evaluation of contractions, Schollwöck.
pub fn inner_product(x: &[Tensor], y: &[Tensor], bufs: &mut [Tensor]) -> C64 {
    assert_eq!(x.len(), y.len(), "inner_product: chain lengths {} vs {}", x.len(), y.len());
    const F_TOP_AXIS: usize = 0;
    const F_BOT_AXIS: usize = 1;

    let (b0, b1) = split2(bufs);
    let mut f = {
        b0.reset(&[1, 1]);
        b0.fill(C64::new(1.0, 0.0));
        b0.clone()
    };
    for (xi, yi) in x.iter().zip(y) {
        product(b1, &f, yi, &[[F_BOT_AXIS, MPS_LEFT_AXIS]]);
        product(&mut f, &xi.conj(), &b1.clone(), &[
            [MPS_LEFT_AXIS, F_TOP_AXIS],
            [MPS_UP_AXIS, 1],
        ]);
    }

    assert_eq!(f.shape(), &[1, 1], "inner_product: dangling environment {:?}", f.shape());
    f.at(&[0, 0])
}

/// The L expressions of Equation 192, Section 6.2, Schollwöck: the left
/// environments `F_i = contract(F_{i-1}, M_i, W_i, M_i^*)`, stored into
/// `fs[i]`. Returns the full contraction ⟨ψ|H|ψ⟩.
pub fn l_expressions(
    fs: &mut [Tensor],
    ws: &[Tensor],
    ms: &[Tensor],
    bufs: &mut [Tensor],
) -> C64 {
    assert_eq!(fs.len(), ws.len(), "l_expressions: {} environments, {} sites", fs.len(), ws.len());
    assert_eq!(ws.len(), ms.len(), "l_expressions: {} MPO, {} MPS sites", ws.len(), ms.len());

    let mut fi1 = ones_env(&mut fs[0]);
    for i in 0..ws.len() {
        fi1 = l_expression(&mut fs[i], &fi1, &ws[i], &ms[i], bufs);
    }

    assert_eq!(fi1.shape(), &[1, 1, 1], "l_expressions: dangling environment {:?}", fi1.shape());
    fi1.at(&[0, 0, 0])
}

fn l_expression(
    fi: &mut Tensor,
    fi1: &Tensor,
    w: &Tensor,
    m: &Tensor,
    bufs: &mut [Tensor],
) -> Tensor {
    let (b0, b1) = split2(bufs);
    // fi1 is of shape {fTop, fMid, fBot};
    // fm is of shape {fTop, fMid, mpsTop, mpsRight}
    product(b0, fi1, m, &[[2, MPS_LEFT_AXIS]]);

    // wfm is of shape {mpoRight, mpoUp, fTop, mpsRight}
    product(b1, w, &b0.clone(), &[[MPO_DOWN_AXIS, 2], [MPO_LEFT_AXIS, 1]]);

    // fi is of shape {mpsRight.conj, mpoRight, mpsRight}
    product(fi, &m.conj(), &b1.clone(), &[[MPS_LEFT_AXIS, 2], [MPS_UP_AXIS, 1]]);

    fi.clone()
}

/// The R expressions of Equation 193, Section 6.2, Schollwöck: the right
/// environments accumulated from the chain end into `fs[i]`. Returns
/// ⟨ψ|H|ψ⟩.
pub fn r_expressions(
    fs: &mut [Tensor],
    ws: &[Tensor],
    ms: &[Tensor],
    bufs: &mut [Tensor],
) -> C64 {
    assert_eq!(fs.len(), ws.len(), "r_expressions: {} environments, {} sites", fs.len(), ws.len());
    assert_eq!(ws.len(), ms.len(), "r_expressions: {} MPO, {} MPS sites", ws.len(), ms.len());

    let last = fs.len() - 1;
    let mut fi1 = ones_env(&mut fs[last]);
    for i in (0..ws.len()).rev() {
        fi1 = r_expression(&mut fs[i], &fi1, &ws[i], &ms[i], bufs);
    }

    assert_eq!(fi1.shape(), &[1, 1, 1], "r_expressions: dangling environment {:?}", fi1.shape());
    fi1.at(&[0, 0, 0])
}

fn r_expression(
    fi: &mut Tensor,
    fi1: &Tensor,
    w: &Tensor,
    m: &Tensor,
    bufs: &mut [Tensor],
) -> Tensor {
    let (b0, b1) = split2(bufs);
    // fi1 is of shape {fTop, fMid, fBot};
    // fm is of shape {fTop, fMid, mpsLeft, mpsTop}
    product(b0, fi1, m, &[[2, MPS_RIGHT_AXIS]]);

    // wfm is of shape {mpoLeft, mpoUp, fTop, mpsLeft}
    product(b1, w, &b0.clone(), &[[MPO_DOWN_AXIS, 3], [MPO_RIGHT_AXIS, 1]]);

    // fi is of shape {mpsLeft.conj, mpoLeft, mpsLeft}
    product(fi, &m.conj(), &b1.clone(), &[[MPS_RIGHT_AXIS, 2], [MPS_UP_AXIS, 1]]);

    fi.clone()
}

/// ⟨ψ|H²|ψ⟩, contracting two MPO layers between the state and its
/// conjugate.
///
/// See Figure 44, Section 6.4, Schollwöck.
pub fn h2(ws: &[Tensor], ms: &[Tensor], bufs: &mut [Tensor]) -> C64 {
    assert_eq!(ws.len(), ms.len(), "h2: {} MPO, {} MPS sites", ws.len(), ms.len());
    let (b0, b1) = split2(bufs);

    // fi1 is the F expression at site i-1, of shape {fTop, fMid2, fMid, fBot}
    let mut fi1 = {
        b0.reset(&[1, 1, 1, 1]);
        b0.fill(C64::new(1.0, 0.0));
        b0.clone()
    };
    for (w, m) in ws.iter().zip(ms) {
        // fm is of shape {fTop, fMid2, fMid, mpsTop, mpsRight}
        product(b1, &fi1, m, &[[3, MPS_LEFT_AXIS]]);

        // wfm is of shape {mpoRight, mpoUp, fTop, fMid2, mpsRight}
        product(b0, w, &b1.clone(), &[[MPO_DOWN_AXIS, 3], [MPO_LEFT_AXIS, 2]]);

        // wwfm is of shape {mpoRight2, mpoUp2, mpoRight, fTop, mpsRight}
        product(b1, w, &b0.clone(), &[[MPO_DOWN_AXIS, 1], [MPO_LEFT_AXIS, 3]]);

        // fi1 is of shape {mpsRight.conj, mpoRight2, mpoRight, mpsRight}
        product(b0, &m.conj(), &b1.clone(), &[[MPS_LEFT_AXIS, 3], [MPS_UP_AXIS, 1]]);
        fi1 = b0.clone();
    }

    assert_eq!(fi1.shape(), &[1, 1, 1, 1], "h2: dangling environment {:?}", fi1.shape());
    fi1.at(&[0, 0, 0, 0])
}

/// Options for [`search_ground_state`].
#[derive(Copy, Clone, Debug)]
pub struct SearchOptions {
    /// Budget of full left-right sweep pairs.
    pub max_iterations: usize,
    /// Tolerance on the energy variance ⟨H²⟩ − ⟨H⟩².
    pub tol: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_iterations: 32, tol: 1e-6 }
    }
}

impl SearchOptions {
    pub fn max_iterations(mut self, v: usize) -> Self {
        self.max_iterations = v;
        self
    }

    pub fn tol(mut self, v: f64) -> Self {
        self.tol = v;
        self
    }
}

/// Iterative ground-state search by alternating one-site sweeps.
///
/// `ws` is the Hamiltonian MPO, `ms` the state (overwritten with the ground
/// state), `fs` the per-site environment storage and `bufs` four scratch
/// tensors. The state is right-canonicalized up front; each sweep solves
/// the effective local eigenproblem at every site with the Arnoldi solver
/// and shifts the canonical center along the chain.
///
/// See Section 6.3 Iterative ground state search, Schollwöck.
pub fn search_ground_state<R: Rng + ?Sized>(
    fs: &mut [Tensor],
    ws: &[Tensor],
    ms: &mut [Tensor],
    bufs: &mut [Tensor; 4],
    opt: SearchOptions,
    rng: &mut R,
) -> MpsResult<()> {
    right_normalize_all(ms, bufs);
    r_expressions(fs, ws, ms, bufs);

    let mut solver = Arnoldi::new();
    let mut variance = C64::new(f64::INFINITY, 0.0);
    for sweep in 0..opt.max_iterations {
        right_sweep(fs, ws, ms, bufs, &mut solver, rng)?;
        left_sweep(fs, ws, ms, bufs, &mut solver, rng)?;

        // test for convergence on the energy variance
        let psi_ip = inner_product(ms, ms, bufs);
        if psi_ip.norm() < EPSILON {
            return Err(MpsError::Degenerate { norm: psi_ip });
        }
        // the left sweep rebuilt the R expressions down to fs[1]; finish
        // with fs[0]
        let f1 = fs[1].clone();
        r_expression(&mut fs[0], &f1, &ws[0], &ms[0], bufs);
        let h = fs[0].at(&[0, 0, 0]) / psi_ip;
        let h2v = h2(ws, ms, bufs) / psi_ip;
        variance = h2v - h * h;
        debug!("sweep {sweep}: <H> = {h}, variance = {variance}");
        if variance.norm() < opt.tol * h2v.norm().max(1.0) {
            return Ok(());
        }
    }

    Err(MpsError::NotConverged { variance })
}

fn right_sweep<R: Rng + ?Sized>(
    fs: &mut [Tensor],
    ws: &[Tensor],
    ms: &mut [Tensor],
    bufs: &mut [Tensor; 4],
    solver: &mut Arnoldi,
    rng: &mut R,
) -> MpsResult<()> {
    for l in 0..ms.len() - 1 {
        let f_left = if l == 0 { ones_env(&mut bufs[3]) } else { fs[l - 1].clone() };
        let f_right = fs[l + 1].clone();
        let h = get_h(bufs, &f_left, &f_right, &ws[l]);

        let (_, eigvecs) = solver
            .solve(&h, 1, ArnoldiOptions::default(), rng)
            .map_err(|source| MpsError::LocalEig { site: l, source })?;
        let shape = as_isize(ms[l].shape());
        ms[l].reset_copy(&eigvecs.reshape(&shape));

        // Left normalize ms[l], folding the remainder into ms[l+1]. Keeping
        // sites left of the center left-normalized and sites right of it
        // right-normalized reduces the generalized eigenvalue problem to an
        // ordinary one; see Equation 211, Section 6.3, Schollwöck.
        left_normalize(ms, l, bufs);
        fs[l + 1].reset(&[1]);

        l_expression(&mut fs[l], &f_left, &ws[l], &ms[l], bufs);
    }
    Ok(())
}

fn left_sweep<R: Rng + ?Sized>(
    fs: &mut [Tensor],
    ws: &[Tensor],
    ms: &mut [Tensor],
    bufs: &mut [Tensor; 4],
    solver: &mut Arnoldi,
    rng: &mut R,
) -> MpsResult<()> {
    for l in (1..ms.len()).rev() {
        let f_right =
            if l + 1 < ms.len() { fs[l + 1].clone() } else { ones_env(&mut bufs[3]) };
        let f_left = fs[l - 1].clone();
        let h = get_h(bufs, &f_left, &f_right, &ws[l]);

        let (_, eigvecs) = solver
            .solve(&h, 1, ArnoldiOptions::default(), rng)
            .map_err(|source| MpsError::LocalEig { site: l, source })?;
        let shape = as_isize(ms[l].shape());
        ms[l].reset_copy(&eigvecs.reshape(&shape));

        // right normalize ms[l], folding the remainder into ms[l-1]
        right_normalize(ms, l, bufs);
        fs[l - 1].reset(&[1]);

        r_expression(&mut fs[l], &f_right, &ws[l], &ms[l], bufs);
    }
    Ok(())
}

/// The effective local Hamiltonian of Equation 210, Section 6.3,
/// Schollwöck, assembled from the environments and the local MPO tensor and
/// reshaped to a square matrix. The result is a view of `bufs[0]`.
fn get_h(bufs: &mut [Tensor; 4], left: &Tensor, right: &Tensor, w: &Tensor) -> Tensor {
    let (ls, wsh, rs) = (left.shape().to_vec(), w.shape().to_vec(), right.shape().to_vec());
    assert!(
        ls[0] == ls[2] && wsh[MPO_UP_AXIS] == wsh[MPO_DOWN_AXIS] && rs[0] == rs[2],
        "get_h: environments not square: {ls:?} {wsh:?} {rs:?}",
    );

    let (h, rest) = bufs.split_first_mut().unwrap();
    let (b1, b2) = split2(rest);

    // right is of shape {rightTop, rightMid, rightBot};
    // wRight is of shape {mpoLeft, mpoUp, mpoDown, rightTop, rightBot}
    product(b1, w, right, &[[MPO_RIGHT_AXIS, 1]]);

    // left is of shape {leftTop, leftMid, leftBot};
    // lwr is of shape {leftTop, leftBot, mpoUp, mpoDown, rightTop, rightBot}
    product(b2, left, &b1.clone(), &[[1, 0]]);

    // h is of shape {leftTop, mpoUp, rightTop, leftBot, mpoDown, rightBot}
    h.reset_copy(&b2.transpose(&[0, 2, 4, 1, 3, 5]));

    let rows = ls[0] * wsh[MPO_UP_AXIS] * rs[0];
    let cols = ls[2] * wsh[MPO_DOWN_AXIS] * rs[2];
    h.reshape(&[rows as isize, cols as isize])
}

/// Right-canonicalize the whole chain.
pub fn right_normalize_all(ms: &mut [Tensor], bufs: &mut [Tensor]) {
    for i in (1..ms.len()).rev() {
        right_normalize(ms, i, bufs);
    }
}

/// Left-canonicalize the whole chain.
pub fn left_normalize_all(ms: &mut [Tensor], bufs: &mut [Tensor]) {
    for i in 0..ms.len() - 1 {
        left_normalize(ms, i, bufs);
    }
}

/// Right-normalize site `i`, absorbing the non-unitary factor into site
/// `i-1`. Afterwards contracting site `i` with its conjugate over the
/// (right, up) axes yields the identity on the left bond.
///
/// See Section 4.4.2 Generation of a right-canonical MPS, Schollwöck.
pub fn right_normalize(ms: &mut [Tensor], i: usize, bufs: &mut [Tensor]) {
    let s = ms[i].shape().to_vec();
    let (d_up, d_right) = (s[MPS_UP_AXIS], s[MPS_RIGHT_AXIS]);

    // decompose ms[i] = l q^H
    let mi = ms[i].reshape(&[s[MPS_LEFT_AXIS] as isize, (d_up * d_right) as isize]);
    let (q, rest) = bufs.split_first_mut().unwrap();
    let l = lq(q, &mi, rest);

    // ms[i-1] = ms[i-1] @ l
    product(&mut rest[0], &ms[i - 1], &l, &[[MPS_RIGHT_AXIS, 0]]);
    ms[i - 1].reset_copy(&rest[0]);

    // ms[i] = q^H
    ms[i].reset_copy(&q.adjoint());
    let site = ms[i].reshape(&[-1, d_up as isize, d_right as isize]);
    ms[i] = site;
}

/// Left-normalize site `i`, absorbing the non-unitary factor into site
/// `i+1`.
pub fn left_normalize(ms: &mut [Tensor], i: usize, bufs: &mut [Tensor]) {
    let s = ms[i].shape().to_vec();
    let (d_left, d_up) = (s[MPS_LEFT_AXIS], s[MPS_UP_AXIS]);

    // decompose ms[i] = q r
    let mi = ms[i].reshape(&[(d_left * d_up) as isize, s[MPS_RIGHT_AXIS] as isize]);
    let (q, rest) = bufs.split_first_mut().unwrap();
    let r = qr(q, &mi, rest);

    // ms[i+1] = r @ ms[i+1]
    product(&mut rest[0], &r, &ms[i + 1], &[[1, MPS_LEFT_AXIS]]);
    ms[i + 1].reset_copy(&rest[0]);

    // ms[i] = q
    ms[i].reset_copy(q);
    let site = ms[i].reshape(&[d_left as isize, d_up as isize, -1]);
    ms[i] = site;
}

/// Contract a chain of site tensors into the dense state, with boundary
/// bonds left in place: the result has shape `(1, d, d, ..., d, 1)` for a
/// canonical chain.
pub fn dense_state(p: &mut Tensor, ms: &[Tensor], buf: &mut Tensor) -> Tensor {
    buf.reset_copy(&ms[0]);
    let mut in_buf = true;
    for mi in &ms[1..] {
        let (dst, src) =
            if in_buf { (&mut *p, buf.clone()) } else { (&mut *buf, p.clone()) };
        let axes = [[src.rank() - 1, 0]];
        product(dst, &src, mi, &axes);
        in_buf = !in_buf;
    }
    if in_buf {
        let b = buf.clone();
        p.reset_copy(&b);
    }
    p.clone()
}

fn ones_env(t: &mut Tensor) -> Tensor {
    t.reset(&[1, 1, 1]);
    t.fill(C64::new(1.0, 0.0));
    t.clone()
}

fn split2(bufs: &mut [Tensor]) -> (&mut Tensor, &mut Tensor) {
    let (a, rest) = bufs.split_first_mut().unwrap();
    (a, &mut rest[0])
}

fn as_isize(shape: &[usize]) -> Vec<isize> {
    shape.iter().map(|&d| d as isize).collect()
}

pub(crate) fn rand_tensor<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Tensor {
    let mut t = Tensor::zeros(shape);
    t.randomize(rng);
    t
}
