//! Dense complex tensors with zero-copy views and lazy conjugation.
//!
//! A [`Tensor`] is an N-dimensional array of `Complex64` elements. Tensors
//! are either owners of a contiguous row-major buffer or *views* into the
//! buffer of another tensor. [`slice`][Tensor::slice],
//! [`reshape`][Tensor::reshape], [`transpose`][Tensor::transpose],
//! [`adjoint`][Tensor::adjoint] and [`conj`][Tensor::conj] all return views:
//! they never copy, and writing through a view writes through to the parent.
//!
//! Conjugation is lazy. [`conj`][Tensor::conj] only toggles a flag on the
//! view; the negation of the imaginary part is deferred until elements are
//! read. [`matmul`] and [`product`] inspect the flag, so a conjugate
//! transpose operand costs nothing up front.
//!
//! Kernels such as [`add`], [`matmul`] and [`product`] write into an explicit
//! output tensor, resizing it as needed while holding on to its allocation.
//! Output/input aliasing is permitted only where documented (for example
//! `add(a, a, b)`); undocumented aliasing is detected and panics.
//!
//! Shape and argument violations (out-of-range indices, non-contiguous
//! reshapes, incompatible operands) are caller bugs and panic eagerly.

use std::{ cell::RefCell, fmt, rc::Rc };
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned by [`Tensor::close_to`] when the operand shapes differ.
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    /// Returned by [`Tensor::close_to`] at the first element pair whose
    /// difference exceeds the tolerance.
    #[error("elements differ at {index:?}: {lhs} vs {rhs} (|diff| = {diff}, tol = {tol})")]
    NotClose { index: Vec<usize>, lhs: C64, rhs: C64, diff: f64, tol: f64 },
}
pub type TensorResult<T> = Result<T, TensorError>;

/// An N-dimensional array of complex numbers.
///
/// Cloning a tensor is cheap and produces another view of the same buffer,
/// mirroring the view semantics of [`slice`][Self::slice] and friends. Use
/// [`reset_copy`][Self::reset_copy] for a deep copy.
#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<C64>>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    conj: bool,
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}

impl Tensor {
    /// Allocate a tensor of the given shape filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            data: Rc::new(RefCell::new(vec![C64::zero(); len])),
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            offset: 0,
            conj: false,
        }
    }

    /// Allocate an `n`×`n` matrix with ones on the `k`-th diagonal.
    pub fn eye(n: usize, k: isize) -> Self {
        let mut t = Self::zeros(&[n, n]);
        t.reset_eye(n, k);
        t
    }

    pub fn rank(&self) -> usize { self.shape.len() }

    pub fn shape(&self) -> &[usize] { &self.shape }

    /// Number of elements addressed by this tensor.
    pub fn len(&self) -> usize { self.shape.iter().product() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn flat_offset(&self, index: &[usize]) -> usize {
        assert_eq!(
            index.len(), self.shape.len(),
            "index rank {} does not match tensor rank {}",
            index.len(), self.shape.len(),
        );
        let mut off = self.offset;
        for (k, (&i, &d)) in index.iter().zip(&self.shape).enumerate() {
            assert!(i < d, "index {index:?} out of range for shape {:?} at axis {k}", self.shape);
            off += i * self.strides[k];
        }
        off
    }

    /// Read the element at `index`, honoring the conjugation flag.
    pub fn at(&self, index: &[usize]) -> C64 {
        let off = self.flat_offset(index);
        let v = self.data.borrow()[off];
        if self.conj { v.conj() } else { v }
    }

    /// Write the element at `index` so that a subsequent [`at`][Self::at]
    /// returns `v`.
    pub fn set_at(&mut self, index: &[usize], v: C64) {
        let off = self.flat_offset(index);
        let v = if self.conj { v.conj() } else { v };
        self.data.borrow_mut()[off] = v;
    }

    /// Take a rectangular sub-view. Each `[start, end)` range addresses one
    /// axis; negative bounds are offsets from that axis' extent.
    pub fn slice(&self, ranges: &[[isize; 2]]) -> Tensor {
        assert_eq!(
            ranges.len(), self.rank(),
            "slice rank {} does not match tensor rank {}", ranges.len(), self.rank(),
        );
        let mut shape = Vec::with_capacity(self.rank());
        let mut offset = self.offset;
        for (k, r) in ranges.iter().enumerate() {
            let d = self.shape[k] as isize;
            let lo = if r[0] < 0 { r[0] + d } else { r[0] };
            let hi = if r[1] < 0 { r[1] + d } else { r[1] };
            assert!(
                0 <= lo && lo <= hi && hi <= d,
                "slice range {r:?} invalid for extent {d} at axis {k}",
            );
            shape.push((hi - lo) as usize);
            offset += lo as usize * self.strides[k];
        }
        Tensor {
            data: Rc::clone(&self.data),
            shape,
            strides: self.strides.clone(),
            offset,
            conj: self.conj,
        }
    }

    fn is_contiguous(&self) -> bool {
        self.len() <= 1 || self.strides == contiguous_strides(&self.shape)
    }

    /// Reinterpret the tensor with a new shape without copying. At most one
    /// extent may be `-1`, in which case it is inferred. The view must be
    /// contiguous in row-major order.
    pub fn reshape(&self, shape: &[isize]) -> Tensor {
        assert!(
            self.is_contiguous(),
            "cannot reshape non-contiguous view of shape {:?}", self.shape,
        );
        let known: usize = shape.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
        let holes = shape.iter().filter(|&&d| d < 0).count();
        assert!(holes <= 1, "reshape {shape:?} has more than one inferred extent");
        let len = self.len();
        let mut resolved = Vec::with_capacity(shape.len());
        for &d in shape {
            if d < 0 {
                assert!(d == -1 && known > 0 && len % known == 0,
                    "cannot infer extent in reshape {shape:?} of {len} elements");
                resolved.push(len / known);
            } else {
                resolved.push(d as usize);
            }
        }
        assert_eq!(
            resolved.iter().product::<usize>(), len,
            "reshape {shape:?} does not preserve the element count {len}",
        );
        Tensor {
            data: Rc::clone(&self.data),
            strides: contiguous_strides(&resolved),
            shape: resolved,
            offset: self.offset,
            conj: self.conj,
        }
    }

    /// Permute the axes.
    pub fn transpose(&self, perm: &[usize]) -> Tensor {
        assert_eq!(perm.len(), self.rank(), "permutation {perm:?} does not match rank {}", self.rank());
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            assert!(p < perm.len() && !seen[p], "invalid permutation {perm:?}");
            seen[p] = true;
        }
        Tensor {
            data: Rc::clone(&self.data),
            shape: perm.iter().map(|&p| self.shape[p]).collect(),
            strides: perm.iter().map(|&p| self.strides[p]).collect(),
            offset: self.offset,
            conj: self.conj,
        }
    }

    /// Conjugate transpose of the last two axes, as a view.
    pub fn adjoint(&self) -> Tensor {
        let n = self.rank();
        assert!(n >= 2, "adjoint requires rank >= 2, got {n}");
        let mut perm: Vec<usize> = (0..n).collect();
        perm.swap(n - 2, n - 1);
        let mut t = self.transpose(&perm);
        t.conj = !t.conj;
        t
    }

    /// Elementwise conjugate, as a view with a toggled flag.
    pub fn conj(&self) -> Tensor {
        let mut t = self.clone();
        t.conj = !t.conj;
        t
    }

    fn same_buffer(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    fn same_view(&self, other: &Tensor) -> bool {
        self.same_buffer(other)
            && self.offset == other.offset
            && self.shape == other.shape
            && self.strides == other.strides
            && self.conj == other.conj
    }

    /// Copy `src` into this tensor starting at `origin`. The copied region
    /// has the shape of `src`; ranks must match and the region must fit.
    ///
    /// `src` may be a view of this tensor's buffer as long as the source and
    /// destination regions do not overlap.
    pub fn set(&mut self, origin: &[usize], src: &Tensor) -> &mut Self {
        assert_eq!(
            origin.len(), self.rank(),
            "set origin rank {} does not match tensor rank {}", origin.len(), self.rank(),
        );
        assert_eq!(
            src.rank(), self.rank(),
            "set source rank {} does not match tensor rank {}", src.rank(), self.rank(),
        );
        for k in 0..self.rank() {
            assert!(
                origin[k] + src.shape[k] <= self.shape[k],
                "set region {:?} at {origin:?} does not fit in {:?}", src.shape, self.shape,
            );
        }
        if src.is_empty() { return self; }
        let mut dst = self.clone();
        let mut doff = dst.offset;
        for (k, &o) in origin.iter().enumerate() {
            doff += o * dst.strides[k];
        }
        dst.offset = doff;
        dst.shape = src.shape.clone();
        if self.same_buffer(src) {
            let mut buf = self.data.borrow_mut();
            let mut src_o = Odometer::new(&src.shape, &src.strides);
            let mut dst_o = Odometer::new(&dst.shape, &dst.strides);
            loop {
                let mut v = buf[src.offset + src_o.off];
                if src.conj != dst.conj { v = v.conj(); }
                buf[dst.offset + dst_o.off] = v;
                if !(src_o.step() && dst_o.step()) { break; }
            }
        } else {
            let sbuf = src.data.borrow();
            let mut buf = self.data.borrow_mut();
            let mut src_o = Odometer::new(&src.shape, &src.strides);
            let mut dst_o = Odometer::new(&dst.shape, &dst.strides);
            loop {
                let mut v = sbuf[src.offset + src_o.off];
                if src.conj != dst.conj { v = v.conj(); }
                buf[dst.offset + dst_o.off] = v;
                if !(src_o.step() && dst_o.step()) { break; }
            }
        }
        self
    }

    /// Resize to `shape`, clearing all contents to zero. The underlying
    /// allocation is reused when this tensor is the sole owner of its buffer;
    /// otherwise a fresh buffer is attached, detaching any outstanding views.
    pub fn reset(&mut self, shape: &[usize]) -> &mut Self {
        let len = shape.iter().product();
        if Rc::strong_count(&self.data) == 1 {
            let mut buf = self.data.borrow_mut();
            buf.clear();
            buf.resize(len, C64::zero());
        } else {
            self.data = Rc::new(RefCell::new(vec![C64::zero(); len]));
        }
        self.shape = shape.to_vec();
        self.strides = contiguous_strides(shape);
        self.offset = 0;
        self.conj = false;
        self
    }

    /// Resize to an `n`×`n` identity-like matrix with ones on the `k`-th
    /// diagonal.
    pub fn reset_eye(&mut self, n: usize, k: isize) -> &mut Self {
        self.reset(&[n, n]);
        let mut buf = self.data.borrow_mut();
        for i in 0..n {
            let j = i as isize + k;
            if 0 <= j && j < n as isize {
                buf[i * n + j as usize] = C64::one();
            }
        }
        drop(buf);
        self
    }

    /// Resize to the shape of `src` and copy its contents. `src` may alias
    /// this tensor's buffer; the copy then lands in a fresh buffer.
    pub fn reset_copy(&mut self, src: &Tensor) -> &mut Self {
        let src = src.clone(); // keep the source view alive across the reset
        self.reset(&src.shape);
        self.set(&vec![0; src.rank()], &src);
        self
    }

    /// Fill every element with `v`.
    pub fn fill(&mut self, v: C64) -> &mut Self {
        if !self.is_empty() {
            let stored = if self.conj { v.conj() } else { v };
            let mut buf = self.data.borrow_mut();
            let mut o = Odometer::new(&self.shape, &self.strides);
            loop {
                buf[self.offset + o.off] = stored;
                if !o.step() { break; }
            }
        }
        self
    }

    /// Multiply every element by `c`, in place.
    pub fn scale_by(&mut self, c: C64) -> &mut Self {
        if !self.is_empty() {
            let stored = if self.conj { c.conj() } else { c };
            let mut buf = self.data.borrow_mut();
            let mut o = Odometer::new(&self.shape, &self.strides);
            loop {
                buf[self.offset + o.off] *= stored;
                if !o.step() { break; }
            }
        }
        self
    }

    /// Fill with uniformly random components in `[-1, 1] + i[-1, 1]`.
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> &mut Self {
        if !self.is_empty() {
            let mut buf = self.data.borrow_mut();
            let mut o = Odometer::new(&self.shape, &self.strides);
            loop {
                let v =
                    C64::new(rng.gen::<f64>() * 2.0 - 1.0, rng.gen::<f64>() * 2.0 - 1.0);
                buf[self.offset + o.off] = v;
                if !o.step() { break; }
            }
        }
        self
    }

    /// Zero all elements below the `k`-th diagonal, in place.
    pub fn triu(&mut self, k: isize) -> &mut Self {
        self.mask_diagonal(|i, j| j - i < k);
        self
    }

    /// Zero all elements above the `k`-th diagonal, in place.
    pub fn tril(&mut self, k: isize) -> &mut Self {
        self.mask_diagonal(|i, j| j - i > k);
        self
    }

    fn mask_diagonal(&mut self, zero: impl Fn(isize, isize) -> bool) {
        assert_eq!(self.rank(), 2, "triangular masking requires a matrix, got rank {}", self.rank());
        let (m, n) = (self.shape[0], self.shape[1]);
        let mut buf = self.data.borrow_mut();
        for i in 0..m {
            for j in 0..n {
                if zero(i as isize, j as isize) {
                    buf[self.offset + i * self.strides[0] + j * self.strides[1]] =
                        C64::zero();
                }
            }
        }
    }

    /// Frobenius norm, `sqrt(sum |x|^2)`.
    pub fn frobenius_norm(&self) -> f64 {
        if self.is_empty() { return 0.0; }
        let buf = self.data.borrow();
        let mut o = Odometer::new(&self.shape, &self.strides);
        let mut sum = 0.0f64;
        loop {
            sum += buf[self.offset + o.off].norm_sqr();
            if !o.step() { break; }
        }
        sum.sqrt()
    }

    /// Infinity norm: the largest absolute row sum, where "rows" run over
    /// the last axis. For a vector this is the largest element modulus.
    pub fn inf_norm(&self) -> f64 {
        if self.is_empty() { return 0.0; }
        if self.rank() == 1 {
            let buf = self.data.borrow();
            let mut best = 0.0f64;
            for i in 0..self.shape[0] {
                best = best.max(buf[self.offset + i * self.strides[0]].norm());
            }
            return best;
        }
        let buf = self.data.borrow();
        let last = self.rank() - 1;
        let (n, sn) = (self.shape[last], self.strides[last]);
        let mut o = Odometer::new(&self.shape[..last], &self.strides[..last]);
        let mut best = 0.0f64;
        loop {
            let base = self.offset + o.off;
            let mut row = 0.0f64;
            for j in 0..n {
                row += buf[base + j * sn].norm();
            }
            best = best.max(row);
            if !o.step() { break; }
        }
        best
    }

    /// Compare element by element against `other` with absolute tolerance
    /// `tol`, reporting the first mismatch.
    pub fn close_to(&self, other: &Tensor, tol: f64) -> TensorResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch(self.shape.clone(), other.shape.clone()));
        }
        for index in self.index_iter() {
            let (lhs, rhs) = (self.at(&index), other.at(&index));
            let diff = (lhs - rhs).norm();
            if !(diff <= tol) {
                return Err(TensorError::NotClose { index, lhs, rhs, diff, tol });
            }
        }
        Ok(())
    }

    /// Iterate over all multi-indices in row-major order.
    pub fn index_iter(&self) -> IndexIter {
        IndexIter {
            shape: self.shape.clone(),
            next: if self.is_empty() { None } else { Some(vec![0; self.rank()]) },
        }
    }
}

/// Row-major iterator over the multi-indices of a tensor.
#[derive(Clone, Debug)]
pub struct IndexIter {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Iterator for IndexIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut succ = current.clone();
        let mut k = self.shape.len();
        loop {
            if k == 0 {
                self.next = None;
                break;
            }
            k -= 1;
            succ[k] += 1;
            if succ[k] < self.shape[k] {
                self.next = Some(succ);
                break;
            }
            succ[k] = 0;
        }
        Some(current)
    }
}

impl std::iter::FusedIterator for IndexIter { }

// strided offset walker; steps through all index combinations in row-major
// order, keeping the relative element offset incrementally updated
struct Odometer {
    dims: Vec<usize>,
    strides: Vec<usize>,
    idx: Vec<usize>,
    off: usize,
}

impl Odometer {
    fn new(dims: &[usize], strides: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            strides: strides.to_vec(),
            idx: vec![0; dims.len()],
            off: 0,
        }
    }

    fn reset(&mut self) {
        self.idx.iter_mut().for_each(|i| { *i = 0; });
        self.off = 0;
    }

    // advance to the next combination; false once all have been visited
    fn step(&mut self) -> bool {
        let mut k = self.dims.len();
        loop {
            if k == 0 { return false; }
            k -= 1;
            self.idx[k] += 1;
            self.off += self.strides[k];
            if self.idx[k] < self.dims[k] { return true; }
            self.off -= self.strides[k] * self.dims[k];
            self.idx[k] = 0;
        }
    }
}

fn read(buf: &[C64], t: &Tensor, off: usize) -> C64 {
    let v = buf[off];
    if t.conj { v.conj() } else { v }
}

fn broadcast_shape(a: &[usize], b: &[usize], what: &str) -> Vec<usize> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for k in 0..rank {
        let da = if k < rank - a.len() { 1 } else { a[k - (rank - a.len())] };
        let db = if k < rank - b.len() { 1 } else { b[k - (rank - b.len())] };
        assert!(
            da == db || da == 1 || db == 1,
            "{what}: shapes {a:?} and {b:?} do not broadcast",
        );
        out[k] = da.max(db);
    }
    out
}

// strides of an operand broadcast up to `out`: axes the operand lacks, or
// holds with extent 1, contribute stride 0
fn broadcast_strides(t: &Tensor, out: &[usize]) -> Vec<usize> {
    let pad = out.len() - t.rank();
    let mut strides = vec![0; out.len()];
    for k in 0..t.rank() {
        if t.shape[k] != 1 {
            strides[pad + k] = t.strides[k];
        }
    }
    strides
}

fn write(buf: &mut [C64], t: &Tensor, off: usize, v: C64) {
    buf[off] = if t.conj { v.conj() } else { v };
}

// resize the output unless it already has the requested shape, in which case
// writes go through the existing (possibly strided) view
fn prepare_dst(dst: &mut Tensor, shape: &[usize]) {
    if dst.shape != shape {
        dst.reset(shape);
    }
}

fn binary_op(
    dst: &mut Tensor,
    a: &Tensor,
    b: &Tensor,
    what: &str,
    op: impl Fn(C64, C64) -> C64,
) {
    let out = broadcast_shape(&a.shape, &b.shape, what);
    if dst.same_view(a) {
        // documented in-place form, e.g. add(a, a, b)
        assert_eq!(a.shape, out, "{what}: in-place output cannot broadcast {:?} to {out:?}", a.shape);
        assert!(!b.same_buffer(dst), "{what}: operand b aliases the in-place output");
        if dst.is_empty() { return; }
        let bbuf = b.data.borrow();
        let mut buf = dst.data.borrow_mut();
        let mut ao = Odometer::new(&out, &a.strides);
        let bstr = broadcast_strides(b, &out);
        let mut bo = Odometer::new(&out, &bstr);
        loop {
            let x = read(&buf, a, a.offset + ao.off);
            let y = read(&bbuf, b, b.offset + bo.off);
            let v = op(x, y);
            write(&mut buf, dst, a.offset + ao.off, v);
            if !(ao.step() && bo.step()) { break; }
        }
        return;
    }
    assert!(
        !dst.same_buffer(a) && !dst.same_buffer(b),
        "{what}: output aliases an input without being it",
    );
    prepare_dst(dst, &out);
    if dst.is_empty() { return; }
    let abuf = a.data.borrow();
    let bbuf = b.data.borrow();
    let mut buf = dst.data.borrow_mut();
    let astr = broadcast_strides(a, &out);
    let bstr = broadcast_strides(b, &out);
    let mut ao = Odometer::new(&out, &astr);
    let mut bo = Odometer::new(&out, &bstr);
    let mut wo = Odometer::new(&dst.shape, &dst.strides);
    loop {
        let x = read(&abuf, a, a.offset + ao.off);
        let y = read(&bbuf, b, b.offset + bo.off);
        write(&mut buf, dst, dst.offset + wo.off, op(x, y));
        if !(ao.step() && bo.step() && wo.step()) { break; }
    }
}

/// `dst <- a + b`, elementwise with broadcasting.
///
/// Aliasing: `add(a, a, b)` is permitted and updates `a` in place.
pub fn add(dst: &mut Tensor, a: &Tensor, b: &Tensor) {
    binary_op(dst, a, b, "add", |x, y| x + y);
}

/// `dst <- a * b`, elementwise with broadcasting.
///
/// Aliasing: `mul(a, a, b)` is permitted and updates `a` in place.
pub fn mul(dst: &mut Tensor, a: &Tensor, b: &Tensor) {
    binary_op(dst, a, b, "mul", |x, y| x * y);
}

/// `dst <- c * x` for a scalar `c`.
///
/// Aliasing: `scale(x, c, x)` is permitted and updates `x` in place.
pub fn scale(dst: &mut Tensor, c: C64, x: &Tensor) {
    if dst.same_view(x) {
        dst.scale_by(c);
        return;
    }
    assert!(!dst.same_buffer(x), "scale: output aliases the input without being it");
    prepare_dst(dst, &x.shape);
    if dst.is_empty() { return; }
    let xbuf = x.data.borrow();
    let mut buf = dst.data.borrow_mut();
    let mut o = Odometer::new(&x.shape, &x.strides);
    let mut wo = Odometer::new(&dst.shape, &dst.strides);
    loop {
        let v = c * read(&xbuf, x, x.offset + o.off);
        write(&mut buf, dst, dst.offset + wo.off, v);
        if !(o.step() && wo.step()) { break; }
    }
}

/// `dst <- a @ b` for matrices. Conjugation flags on `a` and `b` are honored
/// without materializing the conjugates. The output must not alias either
/// input.
pub fn matmul(dst: &mut Tensor, a: &Tensor, b: &Tensor) {
    assert_eq!(a.rank(), 2, "matmul: a has rank {}", a.rank());
    assert_eq!(b.rank(), 2, "matmul: b has rank {}", b.rank());
    assert_eq!(
        a.shape[1], b.shape[0],
        "matmul: inner extents differ, {:?} @ {:?}", a.shape, b.shape,
    );
    assert!(
        !dst.same_buffer(a) && !dst.same_buffer(b),
        "matmul: output aliases an input",
    );
    let (m, kk, n) = (a.shape[0], a.shape[1], b.shape[1]);
    prepare_dst(dst, &[m, n]);
    let abuf = a.data.borrow();
    let bbuf = b.data.borrow();
    let mut buf = dst.data.borrow_mut();
    let (as0, as1) = (a.strides[0], a.strides[1]);
    let (bs0, bs1) = (b.strides[0], b.strides[1]);
    let (ds0, ds1) = (dst.strides[0], dst.strides[1]);
    for i in 0..m {
        let arow = a.offset + i * as0;
        let drow = dst.offset + i * ds0;
        for j in 0..n {
            let mut sum = C64::zero();
            for l in 0..kk {
                sum += read(&abuf, a, arow + l * as1)
                    * read(&bbuf, b, b.offset + l * bs0 + j * bs1);
            }
            write(&mut buf, dst, drow + j * ds1, sum);
        }
    }
}

/// Tensor contraction of `a` and `b` over the listed `[axis_of_a, axis_of_b]`
/// pairs. The output axes are `a`'s free axes followed by `b`'s free axes, in
/// their original order. The output must not alias either input.
pub fn product(dst: &mut Tensor, a: &Tensor, b: &Tensor, axes: &[[usize; 2]]) {
    assert!(
        !dst.same_buffer(a) && !dst.same_buffer(b),
        "product: output aliases an input",
    );
    let mut a_con = Vec::with_capacity(axes.len());
    let mut b_con = Vec::with_capacity(axes.len());
    for &[ax, bx] in axes {
        assert!(ax < a.rank() && bx < b.rank(), "product: axis pair [{ax}, {bx}] out of range");
        assert_eq!(
            a.shape[ax], b.shape[bx],
            "product: contracted extents differ at [{ax}, {bx}]: {:?} vs {:?}",
            a.shape, b.shape,
        );
        a_con.push(ax);
        b_con.push(bx);
    }
    let a_free: Vec<usize> = (0..a.rank()).filter(|k| !a_con.contains(k)).collect();
    let b_free: Vec<usize> = (0..b.rank()).filter(|k| !b_con.contains(k)).collect();

    let mut out_shape = Vec::with_capacity(a_free.len() + b_free.len());
    out_shape.extend(a_free.iter().map(|&k| a.shape[k]));
    out_shape.extend(b_free.iter().map(|&k| b.shape[k]));
    prepare_dst(dst, &out_shape);
    if dst.is_empty() { return; }

    let con_dims: Vec<usize> = a_con.iter().map(|&k| a.shape[k]).collect();
    let abuf = a.data.borrow();
    let bbuf = b.data.borrow();
    let mut buf = dst.data.borrow_mut();

    let af_dims: Vec<usize> = a_free.iter().map(|&k| a.shape[k]).collect();
    let af_str: Vec<usize> = a_free.iter().map(|&k| a.strides[k]).collect();
    let bf_dims: Vec<usize> = b_free.iter().map(|&k| b.shape[k]).collect();
    let bf_str: Vec<usize> = b_free.iter().map(|&k| b.strides[k]).collect();
    let ac_str: Vec<usize> = a_con.iter().map(|&k| a.strides[k]).collect();
    let bc_str: Vec<usize> = b_con.iter().map(|&k| b.strides[k]).collect();

    let degenerate = con_dims.iter().any(|&d| d == 0);
    let mut ao = Odometer::new(&af_dims, &af_str);
    let mut aco = Odometer::new(&con_dims, &ac_str);
    let mut bco = Odometer::new(&con_dims, &bc_str);
    let mut wo = Odometer::new(&dst.shape, &dst.strides);
    loop {
        let mut bo = Odometer::new(&bf_dims, &bf_str);
        loop {
            let mut sum = C64::zero();
            if !degenerate {
                aco.reset();
                bco.reset();
                loop {
                    let x = read(&abuf, a, a.offset + ao.off + aco.off);
                    let y = read(&bbuf, b, b.offset + bo.off + bco.off);
                    sum += x * y;
                    if !(aco.step() && bco.step()) { break; }
                }
            }
            write(&mut buf, dst, dst.offset + wo.off, sum);
            wo.step();
            if !bo.step() { break; }
        }
        if !ao.step() { break; }
    }
}

/// Kronecker product of two matrices. The output must not alias either
/// input.
pub fn kron(dst: &mut Tensor, a: &Tensor, b: &Tensor) {
    assert_eq!(a.rank(), 2, "kron: a has rank {}", a.rank());
    assert_eq!(b.rank(), 2, "kron: b has rank {}", b.rank());
    assert!(
        !dst.same_buffer(a) && !dst.same_buffer(b),
        "kron: output aliases an input",
    );
    let (ma, na) = (a.shape[0], a.shape[1]);
    let (mb, nb) = (b.shape[0], b.shape[1]);
    prepare_dst(dst, &[ma * mb, na * nb]);
    let abuf = a.data.borrow();
    let bbuf = b.data.borrow();
    let mut buf = dst.data.borrow_mut();
    let (ds0, ds1) = (dst.strides[0], dst.strides[1]);
    for i1 in 0..ma {
        for j1 in 0..na {
            let x = read(&abuf, a, a.offset + i1 * a.strides[0] + j1 * a.strides[1]);
            for i2 in 0..mb {
                let row = dst.offset + (i1 * mb + i2) * ds0 + j1 * nb * ds1;
                let brow = b.offset + i2 * b.strides[0];
                for j2 in 0..nb {
                    let v = x * read(&bbuf, b, brow + j2 * b.strides[1]);
                    write(&mut buf, dst, row + j2 * ds1, v);
                }
            }
        }
    }
}

/// Build a vector from a slice of elements.
pub fn t1(xs: &[C64]) -> Tensor {
    let mut t = Tensor::zeros(&[xs.len()]);
    for (i, &x) in xs.iter().enumerate() {
        t.set_at(&[i], x);
    }
    t
}

/// Build a matrix from rows of elements. All rows must have equal length.
pub fn t2(rows: &[&[C64]]) -> Tensor {
    let m = rows.len();
    let n = rows.first().map_or(0, |r| r.len());
    let mut t = Tensor::zeros(&[m, n]);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), n, "t2: ragged rows");
        for (j, &x) in row.iter().enumerate() {
            t.set_at(&[i, j], x);
        }
    }
    t
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (k, d) in self.shape.iter().enumerate() {
            if k > 0 { write!(f, ",")?; }
            write!(f, "{d}")?;
        }
        write!(f, "][")?;
        for (k, index) in self.index_iter().enumerate() {
            if k > 0 { write!(f, ",")?; }
            write!(f, "{}", self.at(&index))?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    #[test]
    fn indexing_and_views() {
        let mut t = Tensor::zeros(&[2, 3]);
        t.set_at(&[0, 1], c(1.0, -2.0));
        t.set_at(&[1, 2], c(3.0, 4.0));
        assert_eq!(t.at(&[0, 1]), c(1.0, -2.0));

        // transpose shares the buffer
        let mut tt = t.transpose(&[1, 0]);
        assert_eq!(tt.at(&[1, 0]), c(1.0, -2.0));
        tt.set_at(&[2, 1], c(-1.0, 0.0));
        assert_eq!(t.at(&[1, 2]), c(-1.0, 0.0));

        // adjoint conjugates on read
        let h = t.adjoint();
        assert_eq!(h.at(&[1, 0]), c(1.0, 2.0));
        // conj is an involution
        assert_eq!(h.conj().at(&[1, 0]), c(1.0, -2.0));
    }

    #[test]
    fn conjugated_write_reads_back() {
        let mut t = Tensor::zeros(&[2, 2]);
        let mut v = t.conj();
        v.set_at(&[0, 0], c(1.0, 5.0));
        assert_eq!(v.at(&[0, 0]), c(1.0, 5.0));
        assert_eq!(t.at(&[0, 0]), c(1.0, -5.0));
    }

    #[test]
    fn slices_share_and_support_negative_bounds() {
        let mut t = Tensor::zeros(&[4, 4]);
        for index in t.index_iter() {
            t.set_at(&index, c((index[0] * 4 + index[1]) as f64, 0.0));
        }
        let s = t.slice(&[[1, 3], [-2, 4]]);
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.at(&[0, 0]), c(6.0, 0.0));
        assert_eq!(s.at(&[1, 1]), c(11.0, 0.0));

        let mut s = s;
        s.set_at(&[0, 0], c(-1.0, 0.0));
        assert_eq!(t.at(&[1, 2]), c(-1.0, 0.0));
    }

    #[test]
    fn reshape_infers_and_requires_contiguity() {
        let t = Tensor::zeros(&[2, 3, 4]);
        assert_eq!(t.reshape(&[6, -1]).shape(), &[6, 4]);
        assert_eq!(t.reshape(&[-1]).shape(), &[24]);
        // row slices of a matrix stay contiguous
        let m = Tensor::zeros(&[4, 3]);
        assert_eq!(m.slice(&[[0, 2], [0, 3]]).reshape(&[6]).shape(), &[6]);
    }

    #[test]
    #[should_panic(expected = "non-contiguous")]
    fn reshape_rejects_transposed_views() {
        let t = Tensor::zeros(&[2, 3]);
        let _ = t.transpose(&[1, 0]).reshape(&[6]);
    }

    #[test]
    fn set_copies_subblocks() {
        let mut t = Tensor::zeros(&[3, 3]);
        let src = t2(&[&[c(1.0, 0.0), c(2.0, 0.0)]]);
        t.set(&[1, 1], &src);
        assert_eq!(t.at(&[1, 1]), c(1.0, 0.0));
        assert_eq!(t.at(&[1, 2]), c(2.0, 0.0));
        assert_eq!(t.at(&[0, 0]), c(0.0, 0.0));

        // same-buffer column move, as used by eigen sorting
        let mut m = t2(&[
            &[c(1.0, 0.0), c(2.0, 0.0)],
            &[c(3.0, 0.0), c(4.0, 0.0)],
        ]);
        let col1 = m.slice(&[[0, 2], [1, 2]]);
        m.set(&[0, 0], &col1);
        assert_eq!(m.at(&[0, 0]), c(2.0, 0.0));
        assert_eq!(m.at(&[1, 0]), c(4.0, 0.0));
    }

    #[test]
    fn add_scale_mul_broadcast_and_alias() {
        let a = t2(&[&[c(1.0, 0.0), c(2.0, 0.0)], &[c(3.0, 0.0), c(4.0, 0.0)]]);
        let b = t2(&[&[c(10.0, 0.0)], &[c(20.0, 0.0)]]);
        let mut dst = Tensor::zeros(&[1]);
        add(&mut dst, &a, &b);
        assert_eq!(dst.at(&[0, 1]), c(12.0, 0.0));
        assert_eq!(dst.at(&[1, 0]), c(23.0, 0.0));

        let mut a2 = a.clone();
        let a2c = a2.clone();
        add(&mut a2, &a2c, &b);
        assert_eq!(a2.at(&[1, 1]), c(24.0, 0.0));
        // a shares the buffer with a2
        assert_eq!(a.at(&[1, 1]), c(24.0, 0.0));

        let mut s = t1(&[c(1.0, 1.0), c(2.0, 0.0)]);
        let sc = s.clone();
        scale(&mut s, c(0.0, 1.0), &sc);
        assert_eq!(s.at(&[0]), c(-1.0, 1.0));

        mul(&mut dst, &a2, &b);
        assert_eq!(dst.at(&[0, 0]), c(110.0, 0.0));
    }

    #[test]
    #[should_panic(expected = "aliases")]
    fn matmul_detects_aliasing() {
        let a = Tensor::zeros(&[2, 2]);
        let b = Tensor::zeros(&[2, 2]);
        let mut dst = a.slice(&[[0, 2], [0, 2]]);
        matmul(&mut dst, &a, &b);
    }

    #[test]
    fn matmul_honors_conj_flags() {
        let a = t2(&[&[c(1.0, 1.0), c(0.0, 2.0)]]);
        let b = t2(&[&[c(2.0, -1.0)], &[c(0.0, 1.0)]]);
        let mut dst = Tensor::zeros(&[1]);
        matmul(&mut dst, &a, &b);
        // (1+i)(2-i) + (2i)(i) = 3+i - 2 = 1+i
        assert_eq!(dst.at(&[0, 0]), c(1.0, 1.0));

        matmul(&mut dst, &a.conj(), &b);
        // (1-i)(2-i) + (-2i)(i) = 1-3i + 2 = 3-3i
        assert_eq!(dst.at(&[0, 0]), c(3.0, -3.0));

        // adjoint view feeds transposed strides and the conj flag
        let m = t2(&[&[c(1.0, 2.0), c(3.0, 0.0)], &[c(0.0, -1.0), c(2.0, 2.0)]]);
        let mut lhs = Tensor::zeros(&[1]);
        matmul(&mut lhs, &m.adjoint(), &m);
        let mut expected = Tensor::zeros(&[2, 2]);
        for i in 0..2 {
            for j in 0..2 {
                let mut sum = c(0.0, 0.0);
                for l in 0..2 {
                    sum += m.at(&[l, i]).conj() * m.at(&[l, j]);
                }
                expected.set_at(&[i, j], sum);
            }
        }
        lhs.close_to(&expected, 0.0).unwrap();
    }

    #[test]
    fn product_matches_manual_contraction() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut a = Tensor::zeros(&[2, 3, 4]);
        a.randomize(&mut rng);
        let mut b = Tensor::zeros(&[4, 2, 5]);
        b.randomize(&mut rng);

        let mut p = Tensor::zeros(&[1]);
        product(&mut p, &a, &b, &[[2, 0], [0, 1]]);
        assert_eq!(p.shape(), &[3, 5]);

        for i in 0..3 {
            for j in 0..5 {
                let mut sum = c(0.0, 0.0);
                for x in 0..2 {
                    for y in 0..4 {
                        sum += a.at(&[x, i, y]) * b.at(&[y, x, j]);
                    }
                }
                assert!((p.at(&[i, j]) - sum).norm() < 1e-5);
            }
        }
    }

    #[test]
    fn kron_of_paulis() {
        let z = t2(&[&[c(1.0, 0.0), c(0.0, 0.0)], &[c(0.0, 0.0), c(-1.0, 0.0)]]);
        let x = t2(&[&[c(0.0, 0.0), c(1.0, 0.0)], &[c(1.0, 0.0), c(0.0, 0.0)]]);
        let mut zx = Tensor::zeros(&[1]);
        kron(&mut zx, &z, &x);
        assert_eq!(zx.shape(), &[4, 4]);
        assert_eq!(zx.at(&[0, 1]), c(1.0, 0.0));
        assert_eq!(zx.at(&[1, 0]), c(1.0, 0.0));
        assert_eq!(zx.at(&[2, 3]), c(-1.0, 0.0));
        assert_eq!(zx.at(&[3, 2]), c(-1.0, 0.0));
        assert_eq!(zx.at(&[0, 3]), c(0.0, 0.0));
    }

    #[test]
    fn norms_and_triangles() {
        let mut t = t2(&[
            &[c(3.0, 4.0), c(1.0, 0.0)],
            &[c(0.0, 0.0), c(0.0, -2.0)],
        ]);
        assert_abs_diff_eq!(t.frobenius_norm(), (25.0f64 + 1.0 + 4.0).sqrt(), epsilon = 1e-6);
        assert_abs_diff_eq!(t.inf_norm(), 6.0, epsilon = 1e-6);

        t.set_at(&[1, 0], c(9.0, 0.0));
        t.triu(0);
        assert_eq!(t.at(&[1, 0]), c(0.0, 0.0));
        t.tril(0);
        assert_eq!(t.at(&[0, 1]), c(0.0, 0.0));
        assert_eq!(t.at(&[0, 0]), c(3.0, 4.0));
    }

    #[test]
    fn reset_reuses_and_detaches() {
        let mut t = Tensor::zeros(&[2, 2]);
        t.set_at(&[0, 0], c(1.0, 0.0));
        t.reset(&[3]);
        assert_eq!(t.shape(), &[3]);
        assert_eq!(t.at(&[0]), c(0.0, 0.0));

        // an outstanding view forces a fresh buffer, leaving the view intact
        let mut t = Tensor::zeros(&[2]);
        t.set_at(&[0], c(5.0, 0.0));
        let v = t.clone();
        t.reset(&[4]);
        assert_eq!(v.at(&[0]), c(5.0, 0.0));
        assert_eq!(t.at(&[0]), c(0.0, 0.0));
    }

    #[test]
    fn reset_copy_handles_aliasing_views() {
        let mut t = t2(&[
            &[c(1.0, 0.0), c(2.0, 0.0)],
            &[c(3.0, 0.0), c(4.0, 0.0)],
        ]);
        let col = t.slice(&[[0, 2], [1, 2]]);
        t.reset_copy(&col);
        assert_eq!(t.shape(), &[2, 1]);
        assert_eq!(t.at(&[0, 0]), c(2.0, 0.0));
        assert_eq!(t.at(&[1, 0]), c(4.0, 0.0));

        // adjoint source materializes the conjugate transpose
        let m = t2(&[&[c(1.0, 2.0), c(3.0, 4.0)]]);
        let mut d = Tensor::zeros(&[1]);
        d.reset_copy(&m.adjoint());
        assert_eq!(d.shape(), &[2, 1]);
        assert_eq!(d.at(&[0, 0]), c(1.0, -2.0));
        assert_eq!(d.at(&[1, 0]), c(3.0, -4.0));
    }

    #[test]
    fn eye_offsets() {
        let e = Tensor::eye(3, 1);
        assert_eq!(e.at(&[0, 1]), c(1.0, 0.0));
        assert_eq!(e.at(&[1, 2]), c(1.0, 0.0));
        assert_eq!(e.at(&[0, 0]), c(0.0, 0.0));
    }
}
