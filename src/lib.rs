//! Eigensolvers and matrix-product-state ground-state search for
//! transverse-field Ising models.
//!
//! The crate is built around three cooperating numerical cores:
//!
//! - a dense complex eigensolver ([`eig`]) implementing the non-symmetric QR
//!   algorithm with balancing, Hessenberg reduction, Wilkinson shifts and
//!   implicit bulge chasing, together with a Golub–Kahan singular value
//!   decomposition ([`svd`]);
//! - an implicitly restarted Arnoldi method ([`arnoldi`]) that projects a
//!   large operator onto a small Krylov subspace and hands the projected
//!   Hessenberg matrix to the dense solver;
//! - a DMRG-style matrix product state ground-state search ([`mps`]) that
//!   reduces the exponentially large lattice eigenproblem to a sequence of
//!   small local problems solved by the Arnoldi core.
//!
//! Everything rests on the dense tensor kernel in [`tensor`], which provides
//! N-dimensional complex arrays with zero-copy slice/reshape/transpose views
//! and lazy conjugation.
//!
//! Hamiltonians for the transverse-field Ising model are provided both as
//! dense matrices and matrix-free operators ([`ising`]) and as matrix product
//! operators ([`hamiltonian`]).
//!
//! # Example
//!
//! Find the ground-state energy of an 8-site Ising chain at the critical
//! field by exact diagonalization:
//!
//! ```no_run
//! use qspin::{ eig::Eig, ising, tensor::Tensor, C64 };
//!
//! let mut h = Tensor::zeros(&[1]);
//! let mut buf = Tensor::zeros(&[1]);
//! ising::transverse_field_ising(&mut h, &mut buf, [8, 1], C64::new(1.0, 0.0));
//!
//! let mut solver = Eig::new();
//! let (vals, _vecs) = solver.solve(&h).unwrap();
//! println!("E0 = {}", vals.at(&[0]).re);
//! ```

pub use num_complex::Complex64 as C64;

pub mod tensor;
pub mod house;
pub mod decomp;
pub mod eig;
pub mod svd;
pub mod arnoldi;
pub mod mps;
pub mod hamiltonian;
pub mod ising;

/// Machine precision of the `f64` scalar used throughout.
pub const EPSILON: f64 = f64::EPSILON; // 0x1p-52

/// Safe minimum such that `1.0 / SAFMIN` does not overflow.
pub const SAFMIN: f64 = f64::MIN_POSITIVE; // 0x1p-1022
