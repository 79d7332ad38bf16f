//! x86-64 assembly infrastructure for the Opal inline-cache JIT.
//!
//! This crate provides the machinery the IC rewriter emits code through:
//! - `registers`: GPR/XMM definitions, register sets, DWARF numbering and
//!   System V AMD64 classification
//! - `encoder`: REX/ModRM/SIB instruction encoding primitives
//! - `assembler`: fixed-capacity byte emitter with overflow tracking,
//!   jump targeting relative to the buffer start, and forward-jump patching

pub mod assembler;
pub mod encoder;
pub mod registers;

pub use assembler::{Assembler, ForwardJump, JumpDest, MovWidth};
pub use encoder::{Cond, Mem};
pub use registers::{GenericReg, Gpr, GprSet, Xmm, XmmSet};
