//! Atomic types of the PVM recompiler.
//!
//! This crate defines the instruction-set primitives shared by every stage of
//! the recompiler: register identifiers, the byte-to-opcode table, the decoded
//! instruction sum type, and the boundary-bitmask driven bytecode reader.
//!
//! The bytecode format is variable-length. Instruction boundaries are *not*
//! recovered from the opcodes themselves; they come from a bitmask supplied
//! alongside the image, in which bit `i` is set iff a new instruction begins
//! at byte `i`. The reader here treats that mask as authoritative and never
//! steps past a boundary on its own.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

mod instruction;
mod opcode;
mod program;
mod reg;

pub use instruction::{Args, DecodeError, Instruction};
pub use opcode::Opcode;
pub use program::Program;
pub use reg::RegId;

/// Register type for the PVM register file.
pub type Word = u64;

/// Number of general-purpose registers in the PVM register file.
pub const VM_REGISTER_COUNT: usize = 13;
