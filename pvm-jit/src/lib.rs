//! PVM bytecode recompiler.
//!
//! Takes a linear bytecode image plus its instruction-boundary bitmask,
//! recovers the control-flow structure reachable from an entry PC, and emits
//! native machine code (x86-64 or AArch64) that executes the program directly
//! while preserving the VM semantics: thirteen 64-bit registers, a bounded
//! guest memory with per-access checks, per-block gas accounting, and integer
//! exit codes for every runtime outcome.
//!
//! ```no_run
//! use pvm_jit::{compile, Target, VmExit};
//!
//! # fn example(code: &[u8], bitmask: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let program = compile(code, bitmask, 0, Target::host().unwrap())?;
//!
//! let mut registers = [0u64; pvm_asm::VM_REGISTER_COUNT];
//! let mut memory = vec![0u8; 0x10000];
//! let mut gas = 1_000i64;
//! match program.run(&mut registers, &mut memory, &mut gas)? {
//!     VmExit::Halt => {}
//!     VmExit::HostCall(_index) => { /* service the call, re-enter */ }
//!     other => return Err(format!("guest failed: {other:?}").into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Compilation is a pure function from image to code buffer: nothing is
//! persisted and no state is shared between compilations. Runtime failures
//! never unwind out of generated code; they surface as [`VmExit`] values.

#![warn(missing_docs)]

mod buffer;
pub mod cfg;
mod compiler;
mod error;
pub mod masm;
mod runtime;
mod state;

#[cfg(any(test, feature = "test-helpers"))]
pub mod util;

pub use compiler::compile;
pub use error::CompileError;
pub use runtime::{CompiledProgram, EntryFn, Target, TargetMismatch};
pub use state::{
    VmExit, EXIT_DIVISION_BY_ZERO, EXIT_HALT, EXIT_MEMORY_FAULT, EXIT_OUT_OF_GAS, EXIT_TRAP,
};
