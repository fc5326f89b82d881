//! Compile-time error types.
//!
//! Runtime failures never appear here: they are encoded as integer exit codes
//! by the emitted machine code (see [`crate::state::VmExit`]).

use pvm_asm::DecodeError;

/// Failure modes of a compilation.
///
/// Any of these aborts the compilation; no partial code buffer is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[must_use]
pub enum CompileError {
    /// The entry PC does not sit on an instruction boundary.
    #[error("entry pc {pc:#x} is not at an instruction boundary")]
    EntryNotAligned {
        /// Requested entry PC.
        pc: u32,
    },
    /// The image or its bitmask is malformed (image over the 2^32 - 1 byte
    /// limit, or mask shorter than the image).
    #[error("bytecode image and bitmask are inconsistent ({code_len} code bytes, {bitmask_len} mask bytes)")]
    MalformedImage {
        /// Image length in bytes.
        code_len: usize,
        /// Bitmask length in bytes.
        bitmask_len: usize,
    },
    /// A reachable instruction failed to decode.
    #[error("reachable instruction failed to decode: {0}")]
    Decode(#[from] DecodeError),
    /// A referenced label never received a host offset.
    #[error("unresolved jump label for guest pc {pc:#x}")]
    UnresolvedLabel {
        /// Guest PC the label was allocated for, if known.
        pc: u32,
    },
    /// Mapping the emitted code as executable memory failed.
    #[error("failed to map executable memory: errno {errno}")]
    ExecMap {
        /// Raw `errno` from the failed `mmap`/`mprotect` call.
        errno: i32,
    },
}
