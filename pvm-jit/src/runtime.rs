//! Invoking compiled code.

use core::ffi::c_void;

use pvm_asm::{Word, VM_REGISTER_COUNT};

use crate::buffer::ExecMemory;
use crate::error::CompileError;
use crate::masm::CodeArtifact;
use crate::state::VmExit;

/// Architecture a program is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Aarch64,
}

impl Target {
    /// The target matching the machine this process runs on, if supported.
    pub const fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Aarch64)
        } else {
            None
        }
    }

    /// Whether this target can execute on the current host.
    pub fn is_host(self) -> bool {
        Self::host() == Some(self)
    }
}

/// ABI of the generated entry point: register file, memory base, memory
/// size, gas counter, opaque host context; returns the exit code.
pub type EntryFn =
    unsafe extern "C" fn(*mut Word, *mut u8, u64, *mut i64, *mut c_void) -> i64;

/// Attempting to run a program compiled for a different architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("program is compiled for {target:?}, which is not the host architecture")]
pub struct TargetMismatch {
    /// The architecture the program was compiled for.
    target: Target,
}

/// An executable compiled program.
///
/// The buffer is sealed read+execute and is safe to share across threads;
/// each invocation carries its own register file, memory and gas state, so
/// concurrent runs need distinct state, not distinct programs.
#[derive(Debug)]
pub struct CompiledProgram {
    memory: ExecMemory,
    target: Target,
    entry_offset: u32,
}

impl CompiledProgram {
    pub(crate) fn new(artifact: CodeArtifact, target: Target) -> Result<Self, CompileError> {
        let memory = ExecMemory::map(&artifact.code)?;
        Ok(Self {
            memory,
            target,
            entry_offset: artifact.entry_offset,
        })
    }

    /// The architecture this program was compiled for.
    pub fn target(&self) -> Target {
        self.target
    }

    /// The emitted machine code, for inspection.
    pub fn code(&self) -> &[u8] {
        self.memory.code()
    }

    /// Offset of the entry point within [`Self::code`].
    pub fn entry_offset(&self) -> u32 {
        self.entry_offset
    }

    /// Run the program with a null host context.
    ///
    /// See [`Self::run_with_context`].
    pub fn run(
        &self,
        registers: &mut [Word; VM_REGISTER_COUNT],
        memory: &mut [u8],
        gas: &mut i64,
    ) -> Result<VmExit, TargetMismatch> {
        self.run_with_context(registers, memory, gas, core::ptr::null_mut())
    }

    /// Run the program on the host, mapping the returned exit code.
    ///
    /// `context` is passed through to the pinned host-context register and
    /// is otherwise uninterpreted by generated code.
    pub fn run_with_context(
        &self,
        registers: &mut [Word; VM_REGISTER_COUNT],
        memory: &mut [u8],
        gas: &mut i64,
        context: *mut c_void,
    ) -> Result<VmExit, TargetMismatch> {
        if !self.target.is_host() {
            return Err(TargetMismatch { target: self.target });
        }
        let entry: EntryFn = unsafe {
            core::mem::transmute(self.memory.as_ptr().add(self.entry_offset as usize))
        };
        let code = unsafe {
            entry(
                registers.as_mut_ptr(),
                memory.as_mut_ptr(),
                memory.len() as u64,
                gas,
                context,
            )
        };
        Ok(VmExit::from_code(code))
    }
}
