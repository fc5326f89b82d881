//! Runtime exit representation for JIT'd code.

/// Exit code returned by JIT'd code on normal termination.
pub const EXIT_HALT: i64 = 0;
/// Exit code for an explicit or implicit trap.
pub const EXIT_TRAP: i64 = -1;
/// Exit code when the gas counter would go negative.
pub const EXIT_OUT_OF_GAS: i64 = -2;
/// Exit code for a guest memory access past the end of memory.
pub const EXIT_MEMORY_FAULT: i64 = -3;
/// Exit code for a division or remainder by zero.
pub const EXIT_DIVISION_BY_ZERO: i64 = -4;

/// Resulting state of one invocation of a compiled program.
///
/// JIT'd code conveys its outcome purely through the integer return value of
/// the entry function; this enum is the decoded form. Positive return values
/// carry a host-call index biased by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmExit {
    /// Normal termination.
    Halt,
    /// The program trapped.
    Trap,
    /// The gas counter went negative at a block head.
    OutOfGas,
    /// A load or store was out of bounds; memory is unchanged.
    MemoryFault,
    /// A division or remainder instruction saw a zero divisor.
    DivisionByZero,
    /// The program requested host call `0` with the given index; the host
    /// services it and may re-enter the program.
    HostCall(u32),
}

impl VmExit {
    /// The integer exit code this outcome is encoded as.
    pub const fn code(self) -> i64 {
        match self {
            Self::Halt => EXIT_HALT,
            Self::Trap => EXIT_TRAP,
            Self::OutOfGas => EXIT_OUT_OF_GAS,
            Self::MemoryFault => EXIT_MEMORY_FAULT,
            Self::DivisionByZero => EXIT_DIVISION_BY_ZERO,
            Self::HostCall(index) => index as i64 + 1,
        }
    }

    /// Decode an entry-function return value.
    ///
    /// Unknown negative codes fold into [`VmExit::Trap`]; anything positive
    /// is a host-call request.
    pub const fn from_code(code: i64) -> Self {
        match code {
            EXIT_HALT => Self::Halt,
            EXIT_OUT_OF_GAS => Self::OutOfGas,
            EXIT_MEMORY_FAULT => Self::MemoryFault,
            EXIT_DIVISION_BY_ZERO => Self::DivisionByZero,
            code if code > 0 => Self::HostCall((code - 1) as u32),
            _ => Self::Trap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        let exits = [
            VmExit::Halt,
            VmExit::Trap,
            VmExit::OutOfGas,
            VmExit::MemoryFault,
            VmExit::DivisionByZero,
            VmExit::HostCall(0),
            VmExit::HostCall(41),
        ];
        for exit in exits {
            assert_eq!(VmExit::from_code(exit.code()), exit);
        }
    }

    #[test]
    fn host_call_index_is_biased_by_one() {
        assert_eq!(VmExit::HostCall(0).code(), 1);
        assert_eq!(VmExit::from_code(7), VmExit::HostCall(6));
    }
}
