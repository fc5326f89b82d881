use core::fmt;

use crate::{Opcode, RegId};

/// Operand payload of a decoded instruction, one variant per operand-layout
/// family of the instruction set.
///
/// Only the fields an opcode defines are meaningful; the mapping from opcode
/// to family is fixed by [`Instruction::decode`]. Immediates that the
/// instruction set treats as signed are stored sign-extended to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Args {
    /// No operands (`Trap`, `Fallthrough`).
    None,
    /// A bare 32-bit immediate (`Ecalli` call index).
    Imm {
        /// Immediate value.
        value: u32,
    },
    /// Register and full-width immediate (`LoadImm64`).
    RegImm64 {
        /// Destination register.
        reg: RegId,
        /// Immediate value.
        value: u64,
    },
    /// Two immediates: a direct address and a value (`StoreImmU*`).
    ImmImm {
        /// Guest address written to.
        address: u32,
        /// Value to store, zero-extended from the access width.
        value: u64,
    },
    /// A bare signed PC-relative offset (`Jump`).
    Offset {
        /// Branch displacement relative to the instruction start.
        offset: i32,
    },
    /// A single register (`JumpInd`).
    Reg {
        /// Register holding the jump target PC.
        reg: RegId,
    },
    /// Register plus 32-bit immediate (`LoadImm` and the direct-form
    /// loads/stores, where the immediate is the guest address).
    RegImm {
        /// Data register.
        reg: RegId,
        /// Immediate value or direct address.
        value: u32,
    },
    /// Base register, offset and value (`StoreImmIndU*`).
    RegImmImm {
        /// Base address register.
        base: RegId,
        /// Offset added to the base register.
        offset: u32,
        /// Value to store, zero-extended from the access width.
        value: u64,
    },
    /// Register, comparand and signed branch offset (`Branch*Imm`).
    RegImmOffset {
        /// Register compared against the immediate.
        reg: RegId,
        /// Comparand.
        value: u64,
        /// Branch displacement relative to the instruction start.
        offset: i32,
    },
    /// Register, immediate and *unsigned* PC-relative offset
    /// (`LoadImmJump`).
    RegImmJump {
        /// Destination register for the immediate.
        reg: RegId,
        /// Immediate value loaded before the jump.
        value: u32,
        /// Unsigned displacement relative to the instruction start.
        offset: u32,
    },
    /// Source and destination registers (the two-register unary group,
    /// `MoveReg`..`ReverseBytes`).
    RegReg {
        /// Source register.
        src: RegId,
        /// Destination register.
        dst: RegId,
    },
    /// Destination, source and sign-extended immediate (the immediate-ALU
    /// group, `AddImm32`..`RotR32ImmAlt`).
    RegRegImm {
        /// Destination register.
        dst: RegId,
        /// Source register.
        src: RegId,
        /// Immediate, sign-extended from 32 bits.
        value: u64,
    },
    /// Data register, base register and offset (the indirect loads and
    /// stores).
    RegRegMem {
        /// Loaded-into or stored-from register.
        reg: RegId,
        /// Base address register.
        base: RegId,
        /// Offset added to the base register.
        offset: u32,
    },
    /// Two registers and a signed branch offset (`Branch*`).
    RegRegOffset {
        /// First comparand register.
        reg1: RegId,
        /// Second comparand register.
        reg2: RegId,
        /// Branch displacement relative to the instruction start.
        offset: i32,
    },
    /// Two registers, immediate and offset (`LoadImmJumpInd`).
    RegRegImmJump {
        /// Destination register for the immediate.
        ra: RegId,
        /// Register holding the jump base PC.
        rb: RegId,
        /// Immediate value loaded before the jump.
        value: u32,
        /// Offset added to the base register, mod 2^32.
        offset: u32,
    },
    /// Three registers (`Add32`..`MinU`): two sources and a destination.
    RegRegReg {
        /// First source register.
        src1: RegId,
        /// Second source register.
        src2: RegId,
        /// Destination register.
        dst: RegId,
    },
}

/// A decoded PVM instruction: the opcode tag plus its operand payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    opcode: Opcode,
    args: Args,
}

/// Failure modes of the bytecode reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The PC lies outside the bytecode image.
    OutOfRange {
        /// Offending program counter.
        pc: u32,
    },
    /// The boundary bitmask does not mark an instruction start at this PC.
    NotABoundary {
        /// Offending program counter.
        pc: u32,
    },
    /// The opcode byte maps to no known instruction.
    UnknownOpcode {
        /// Program counter of the instruction.
        pc: u32,
        /// Raw opcode byte.
        opcode: u8,
    },
    /// The boundary-delimited window is shorter than the opcode's fixed
    /// operand layout.
    TruncatedOperand {
        /// Program counter of the instruction.
        pc: u32,
        /// Opcode whose operands were cut short.
        opcode: Opcode,
    },
    /// A register operand byte is outside `0..13`.
    InvalidRegister {
        /// Program counter of the instruction.
        pc: u32,
        /// Raw register index byte.
        index: u8,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { pc } => {
                write!(f, "pc {pc:#x} is outside the bytecode image")
            }
            Self::NotABoundary { pc } => {
                write!(f, "pc {pc:#x} is not at an instruction boundary")
            }
            Self::UnknownOpcode { pc, opcode } => {
                write!(f, "unknown opcode {opcode:#04x} at pc {pc:#x}")
            }
            Self::TruncatedOperand { pc, opcode } => {
                write!(f, "truncated operands for {opcode} at pc {pc:#x}")
            }
            Self::InvalidRegister { pc, index } => {
                write!(f, "register index {index} out of range at pc {pc:#x}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// Operand reader over one boundary-delimited instruction window.
struct Operands<'a> {
    bytes: &'a [u8],
    at: usize,
    pc: u32,
    opcode: Opcode,
}

impl<'a> Operands<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.at.checked_add(n).filter(|end| *end <= self.bytes.len());
        let end = end.ok_or(DecodeError::TruncatedOperand {
            pc: self.pc,
            opcode: self.opcode,
        })?;
        let out = &self.bytes[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn reg(&mut self) -> Result<RegId, DecodeError> {
        let index = self.take(1)?[0];
        RegId::try_new(index).ok_or(DecodeError::InvalidRegister { pc: self.pc, index })
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.u32().map(|v| v as i32)
    }

    /// A 32-bit immediate sign-extended to 64 bits.
    fn simm(&mut self) -> Result<u64, DecodeError> {
        self.i32().map(|v| v as i64 as u64)
    }
}

impl Instruction {
    /// Decode the instruction occupying `window` bytes at `pc`.
    ///
    /// `window` is the boundary-delimited length supplied by the bitmask; the
    /// operand layout must fit inside it. The caller is responsible for the
    /// boundary and range checks (see [`crate::Program::decode`]).
    pub fn decode(code: &[u8], pc: u32, window: u32) -> Result<Self, DecodeError> {
        use Opcode::*;

        let start = pc as usize;
        let end = start
            .checked_add(window as usize)
            .filter(|end| *end <= code.len() && window > 0)
            .ok_or(DecodeError::OutOfRange { pc })?;
        let byte = *code.get(start).ok_or(DecodeError::OutOfRange { pc })?;
        let opcode =
            Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode { pc, opcode: byte })?;

        let mut ops = Operands {
            bytes: &code[start + 1..end],
            at: 0,
            pc,
            opcode,
        };

        let args = match opcode {
            Trap | Fallthrough => Args::None,

            Ecalli => Args::Imm { value: ops.u32()? },

            LoadImm64 => Args::RegImm64 {
                reg: ops.reg()?,
                value: ops.u64()?,
            },

            StoreImmU8 => {
                let value = ops.u8()? as u64;
                Args::ImmImm {
                    value,
                    address: ops.u32()?,
                }
            }
            StoreImmU16 => {
                let value = ops.u16()? as u64;
                Args::ImmImm {
                    value,
                    address: ops.u32()?,
                }
            }
            StoreImmU32 => {
                let value = ops.u32()? as u64;
                Args::ImmImm {
                    value,
                    address: ops.u32()?,
                }
            }
            StoreImmU64 => {
                let value = ops.u64()?;
                Args::ImmImm {
                    value,
                    address: ops.u32()?,
                }
            }

            Jump => Args::Offset { offset: ops.i32()? },

            JumpInd => Args::Reg { reg: ops.reg()? },

            LoadImm | LoadU8 | LoadI8 | LoadU16 | LoadI16 | LoadU32 | LoadI32 | LoadU64
            | StoreU8 | StoreU16 | StoreU32 | StoreU64 => Args::RegImm {
                reg: ops.reg()?,
                value: ops.u32()?,
            },

            StoreImmIndU8 => {
                let base = ops.reg()?;
                let offset = ops.u32()?;
                Args::RegImmImm {
                    base,
                    offset,
                    value: ops.u8()? as u64,
                }
            }
            StoreImmIndU16 => {
                let base = ops.reg()?;
                let offset = ops.u32()?;
                Args::RegImmImm {
                    base,
                    offset,
                    value: ops.u16()? as u64,
                }
            }
            StoreImmIndU32 => {
                let base = ops.reg()?;
                let offset = ops.u32()?;
                Args::RegImmImm {
                    base,
                    offset,
                    value: ops.u32()? as u64,
                }
            }
            StoreImmIndU64 => {
                let base = ops.reg()?;
                let offset = ops.u32()?;
                Args::RegImmImm {
                    base,
                    offset,
                    value: ops.u64()?,
                }
            }

            LoadImmJump => Args::RegImmJump {
                reg: ops.reg()?,
                value: ops.u32()?,
                offset: ops.u32()?,
            },

            BranchEqImm | BranchNeImm | BranchLtUImm | BranchLeUImm | BranchGeUImm
            | BranchGtUImm | BranchLtSImm | BranchLeSImm | BranchGeSImm | BranchGtSImm => {
                Args::RegImmOffset {
                    reg: ops.reg()?,
                    value: ops.u64()?,
                    offset: ops.i32()?,
                }
            }

            MoveReg | Sbrk | CountSetBits64 | CountSetBits32 | LeadingZeroBits64
            | LeadingZeroBits32 | TrailingZeroBits64 | TrailingZeroBits32 | SignExtend8
            | SignExtend16 | ZeroExtend16 | ReverseBytes => Args::RegReg {
                src: ops.reg()?,
                dst: ops.reg()?,
            },

            StoreIndU8 | StoreIndU16 | StoreIndU32 | StoreIndU64 => Args::RegRegMem {
                reg: ops.reg()?,
                base: ops.reg()?,
                offset: ops.u32()?,
            },

            LoadIndU8 | LoadIndI8 | LoadIndU16 | LoadIndI16 | LoadIndU32 | LoadIndI32
            | LoadIndU64 => Args::RegRegMem {
                reg: ops.reg()?,
                base: ops.reg()?,
                offset: ops.u32()?,
            },

            AddImm32 | AndImm | XorImm | OrImm | MulImm32 | SetLtUImm | SetLtSImm
            | ShloLImm32 | ShloRImm32 | SharRImm32 | NegAddImm32 | SetGtUImm | SetGtSImm
            | ShloLImmAlt32 | ShloRImmAlt32 | SharRImmAlt32 | CmovIzImm | CmovNzImm
            | AddImm64 | MulImm64 | ShloLImm64 | ShloRImm64 | SharRImm64 | NegAddImm64
            | ShloLImmAlt64 | ShloRImmAlt64 | SharRImmAlt64 | RotR64Imm | RotR64ImmAlt
            | RotR32Imm | RotR32ImmAlt => Args::RegRegImm {
                dst: ops.reg()?,
                src: ops.reg()?,
                value: ops.simm()?,
            },

            BranchEq | BranchNe | BranchLtU | BranchLtS | BranchGeU | BranchGeS => {
                Args::RegRegOffset {
                    reg1: ops.reg()?,
                    reg2: ops.reg()?,
                    offset: ops.i32()?,
                }
            }

            LoadImmJumpInd => Args::RegRegImmJump {
                ra: ops.reg()?,
                rb: ops.reg()?,
                value: ops.u32()?,
                offset: ops.u32()?,
            },

            Add32 | Sub32 | Mul32 | DivU32 | DivS32 | RemU32 | RemS32 | ShloL32 | ShloR32
            | SharR32 | Add64 | Sub64 | Mul64 | DivU64 | DivS64 | RemU64 | RemS64
            | ShloL64 | ShloR64 | SharR64 | And | Xor | Or | MulUpperSS | MulUpperUU
            | MulUpperSU | SetLtU | SetLtS | CmovIz | CmovNz | RotL64 | RotL32 | RotR64
            | RotR32 | AndInv | OrInv | Xnor | Max | MaxU | Min | MinU => Args::RegRegReg {
                src1: ops.reg()?,
                src2: ops.reg()?,
                dst: ops.reg()?,
            },
        };

        Ok(Self { opcode, args })
    }

    /// The opcode tag.
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The operand payload.
    pub const fn args(&self) -> &Args {
        &self.args
    }

    /// The branch or jump target of a direct control-flow instruction at
    /// `pc`, computed in wrapping 32-bit arithmetic.
    ///
    /// Branches and `Jump` use signed displacements; `LoadImmJump` uses an
    /// unsigned one. Indirect jumps and straight-line instructions have no
    /// decode-time target and return `None`.
    pub fn direct_target(&self, pc: u32) -> Option<u32> {
        match self.args {
            Args::Offset { offset } => Some(pc.wrapping_add(offset as u32)),
            Args::RegRegOffset { offset, .. } => Some(pc.wrapping_add(offset as u32)),
            Args::RegImmOffset { offset, .. } => Some(pc.wrapping_add(offset as u32)),
            Args::RegImmJump { offset, .. } => Some(pc.wrapping_add(offset)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decode_one(bytes: &[u8]) -> Result<Instruction, DecodeError> {
        Instruction::decode(bytes, 0, bytes.len() as u32)
    }

    #[test]
    fn trap_and_fallthrough() {
        let instr = decode_one(&[0]).unwrap();
        assert_eq!(instr.opcode(), Opcode::Trap);
        assert_eq!(*instr.args(), Args::None);

        let instr = decode_one(&[1]).unwrap();
        assert_eq!(instr.opcode(), Opcode::Fallthrough);
    }

    #[test]
    fn load_imm64_layout() {
        let mut bytes = vec![20, 1];
        bytes.extend_from_slice(&0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(instr.opcode(), Opcode::LoadImm64);
        assert_eq!(
            *instr.args(),
            Args::RegImm64 {
                reg: RegId::new(1),
                value: 0xDEAD_BEEF_CAFE_BABE,
            }
        );
    }

    #[test]
    fn load_imm_is_sign_extended_by_consumers() {
        let mut bytes = vec![51, 2];
        bytes.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(
            *instr.args(),
            Args::RegImm {
                reg: RegId::new(2),
                value: 0xFFFF_FFFF,
            }
        );
    }

    #[rstest]
    #[case(30, &[0xAA][..], 0xAA)]
    #[case(31, &0x1122u16.to_le_bytes()[..], 0x1122)]
    #[case(32, &0x1122_3344u32.to_le_bytes()[..], 0x1122_3344)]
    #[case(33, &0x1122_3344_5566_7788u64.to_le_bytes()[..], 0x1122_3344_5566_7788)]
    fn store_imm_layouts(#[case] opcode: u8, #[case] value: &[u8], #[case] expect: u64) {
        let mut bytes = vec![opcode];
        bytes.extend_from_slice(value);
        bytes.extend_from_slice(&0x8000u32.to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(
            *instr.args(),
            Args::ImmImm {
                address: 0x8000,
                value: expect,
            }
        );
    }

    #[test]
    fn jump_target_is_signed_pc_relative() {
        let mut bytes = vec![40];
        bytes.extend_from_slice(&(-4i32).to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(instr.direct_target(100), Some(96));
    }

    #[test]
    fn load_imm_jump_target_is_unsigned() {
        // An offset with the sign bit set still moves forward.
        let mut bytes = vec![80, 0];
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0x8000_0000u32.to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(instr.direct_target(4), Some(0x8000_0004));
    }

    #[test]
    fn branch_layout_and_target() {
        let mut bytes = vec![170, 3, 4];
        bytes.extend_from_slice(&6i32.to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(
            *instr.args(),
            Args::RegRegOffset {
                reg1: RegId::new(3),
                reg2: RegId::new(4),
                offset: 6,
            }
        );
        assert_eq!(instr.direct_target(10), Some(16));
    }

    #[test]
    fn branch_imm_carries_full_width_comparand() {
        let mut bytes = vec![81, 5];
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&8i32.to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(
            *instr.args(),
            Args::RegImmOffset {
                reg: RegId::new(5),
                value: u64::MAX,
                offset: 8,
            }
        );
    }

    #[test]
    fn alu_imm_sign_extends() {
        let mut bytes = vec![149, 0, 1];
        bytes.extend_from_slice(&(-2i32).to_le_bytes());
        let instr = decode_one(&bytes).unwrap();
        assert_eq!(
            *instr.args(),
            Args::RegRegImm {
                dst: RegId::new(0),
                src: RegId::new(1),
                value: (-2i64) as u64,
            }
        );
    }

    #[test]
    fn three_reg_layout() {
        let instr = decode_one(&[190, 1, 2, 0]).unwrap();
        assert_eq!(
            *instr.args(),
            Args::RegRegReg {
                src1: RegId::new(1),
                src2: RegId::new(2),
                dst: RegId::new(0),
            }
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(
            decode_one(&[2]),
            Err(DecodeError::UnknownOpcode { pc: 0, opcode: 2 })
        );
    }

    #[test]
    fn truncated_operand_is_rejected() {
        // LoadImm64 wants 9 operand bytes; give it 3.
        let err = decode_one(&[20, 1, 0xAA, 0xBB]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TruncatedOperand {
                pc: 0,
                opcode: Opcode::LoadImm64,
            }
        );
    }

    #[test]
    fn register_out_of_range_is_rejected() {
        let mut bytes = vec![51, 13];
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            decode_one(&bytes),
            Err(DecodeError::InvalidRegister { pc: 0, index: 13 })
        );
    }
}
