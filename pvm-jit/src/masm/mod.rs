//! Host assembler abstraction.
//!
//! The block compiler drives a [`MachineEmitter`]; the per-target encodings
//! live in parallel backend modules ([`x86_64`], [`aarch64`]) that share this
//! facade. There is no live-range analysis: the guest register file stays in
//! memory behind a pinned host register, and a handful of pinned host
//! registers carry the memory base, memory size, gas pointer and host
//! context. Each backend documents its binding; the binding is stable across
//! every emitter of that backend.

pub mod aarch64;
mod label;
pub mod x86_64;

pub use label::Label;
pub(crate) use label::{FixupKind, Labels};

use pvm_asm::RegId;

use crate::state::VmExit;

/// Operand width of an ALU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpWidth {
    /// 32-bit operation; the destination is zero-extended to 64 bits.
    W32,
    /// Full 64-bit operation.
    W64,
}

/// Access width of a guest memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    /// One byte.
    B1,
    /// Two bytes.
    B2,
    /// Four bytes.
    B4,
    /// Eight bytes.
    B8,
}

impl MemWidth {
    /// Access width in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            Self::B1 => 1,
            Self::B2 => 2,
            Self::B4 => 4,
            Self::B8 => 8,
        }
    }
}

/// Two-operand ALU operations shared by the register and immediate forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication (low half).
    Mul,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// `lhs & !rhs`.
    AndInv,
    /// `lhs | !rhs`.
    OrInv,
    /// `!(lhs ^ rhs)`.
    Xnor,
    /// Logical shift left; the count is taken modulo the width.
    ShiftLeft,
    /// Logical shift right.
    ShiftRightLogical,
    /// Arithmetic shift right.
    ShiftRightArith,
    /// Rotate left.
    RotateLeft,
    /// Rotate right.
    RotateRight,
}

/// Division and remainder flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivKind {
    /// Unsigned quotient.
    DivU,
    /// Signed quotient; `MIN / -1` produces `MIN` without trapping.
    DivS,
    /// Unsigned remainder.
    RemU,
    /// Signed remainder; `MIN % -1` produces `0` without trapping.
    RemS,
}

/// Signedness combinations of the upper-half multiply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulHighKind {
    /// Both operands signed.
    SignedSigned,
    /// Both operands unsigned.
    UnsignedUnsigned,
    /// First operand signed, second unsigned.
    SignedUnsigned,
}

/// One-operand register transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Population count of the full register.
    CountSetBits64,
    /// Population count of the low 32 bits.
    CountSetBits32,
    /// Leading zeros of the full register.
    LeadingZeros64,
    /// Leading zeros of the low 32 bits.
    LeadingZeros32,
    /// Trailing zeros of the full register.
    TrailingZeros64,
    /// Trailing zeros of the low 32 bits.
    TrailingZeros32,
    /// Sign-extend the low 8 bits to 64.
    SignExtend8,
    /// Sign-extend the low 16 bits to 64.
    SignExtend16,
    /// Zero-extend the low 16 bits.
    ZeroExtend16,
    /// Byte-reverse the full register.
    ReverseBytes,
}

/// Comparison predicates; all compare full 64-bit register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned less-than.
    LtU,
    /// Signed less-than.
    LtS,
    /// Unsigned less-or-equal.
    LeU,
    /// Signed less-or-equal.
    LeS,
    /// Unsigned greater-or-equal.
    GeU,
    /// Signed greater-or-equal.
    GeS,
    /// Unsigned greater-than.
    GtU,
    /// Signed greater-than.
    GtS,
}

/// A guest register or an immediate operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegImm {
    /// Operand comes from a guest register.
    Reg(RegId),
    /// Operand is a materialized immediate. Immediates the instruction set
    /// treats as signed are already sign-extended to 64 bits.
    Imm(u64),
}

/// Backend failure surfaced by [`MachineEmitter::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    /// A fixup references a label that never got bound.
    UnresolvedLabel(Label),
}

/// Finished machine code, prior to being mapped executable.
#[derive(Debug)]
pub struct CodeArtifact {
    /// Emitted bytes: prologue, block bodies, thunks, dispatch table.
    pub code: Vec<u8>,
    /// Offset of the entry point within `code`. The prologue is emitted
    /// first, so this is always zero today.
    pub entry_offset: u32,
}

/// The per-target emission facade the block compiler is generic over.
///
/// Every method appends code at the current end of the buffer. Labels are
/// forward-referencable; unresolved references are recorded as fixups and
/// patched in [`Self::finalize`].
pub trait MachineEmitter {
    /// Allocate a fresh, unbound label.
    fn new_label(&mut self) -> Label;

    /// Bind `label` to the current offset.
    fn bind_label(&mut self, label: Label);

    /// Entry sequence: save callee-saved registers and move the entry
    /// arguments (register file, memory base, memory size, gas pointer,
    /// context) into their pinned host registers.
    fn emit_prologue(&mut self);

    /// Charge `cost` gas at a block head; exits with the out-of-gas code if
    /// the counter goes negative.
    fn emit_gas_check(&mut self, cost: u32);

    /// `dst = value`.
    fn emit_load_imm(&mut self, dst: RegId, value: u64);

    /// `dst = src`.
    fn emit_move(&mut self, dst: RegId, src: RegId);

    /// `dst = lhs <op> rhs` at the given width; 32-bit results are
    /// zero-extended.
    fn emit_alu(&mut self, width: OpWidth, op: AluOp, dst: RegId, lhs: RegImm, rhs: RegImm);

    /// Checked division/remainder; a zero divisor exits with the
    /// division-by-zero code before any register is written.
    fn emit_div_rem(
        &mut self,
        width: OpWidth,
        kind: DivKind,
        dst: RegId,
        dividend: RegId,
        divisor: RegImm,
    );

    /// `dst = high 64 bits of a * b`.
    fn emit_mul_high(&mut self, kind: MulHighKind, dst: RegId, a: RegId, b: RegId);

    /// `dst = op(src)`.
    fn emit_unary(&mut self, op: UnaryOp, dst: RegId, src: RegId);

    /// `dst = (a <cond> b) as u64`.
    fn emit_set_cmp(&mut self, cond: Cond, dst: RegId, a: RegId, b: RegImm);

    /// `dst = src` iff `cond == 0` (`when_zero`) or `cond != 0`; otherwise
    /// `dst` is left unchanged.
    fn emit_cmov(&mut self, when_zero: bool, dst: RegId, src: RegImm, cond: RegId);

    /// `dst = max(a, b)` or `min(a, b)` with the given signedness.
    fn emit_minmax(&mut self, signed: bool, is_max: bool, dst: RegId, a: RegId, b: RegId);

    /// Bounds-checked guest load. The effective address is
    /// `(base + offset) mod 2^32`, or `offset` alone for the direct forms;
    /// an access past the end of memory exits with the memory-fault code.
    fn emit_load(
        &mut self,
        width: MemWidth,
        signed: bool,
        dst: RegId,
        base: Option<RegId>,
        offset: u32,
    );

    /// Bounds-checked guest store of a register or immediate value.
    fn emit_store(&mut self, width: MemWidth, value: RegImm, base: Option<RegId>, offset: u32);

    /// Compare-and-branch to `target`; fall-through continues naturally.
    fn emit_branch(&mut self, cond: Cond, a: RegId, b: RegImm, target: Label);

    /// Unconditional branch to `target`.
    fn emit_jump(&mut self, target: Label);

    /// Indirect jump: look up `(regs[base] + offset) mod 2^32` in the
    /// PC-to-host-offset table and jump there, trapping on a miss.
    fn emit_jump_dynamic(&mut self, base: RegId, offset: u32);

    /// `LoadImmJumpInd`: compute the target from the *old* value of `rb`,
    /// then store `value` into `ra`, then dispatch. Handles `ra == rb`.
    fn emit_load_imm_jump_ind(&mut self, ra: RegId, rb: RegId, value: u64, offset: u32);

    /// Materialize `exit.code()` in the return register and leave through
    /// the epilogue.
    fn emit_exit(&mut self, exit: VmExit);

    /// Emit the shared trap thunks, the dynamic-dispatch sequence, the
    /// epilogue and the PC-to-host-offset table; resolve all fixups.
    ///
    /// `jump_table` lists every basic-block head as `(guest pc, label)`;
    /// these become the valid targets of indirect jumps.
    fn finalize(self, jump_table: &[(u32, Label)]) -> Result<CodeArtifact, EmitError>
    where
        Self: Sized;
}

/// Growable little-endian byte sink both backends write into.
#[derive(Debug, Default)]
pub(crate) struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub(crate) fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub(crate) fn u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_u32(&self, at: u32) -> u32 {
        let at = at as usize;
        u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap())
    }

    pub(crate) fn patch_u32(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
