//! Instruction lowerer and block compiler.
//!
//! Drives the whole pipeline: control-flow recovery, basic-block selection
//! over the sorted reachable PCs, per-opcode lowering through a
//! [`MachineEmitter`], and finalization into an executable buffer. The
//! lowering logic is target-independent; everything machine-specific sits
//! behind the emitter trait.

use std::collections::{BTreeMap, BTreeSet};

use pvm_asm::{Args, Instruction, Opcode, Program, RegId};

use crate::cfg::ControlFlowGraph;
use crate::error::CompileError;
use crate::masm::aarch64::A64Emitter;
use crate::masm::x86_64::X64Emitter;
use crate::masm::{
    AluOp, CodeArtifact, Cond, DivKind, EmitError, Label, MachineEmitter, MemWidth,
    MulHighKind, OpWidth, RegImm, UnaryOp,
};
use crate::runtime::{CompiledProgram, Target};
use crate::state::VmExit;

/// Compile a bytecode image into an executable code buffer for `target`.
///
/// The buffer can always be inspected via [`CompiledProgram::code`];
/// invoking it additionally requires `target` to match the host.
pub fn compile(
    code: &[u8],
    bitmask: &[u8],
    entry_pc: u32,
    target: Target,
) -> Result<CompiledProgram, CompileError> {
    let program = Program::new(code, bitmask).ok_or(CompileError::MalformedImage {
        code_len: code.len(),
        bitmask_len: bitmask.len(),
    })?;
    if !program.is_boundary(entry_pc) {
        return Err(CompileError::EntryNotAligned { pc: entry_pc });
    }

    let cfg = ControlFlowGraph::build(&program, entry_pc);
    let artifact = match target {
        Target::X86_64 => lower(X64Emitter::new(program.len()), &program, &cfg, entry_pc)?,
        Target::Aarch64 => lower(A64Emitter::new(program.len()), &program, &cfg, entry_pc)?,
    };
    tracing::debug!(
        entry_pc,
        ?target,
        code_bytes = artifact.code.len(),
        "compilation finished"
    );
    CompiledProgram::new(artifact, target)
}

fn lower<E: MachineEmitter>(
    mut emitter: E,
    program: &Program<'_>,
    cfg: &ControlFlowGraph,
    entry_pc: u32,
) -> Result<CodeArtifact, CompileError> {
    // Decode everything reachable up front; a single failure aborts the
    // compilation before any code is emitted.
    let mut decoded = Vec::new();
    for pc in cfg.reachable_pcs() {
        let (instruction, size) = program.decode(pc)?;
        decoded.push((pc, instruction, size));
    }

    // Block heads: the entry, every jump target, and every PC following a
    // terminator or a gap in the reachable run.
    let mut starts = BTreeSet::new();
    let mut prev: Option<(u32, bool)> = None;
    for &(pc, instruction, size) in &decoded {
        let head = match prev {
            None => true,
            Some((end, terminated)) => terminated || end != pc || cfg.is_jump_target(pc),
        };
        if head || pc == entry_pc {
            starts.insert(pc);
        }
        prev = Some((pc + size, instruction.opcode().is_terminator()));
    }

    let labels: BTreeMap<u32, Label> = starts
        .iter()
        .map(|pc| (*pc, emitter.new_label()))
        .collect();

    emitter.emit_prologue();
    if let Some(entry_label) = labels.get(&entry_pc) {
        emitter.emit_jump(*entry_label);
    } else {
        // Reachability starts at the entry, so this only happens for an
        // empty graph (entry decodes but nothing is reachable is
        // impossible); still, fail closed.
        emitter.emit_exit(VmExit::Trap);
    }

    let mut invalid_target = None;
    let mut index = 0;
    while index < decoded.len() {
        // The block runs until a terminator, the next block head, or a gap.
        let mut end = index;
        loop {
            end += 1;
            let (pc, instruction, size) = decoded[end - 1];
            if instruction.opcode().is_terminator() || end == decoded.len() {
                break;
            }
            let next_pc = decoded[end].0;
            if next_pc != pc + size || starts.contains(&next_pc) {
                break;
            }
        }
        let block = &decoded[index..end];
        let head_pc = block[0].0;
        tracing::trace!(head_pc, len = block.len(), "emitting basic block");

        emitter.bind_label(labels[&head_pc]);
        emitter.emit_gas_check(block.len() as u32);
        for &(pc, instruction, _) in block {
            lower_instruction(&mut emitter, pc, &instruction, &labels, &mut invalid_target);
        }

        let (last_pc, last_instruction, last_size) = *block.last().expect("block is non-empty");
        if !last_instruction.opcode().is_terminator() {
            let next = last_pc + last_size;
            let continues = end < decoded.len() && decoded[end].0 == next;
            if !continues {
                // Execution would run off the image.
                emitter.emit_exit(VmExit::Trap);
            }
        }
        index = end;
    }

    if let Some(label) = invalid_target {
        emitter.bind_label(label);
        emitter.emit_exit(VmExit::Trap);
    }

    let jump_table: Vec<(u32, Label)> = labels.iter().map(|(pc, label)| (*pc, *label)).collect();
    emitter.finalize(&jump_table).map_err(|error| match error {
        EmitError::UnresolvedLabel(label) => CompileError::UnresolvedLabel {
            pc: labels
                .iter()
                .find(|(_, l)| **l == label)
                .map(|(pc, _)| *pc)
                .unwrap_or(u32::MAX),
        },
    })
}

/// Label for a decode-time jump target, or the shared invalid-target trap if
/// the CFG dropped it (out of range or misaligned).
fn target_label<E: MachineEmitter>(
    emitter: &mut E,
    labels: &BTreeMap<u32, Label>,
    invalid_target: &mut Option<Label>,
    target: u32,
) -> Label {
    match labels.get(&target) {
        Some(label) => *label,
        None => *invalid_target.get_or_insert_with(|| emitter.new_label()),
    }
}

fn sign_extend_imm(value: u32) -> u64 {
    value as i32 as i64 as u64
}

fn load_width(opcode: Opcode) -> (MemWidth, bool) {
    match opcode {
        Opcode::LoadU8 | Opcode::LoadIndU8 => (MemWidth::B1, false),
        Opcode::LoadI8 | Opcode::LoadIndI8 => (MemWidth::B1, true),
        Opcode::LoadU16 | Opcode::LoadIndU16 => (MemWidth::B2, false),
        Opcode::LoadI16 | Opcode::LoadIndI16 => (MemWidth::B2, true),
        Opcode::LoadU32 | Opcode::LoadIndU32 => (MemWidth::B4, false),
        Opcode::LoadI32 | Opcode::LoadIndI32 => (MemWidth::B4, true),
        _ => (MemWidth::B8, false),
    }
}

fn store_width(opcode: Opcode) -> MemWidth {
    match opcode {
        Opcode::StoreU8 | Opcode::StoreImmU8 | Opcode::StoreImmIndU8 | Opcode::StoreIndU8 => {
            MemWidth::B1
        }
        Opcode::StoreU16 | Opcode::StoreImmU16 | Opcode::StoreImmIndU16 | Opcode::StoreIndU16 => {
            MemWidth::B2
        }
        Opcode::StoreU32 | Opcode::StoreImmU32 | Opcode::StoreImmIndU32 | Opcode::StoreIndU32 => {
            MemWidth::B4
        }
        _ => MemWidth::B8,
    }
}

fn branch_cond(opcode: Opcode) -> Cond {
    match opcode {
        Opcode::BranchEq | Opcode::BranchEqImm => Cond::Eq,
        Opcode::BranchNe | Opcode::BranchNeImm => Cond::Ne,
        Opcode::BranchLtU | Opcode::BranchLtUImm => Cond::LtU,
        Opcode::BranchLtS | Opcode::BranchLtSImm => Cond::LtS,
        Opcode::BranchGeU | Opcode::BranchGeUImm => Cond::GeU,
        Opcode::BranchGeS | Opcode::BranchGeSImm => Cond::GeS,
        Opcode::BranchLeUImm => Cond::LeU,
        Opcode::BranchLeSImm => Cond::LeS,
        Opcode::BranchGtUImm => Cond::GtU,
        _ => Cond::GtS,
    }
}

fn lower_instruction<E: MachineEmitter>(
    emitter: &mut E,
    pc: u32,
    instruction: &Instruction,
    labels: &BTreeMap<u32, Label>,
    invalid_target: &mut Option<Label>,
) {
    use Opcode as Op;

    let opcode = instruction.opcode();
    match (opcode, *instruction.args()) {
        (Op::Trap | Op::Sbrk, _) => emitter.emit_exit(VmExit::Trap),
        (Op::Fallthrough, _) => emitter.emit_exit(VmExit::Halt),
        (Op::Ecalli, Args::Imm { value }) => emitter.emit_exit(VmExit::HostCall(value)),

        (Op::LoadImm64, Args::RegImm64 { reg, value }) => emitter.emit_load_imm(reg, value),
        (Op::LoadImm, Args::RegImm { reg, value }) => {
            emitter.emit_load_imm(reg, sign_extend_imm(value))
        }

        (
            Op::LoadU8 | Op::LoadI8 | Op::LoadU16 | Op::LoadI16 | Op::LoadU32 | Op::LoadI32
            | Op::LoadU64,
            Args::RegImm { reg, value },
        ) => {
            let (width, signed) = load_width(opcode);
            emitter.emit_load(width, signed, reg, None, value);
        }
        (
            Op::LoadIndU8 | Op::LoadIndI8 | Op::LoadIndU16 | Op::LoadIndI16 | Op::LoadIndU32
            | Op::LoadIndI32 | Op::LoadIndU64,
            Args::RegRegMem { reg, base, offset },
        ) => {
            let (width, signed) = load_width(opcode);
            emitter.emit_load(width, signed, reg, Some(base), offset);
        }

        (
            Op::StoreU8 | Op::StoreU16 | Op::StoreU32 | Op::StoreU64,
            Args::RegImm { reg, value },
        ) => emitter.emit_store(store_width(opcode), RegImm::Reg(reg), None, value),
        (
            Op::StoreImmU8 | Op::StoreImmU16 | Op::StoreImmU32 | Op::StoreImmU64,
            Args::ImmImm { address, value },
        ) => emitter.emit_store(store_width(opcode), RegImm::Imm(value), None, address),
        (
            Op::StoreImmIndU8 | Op::StoreImmIndU16 | Op::StoreImmIndU32 | Op::StoreImmIndU64,
            Args::RegImmImm { base, offset, value },
        ) => emitter.emit_store(store_width(opcode), RegImm::Imm(value), Some(base), offset),
        (
            Op::StoreIndU8 | Op::StoreIndU16 | Op::StoreIndU32 | Op::StoreIndU64,
            Args::RegRegMem { reg, base, offset },
        ) => emitter.emit_store(store_width(opcode), RegImm::Reg(reg), Some(base), offset),

        (Op::Jump, Args::Offset { .. }) => {
            let target = instruction.direct_target(pc).expect("jump has a target");
            let label = target_label(emitter, labels, invalid_target, target);
            emitter.emit_jump(label);
        }
        (Op::JumpInd, Args::Reg { reg }) => emitter.emit_jump_dynamic(reg, 0),
        (Op::LoadImmJump, Args::RegImmJump { reg, value, .. }) => {
            let target = instruction.direct_target(pc).expect("jump has a target");
            emitter.emit_load_imm(reg, sign_extend_imm(value));
            let label = target_label(emitter, labels, invalid_target, target);
            emitter.emit_jump(label);
        }
        (Op::LoadImmJumpInd, Args::RegRegImmJump { ra, rb, value, offset }) => {
            emitter.emit_load_imm_jump_ind(ra, rb, sign_extend_imm(value), offset)
        }

        (
            Op::BranchEq | Op::BranchNe | Op::BranchLtU | Op::BranchLtS | Op::BranchGeU
            | Op::BranchGeS,
            Args::RegRegOffset { reg1, reg2, .. },
        ) => {
            let target = instruction.direct_target(pc).expect("branch has a target");
            let label = target_label(emitter, labels, invalid_target, target);
            emitter.emit_branch(branch_cond(opcode), reg1, RegImm::Reg(reg2), label);
        }
        (
            Op::BranchEqImm | Op::BranchNeImm | Op::BranchLtUImm | Op::BranchLeUImm
            | Op::BranchGeUImm | Op::BranchGtUImm | Op::BranchLtSImm | Op::BranchLeSImm
            | Op::BranchGeSImm | Op::BranchGtSImm,
            Args::RegImmOffset { reg, value, .. },
        ) => {
            let target = instruction.direct_target(pc).expect("branch has a target");
            let label = target_label(emitter, labels, invalid_target, target);
            emitter.emit_branch(branch_cond(opcode), reg, RegImm::Imm(value), label);
        }

        (Op::MoveReg, Args::RegReg { src, dst }) => emitter.emit_move(dst, src),
        (Op::CountSetBits64, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::CountSetBits64, dst, src)
        }
        (Op::CountSetBits32, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::CountSetBits32, dst, src)
        }
        (Op::LeadingZeroBits64, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::LeadingZeros64, dst, src)
        }
        (Op::LeadingZeroBits32, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::LeadingZeros32, dst, src)
        }
        (Op::TrailingZeroBits64, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::TrailingZeros64, dst, src)
        }
        (Op::TrailingZeroBits32, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::TrailingZeros32, dst, src)
        }
        (Op::SignExtend8, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::SignExtend8, dst, src)
        }
        (Op::SignExtend16, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::SignExtend16, dst, src)
        }
        (Op::ZeroExtend16, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::ZeroExtend16, dst, src)
        }
        (Op::ReverseBytes, Args::RegReg { src, dst }) => {
            emitter.emit_unary(UnaryOp::ReverseBytes, dst, src)
        }

        (opcode, Args::RegRegImm { dst, src, value }) => {
            lower_alu_imm(emitter, opcode, dst, src, value)
        }
        (opcode, Args::RegRegReg { src1, src2, dst }) => {
            lower_three_reg(emitter, opcode, dst, src1, src2)
        }

        (opcode, args) => {
            unreachable!("decoder pairs {opcode} with {args:?}, which has no lowering")
        }
    }
}

/// The two-registers-plus-immediate group (opcodes 131..=161). `Alt` shift
/// and `NegAdd` forms swap the operands: the immediate becomes the left-hand
/// side.
fn lower_alu_imm<E: MachineEmitter>(
    emitter: &mut E,
    opcode: Opcode,
    dst: RegId,
    src: RegId,
    value: u64,
) {
    use Opcode as Op;

    let reg = RegImm::Reg(src);
    let imm = RegImm::Imm(value);
    match opcode {
        Op::AddImm32 => emitter.emit_alu(OpWidth::W32, AluOp::Add, dst, reg, imm),
        Op::AddImm64 => emitter.emit_alu(OpWidth::W64, AluOp::Add, dst, reg, imm),
        Op::NegAddImm32 => emitter.emit_alu(OpWidth::W32, AluOp::Sub, dst, imm, reg),
        Op::NegAddImm64 => emitter.emit_alu(OpWidth::W64, AluOp::Sub, dst, imm, reg),
        Op::MulImm32 => emitter.emit_alu(OpWidth::W32, AluOp::Mul, dst, reg, imm),
        Op::MulImm64 => emitter.emit_alu(OpWidth::W64, AluOp::Mul, dst, reg, imm),
        Op::AndImm => emitter.emit_alu(OpWidth::W64, AluOp::And, dst, reg, imm),
        Op::OrImm => emitter.emit_alu(OpWidth::W64, AluOp::Or, dst, reg, imm),
        Op::XorImm => emitter.emit_alu(OpWidth::W64, AluOp::Xor, dst, reg, imm),
        Op::SetLtUImm => emitter.emit_set_cmp(Cond::LtU, dst, src, imm),
        Op::SetLtSImm => emitter.emit_set_cmp(Cond::LtS, dst, src, imm),
        Op::SetGtUImm => emitter.emit_set_cmp(Cond::GtU, dst, src, imm),
        Op::SetGtSImm => emitter.emit_set_cmp(Cond::GtS, dst, src, imm),
        Op::ShloLImm32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftLeft, dst, reg, imm),
        Op::ShloRImm32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftRightLogical, dst, reg, imm),
        Op::SharRImm32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftRightArith, dst, reg, imm),
        Op::ShloLImmAlt32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftLeft, dst, imm, reg),
        Op::ShloRImmAlt32 => {
            emitter.emit_alu(OpWidth::W32, AluOp::ShiftRightLogical, dst, imm, reg)
        }
        Op::SharRImmAlt32 => {
            emitter.emit_alu(OpWidth::W32, AluOp::ShiftRightArith, dst, imm, reg)
        }
        Op::ShloLImm64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftLeft, dst, reg, imm),
        Op::ShloRImm64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftRightLogical, dst, reg, imm),
        Op::SharRImm64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftRightArith, dst, reg, imm),
        Op::ShloLImmAlt64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftLeft, dst, imm, reg),
        Op::ShloRImmAlt64 => {
            emitter.emit_alu(OpWidth::W64, AluOp::ShiftRightLogical, dst, imm, reg)
        }
        Op::SharRImmAlt64 => {
            emitter.emit_alu(OpWidth::W64, AluOp::ShiftRightArith, dst, imm, reg)
        }
        Op::RotR32Imm => emitter.emit_alu(OpWidth::W32, AluOp::RotateRight, dst, reg, imm),
        Op::RotR32ImmAlt => emitter.emit_alu(OpWidth::W32, AluOp::RotateRight, dst, imm, reg),
        Op::RotR64Imm => emitter.emit_alu(OpWidth::W64, AluOp::RotateRight, dst, reg, imm),
        Op::RotR64ImmAlt => emitter.emit_alu(OpWidth::W64, AluOp::RotateRight, dst, imm, reg),
        Op::CmovIzImm => emitter.emit_cmov(true, dst, imm, src),
        Op::CmovNzImm => emitter.emit_cmov(false, dst, imm, src),
        _ => unreachable!("{opcode} does not take the reg-reg-imm operand family"),
    }
}

/// The three-register group (opcodes 190..=230): `dst = src1 <op> src2`.
fn lower_three_reg<E: MachineEmitter>(
    emitter: &mut E,
    opcode: Opcode,
    dst: RegId,
    src1: RegId,
    src2: RegId,
) {
    use Opcode as Op;

    let a = RegImm::Reg(src1);
    let b = RegImm::Reg(src2);
    match opcode {
        Op::Add32 => emitter.emit_alu(OpWidth::W32, AluOp::Add, dst, a, b),
        Op::Sub32 => emitter.emit_alu(OpWidth::W32, AluOp::Sub, dst, a, b),
        Op::Mul32 => emitter.emit_alu(OpWidth::W32, AluOp::Mul, dst, a, b),
        Op::Add64 => emitter.emit_alu(OpWidth::W64, AluOp::Add, dst, a, b),
        Op::Sub64 => emitter.emit_alu(OpWidth::W64, AluOp::Sub, dst, a, b),
        Op::Mul64 => emitter.emit_alu(OpWidth::W64, AluOp::Mul, dst, a, b),
        Op::DivU32 => emitter.emit_div_rem(OpWidth::W32, DivKind::DivU, dst, src1, b),
        Op::DivS32 => emitter.emit_div_rem(OpWidth::W32, DivKind::DivS, dst, src1, b),
        Op::RemU32 => emitter.emit_div_rem(OpWidth::W32, DivKind::RemU, dst, src1, b),
        Op::RemS32 => emitter.emit_div_rem(OpWidth::W32, DivKind::RemS, dst, src1, b),
        Op::DivU64 => emitter.emit_div_rem(OpWidth::W64, DivKind::DivU, dst, src1, b),
        Op::DivS64 => emitter.emit_div_rem(OpWidth::W64, DivKind::DivS, dst, src1, b),
        Op::RemU64 => emitter.emit_div_rem(OpWidth::W64, DivKind::RemU, dst, src1, b),
        Op::RemS64 => emitter.emit_div_rem(OpWidth::W64, DivKind::RemS, dst, src1, b),
        Op::ShloL32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftLeft, dst, a, b),
        Op::ShloR32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftRightLogical, dst, a, b),
        Op::SharR32 => emitter.emit_alu(OpWidth::W32, AluOp::ShiftRightArith, dst, a, b),
        Op::ShloL64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftLeft, dst, a, b),
        Op::ShloR64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftRightLogical, dst, a, b),
        Op::SharR64 => emitter.emit_alu(OpWidth::W64, AluOp::ShiftRightArith, dst, a, b),
        Op::And => emitter.emit_alu(OpWidth::W64, AluOp::And, dst, a, b),
        Op::Or => emitter.emit_alu(OpWidth::W64, AluOp::Or, dst, a, b),
        Op::Xor => emitter.emit_alu(OpWidth::W64, AluOp::Xor, dst, a, b),
        Op::AndInv => emitter.emit_alu(OpWidth::W64, AluOp::AndInv, dst, a, b),
        Op::OrInv => emitter.emit_alu(OpWidth::W64, AluOp::OrInv, dst, a, b),
        Op::Xnor => emitter.emit_alu(OpWidth::W64, AluOp::Xnor, dst, a, b),
        Op::RotL32 => emitter.emit_alu(OpWidth::W32, AluOp::RotateLeft, dst, a, b),
        Op::RotR32 => emitter.emit_alu(OpWidth::W32, AluOp::RotateRight, dst, a, b),
        Op::RotL64 => emitter.emit_alu(OpWidth::W64, AluOp::RotateLeft, dst, a, b),
        Op::RotR64 => emitter.emit_alu(OpWidth::W64, AluOp::RotateRight, dst, a, b),
        Op::MulUpperSS => emitter.emit_mul_high(MulHighKind::SignedSigned, dst, src1, src2),
        Op::MulUpperUU => emitter.emit_mul_high(MulHighKind::UnsignedUnsigned, dst, src1, src2),
        Op::MulUpperSU => emitter.emit_mul_high(MulHighKind::SignedUnsigned, dst, src1, src2),
        Op::SetLtU => emitter.emit_set_cmp(Cond::LtU, dst, src1, b),
        Op::SetLtS => emitter.emit_set_cmp(Cond::LtS, dst, src1, b),
        Op::CmovIz => emitter.emit_cmov(true, dst, a, src2),
        Op::CmovNz => emitter.emit_cmov(false, dst, a, src2),
        Op::Max => emitter.emit_minmax(true, true, dst, src1, src2),
        Op::MaxU => emitter.emit_minmax(false, true, dst, src1, src2),
        Op::Min => emitter.emit_minmax(true, false, dst, src1, src2),
        Op::MinU => emitter.emit_minmax(false, false, dst, src1, src2),
        _ => unreachable!("{opcode} does not take the three-register operand family"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ImageBuilder;
    use pvm_asm::DecodeError;

    #[test]
    fn misaligned_entry_is_rejected() {
        let (code, mask) = ImageBuilder::new().halt().build();
        let error = compile(&code, &mask, 7, Target::X86_64).unwrap_err();
        assert_eq!(error, CompileError::EntryNotAligned { pc: 7 });
    }

    #[test]
    fn short_bitmask_is_rejected() {
        let error = compile(&[1; 16], &[0xFF], 0, Target::X86_64).unwrap_err();
        assert!(matches!(error, CompileError::MalformedImage { .. }));
    }

    #[test]
    fn unknown_opcode_in_reachable_code_fails_compilation() {
        let (code, mask) = ImageBuilder::new().op(&[2]).build();
        let error = compile(&code, &mask, 0, Target::X86_64).unwrap_err();
        assert_eq!(
            error,
            CompileError::Decode(DecodeError::UnknownOpcode { pc: 0, opcode: 2 })
        );
    }

    #[test]
    fn unknown_opcode_in_unreachable_code_is_ignored() {
        // The bogus byte sits after a terminator and is never decoded.
        let (code, mask) = ImageBuilder::new().halt().op(&[2]).build();
        assert!(compile(&code, &mask, 0, Target::X86_64).is_ok());
    }

    #[test]
    fn truncated_operand_fails_compilation() {
        // LoadImm needs four immediate bytes; the image ends after one.
        let (code, mask) = ImageBuilder::new().op(&[51, 0, 5]).build();
        let error = compile(&code, &mask, 0, Target::X86_64).unwrap_err();
        assert!(matches!(
            error,
            CompileError::Decode(DecodeError::TruncatedOperand { pc: 0, .. })
        ));
    }

    #[test]
    fn both_targets_produce_code() {
        let (code, mask) = ImageBuilder::new()
            .load_imm(1, 5)
            .load_imm(2, 7)
            .add_32(0, 1, 2)
            .halt()
            .build();
        for target in [Target::X86_64, Target::Aarch64] {
            let compiled = compile(&code, &mask, 0, target).unwrap();
            assert!(!compiled.code().is_empty());
            assert_eq!(compiled.entry_offset(), 0);
            assert_eq!(compiled.target(), target);
        }
    }

    #[test]
    fn every_straight_line_opcode_compiles() {
        // One block touching each lowering family keeps the big match
        // honest on both backends.
        let mut image = ImageBuilder::new();
        image
            .load_imm64(1, 0x0102_0304_0506_0708)
            .load_imm(2, 3)
            .op(&[100, 1, 3]) // move r3, r1
            .op(&[102, 1, 4]) // countsetbits64 r4, r1
            .op(&[103, 1, 4])
            .op(&[104, 1, 4])
            .op(&[105, 1, 4])
            .op(&[106, 1, 4])
            .op(&[107, 1, 4])
            .op(&[108, 1, 4])
            .op(&[109, 1, 4])
            .op(&[110, 1, 4])
            .op(&[111, 1, 4]);
        // The whole reg-reg-imm family.
        for opcode in 131..=161u8 {
            image.reg_reg_imm(opcode, 5, 1, 9);
        }
        // The whole three-register family.
        for opcode in 190..=230u8 {
            image.three_reg(opcode, 5, 1, 2);
        }
        let (code, mask) = image.halt().build();
        for target in [Target::X86_64, Target::Aarch64] {
            compile(&code, &mask, 0, target).unwrap();
        }
    }
}
