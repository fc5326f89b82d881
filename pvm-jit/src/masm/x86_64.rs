//! x86-64 backend.
//!
//! Register binding, stable across every emitter:
//!
//! | Host  | Role                        |
//! |-------|-----------------------------|
//! | `rbx` | guest register file pointer |
//! | `r12` | guest memory base           |
//! | `r13` | guest memory size           |
//! | `r14` | gas counter pointer         |
//! | `r15` | host context pointer        |
//! | `rax`, `rdx`, `rcx` | scratch       |
//!
//! Guest register `i` lives at `[rbx + 8*i]`. All five pinned registers are
//! callee-saved, so JIT'd code only spills them once in the prologue. The
//! entry point follows the SysV ABI: `rdi` register file, `rsi` memory base,
//! `rdx` memory size, `rcx` gas pointer, `r8` context.

use pvm_asm::RegId;

use super::{
    AluOp, CodeArtifact, CodeBuf, Cond, DivKind, EmitError, FixupKind, Label, Labels,
    MachineEmitter, MemWidth, MulHighKind, OpWidth, RegImm, UnaryOp,
};
use crate::state::{
    VmExit, EXIT_DIVISION_BY_ZERO, EXIT_MEMORY_FAULT, EXIT_OUT_OF_GAS, EXIT_TRAP,
};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

// Condition codes as used by jcc/setcc/cmovcc.
const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_BE: u8 = 0x6;
const CC_A: u8 = 0x7;
const CC_S: u8 = 0x8;
const CC_L: u8 = 0xC;
const CC_GE: u8 = 0xD;
const CC_LE: u8 = 0xE;
const CC_G: u8 = 0xF;

fn cc_for(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => CC_E,
        Cond::Ne => CC_NE,
        Cond::LtU => CC_B,
        Cond::LtS => CC_L,
        Cond::LeU => CC_BE,
        Cond::LeS => CC_LE,
        Cond::GeU => CC_AE,
        Cond::GeS => CC_GE,
        Cond::GtU => CC_A,
        Cond::GtS => CC_G,
    }
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

fn rex(w: bool, reg: u8, index: u8, rm: u8) -> u8 {
    let mut rex = 0x40;
    if w {
        rex |= 0x08;
    }
    if reg >= 8 {
        rex |= 0x04;
    }
    if index >= 8 {
        rex |= 0x02;
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    rex
}

/// Machine-code emitter for x86-64.
pub struct X64Emitter {
    code: CodeBuf,
    labels: Labels,
    guest_len: u32,
    base: Label,
    epilogue: Label,
    trap: Label,
    out_of_gas: Label,
    mem_fault: Label,
    div_zero: Label,
    dispatch: Label,
    table: Label,
}

impl X64Emitter {
    /// Create an emitter for an image of `guest_len` bytecode bytes.
    pub fn new(guest_len: u32) -> Self {
        let mut labels = Labels::default();
        let base = labels.alloc();
        labels.bind(base, 0);
        let epilogue = labels.alloc();
        let trap = labels.alloc();
        let out_of_gas = labels.alloc();
        let mem_fault = labels.alloc();
        let div_zero = labels.alloc();
        let dispatch = labels.alloc();
        let table = labels.alloc();
        Self {
            code: CodeBuf::default(),
            labels,
            guest_len,
            base,
            epilogue,
            trap,
            out_of_gas,
            mem_fault,
            div_zero,
            dispatch,
            table,
        }
    }

    fn rex_opt(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        let byte = rex(w, reg, index, rm);
        if byte != 0x40 {
            self.code.u8(byte);
        }
    }

    fn push(&mut self, r: u8) {
        if r >= 8 {
            self.code.u8(0x41);
        }
        self.code.u8(0x50 + (r & 7));
    }

    fn pop(&mut self, r: u8) {
        if r >= 8 {
            self.code.u8(0x41);
        }
        self.code.u8(0x58 + (r & 7));
    }

    /// `mov r64, r64` (or the 32-bit form).
    fn mov_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.rex_opt(w, src, 0, dst);
        self.code.u8(0x89);
        self.code.u8(modrm(3, src, dst));
    }

    /// `mov r32, imm32` (zero-extends).
    fn mov_ri32(&mut self, dst: u8, imm: u32) {
        self.rex_opt(false, 0, 0, dst);
        self.code.u8(0xB8 + (dst & 7));
        self.code.u32(imm);
    }

    /// `mov r64, imm32` (sign-extends).
    fn mov_ri32_sx(&mut self, dst: u8, imm: i32) {
        self.code.u8(rex(true, 0, 0, dst));
        self.code.u8(0xC7);
        self.code.u8(modrm(3, 0, dst));
        self.code.u32(imm as u32);
    }

    /// `movabs r64, imm64`.
    fn mov_ri64(&mut self, dst: u8, imm: u64) {
        self.code.u8(rex(true, 0, 0, dst));
        self.code.u8(0xB8 + (dst & 7));
        self.code.u64(imm);
    }

    /// Materialize an arbitrary 64-bit value using the shortest of the three
    /// mov forms.
    fn load_const(&mut self, dst: u8, value: u64) {
        if let Ok(imm) = u32::try_from(value) {
            self.mov_ri32(dst, imm);
        } else if let Ok(imm) = i32::try_from(value as i64) {
            self.mov_ri32_sx(dst, imm);
        } else {
            self.mov_ri64(dst, value);
        }
    }

    /// `mov host, qword [rbx + 8*reg]`.
    fn guest_load64(&mut self, host: u8, reg: RegId) {
        self.code.u8(rex(true, host, 0, RBX));
        self.code.u8(0x8B);
        self.code.u8(modrm(1, host, RBX));
        self.code.u8(reg.slot_offset() as u8);
    }

    /// `mov host32, dword [rbx + 8*reg]` (zero-extends).
    fn guest_load32(&mut self, host: u8, reg: RegId) {
        self.rex_opt(false, host, 0, RBX);
        self.code.u8(0x8B);
        self.code.u8(modrm(1, host, RBX));
        self.code.u8(reg.slot_offset() as u8);
    }

    /// `mov qword [rbx + 8*reg], host`.
    fn guest_store64(&mut self, reg: RegId, host: u8) {
        self.code.u8(rex(true, host, 0, RBX));
        self.code.u8(0x89);
        self.code.u8(modrm(1, host, RBX));
        self.code.u8(reg.slot_offset() as u8);
    }

    /// Load a guest register or constant into a scratch register at the
    /// requested width.
    fn operand(&mut self, width: OpWidth, host: u8, value: RegImm) {
        match (value, width) {
            (RegImm::Reg(reg), OpWidth::W64) => self.guest_load64(host, reg),
            (RegImm::Reg(reg), OpWidth::W32) => self.guest_load32(host, reg),
            (RegImm::Imm(imm), OpWidth::W64) => self.load_const(host, imm),
            (RegImm::Imm(imm), OpWidth::W32) => self.mov_ri32(host, imm as u32),
        }
    }

    /// Classic two-operand ALU instruction, `op r/m, reg` form.
    fn alu_rr(&mut self, w: bool, opcode: u8, rm: u8, reg: u8) {
        self.rex_opt(w, reg, 0, rm);
        self.code.u8(opcode);
        self.code.u8(modrm(3, reg, rm));
    }

    /// `imul reg, r/m`.
    fn imul_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.rex_opt(w, dst, 0, src);
        self.code.bytes(&[0x0F, 0xAF]);
        self.code.u8(modrm(3, dst, src));
    }

    /// F7 group: /2 not, /3 neg, /4 mul, /5 imul, /6 div, /7 idiv.
    fn f7(&mut self, w: bool, ext: u8, rm: u8) {
        self.rex_opt(w, 0, 0, rm);
        self.code.u8(0xF7);
        self.code.u8(modrm(3, ext, rm));
    }

    /// D3 group shift/rotate by `cl`: /0 rol, /1 ror, /4 shl, /5 shr, /7 sar.
    fn shift_cl(&mut self, w: bool, ext: u8, rm: u8) {
        self.rex_opt(w, 0, 0, rm);
        self.code.u8(0xD3);
        self.code.u8(modrm(3, ext, rm));
    }

    /// C1 group shift/rotate by an immediate count.
    fn shift_imm(&mut self, w: bool, ext: u8, rm: u8, count: u8) {
        self.rex_opt(w, 0, 0, rm);
        self.code.u8(0xC1);
        self.code.u8(modrm(3, ext, rm));
        self.code.u8(count);
    }

    fn test_rr(&mut self, w: bool, a: u8, b: u8) {
        self.alu_rr(w, 0x85, a, b);
    }

    /// `cmp r/m, imm8` (sign-extended).
    fn cmp_ri8(&mut self, w: bool, rm: u8, imm: i8) {
        self.rex_opt(w, 0, 0, rm);
        self.code.u8(0x83);
        self.code.u8(modrm(3, 7, rm));
        self.code.u8(imm as u8);
    }

    /// `cmp eax, imm32`.
    fn cmp_eax_imm(&mut self, imm: u32) {
        self.code.u8(0x3D);
        self.code.u32(imm);
    }

    /// `add eax, imm32`.
    fn add_eax_imm(&mut self, imm: u32) {
        self.code.u8(0x05);
        self.code.u32(imm);
    }

    fn setcc(&mut self, cc: u8, rm: u8) {
        self.code.bytes(&[0x0F, 0x90 + cc]);
        self.code.u8(modrm(3, 0, rm));
    }

    fn cmovcc(&mut self, cc: u8, dst: u8, src: u8) {
        self.code.u8(rex(true, dst, 0, src));
        self.code.bytes(&[0x0F, 0x40 + cc]);
        self.code.u8(modrm(3, dst, src));
    }

    fn jcc(&mut self, cc: u8, target: Label) {
        self.code.bytes(&[0x0F, 0x80 + cc]);
        self.labels.record(self.code.offset(), target, FixupKind::PcRel32);
        self.code.u32(0);
    }

    fn jmp(&mut self, target: Label) {
        self.code.u8(0xE9);
        self.labels.record(self.code.offset(), target, FixupKind::PcRel32);
        self.code.u32(0);
    }

    /// `lea r64, [rip + target]`.
    fn lea_rip(&mut self, dst: u8, target: Label) {
        self.code.u8(rex(true, dst, 0, 0));
        self.code.u8(0x8D);
        self.code.u8(modrm(0, dst, 5));
        self.labels.record(self.code.offset(), target, FixupKind::PcRel32);
        self.code.u32(0);
    }

    /// F3-prefixed 0F extension: popcnt (0xB8), tzcnt (0xBC), lzcnt (0xBD),
    /// on `rax` in place.
    fn bitcount_rax(&mut self, opcode: u8, w: bool) {
        self.code.u8(0xF3);
        if w {
            self.code.u8(rex(true, 0, 0, 0));
        }
        self.code.bytes(&[0x0F, opcode]);
        self.code.u8(modrm(3, RAX, RAX));
    }

    /// ModRM + SIB for `[r12 + rax]`; the REX prefix (with any `reg`
    /// extension plus REX.B for r12) must already be emitted by the caller
    /// through `mem_insn`.
    fn mem_sib(&mut self, reg: u8) {
        self.code.u8(modrm(0, reg, 4));
        self.code.u8(0x04); // scale 1, index rax, base r12
    }

    /// One guest-memory instruction addressing `[r12 + rax]`.
    fn mem_insn(&mut self, prefix66: bool, w: bool, opcodes: &[u8], reg: u8) {
        if prefix66 {
            self.code.u8(0x66);
        }
        self.code.u8(rex(w, reg, 0, R12));
        self.code.bytes(opcodes);
        self.mem_sib(reg);
    }

    /// Effective address of a guest access into `eax`, wrapping mod 2^32.
    fn effective_address(&mut self, base: Option<RegId>, offset: u32) {
        match base {
            Some(base) => {
                self.guest_load32(RAX, base);
                if offset != 0 {
                    self.add_eax_imm(offset);
                }
            }
            None => self.mov_ri32(RAX, offset),
        }
    }

    /// Compare `rax + width` against the memory size and escape to the
    /// memory-fault thunk on overflow. Clobbers `rdx`.
    fn bounds_check(&mut self, width: MemWidth) {
        // lea rdx, [rax + width]; the 64-bit add cannot wrap for a 32-bit
        // address, so a single unsigned compare suffices.
        self.code.u8(rex(true, RDX, 0, RAX));
        self.code.u8(0x8D);
        self.code.u8(modrm(1, RDX, RAX));
        self.code.u8(width.bytes() as u8);
        // cmp rdx, r13
        self.alu_rr(true, 0x39, RDX, R13);
        self.jcc(CC_A, self.mem_fault);
    }

    /// Set the exit code in `rax`.
    fn exit_code(&mut self, code: i64) {
        if code == 0 {
            self.alu_rr(false, 0x31, RAX, RAX);
        } else if let Ok(imm) = i32::try_from(code) {
            self.mov_ri32_sx(RAX, imm);
        } else {
            self.mov_ri64(RAX, code as u64);
        }
    }
}

impl MachineEmitter for X64Emitter {
    fn new_label(&mut self) -> Label {
        self.labels.alloc()
    }

    fn bind_label(&mut self, label: Label) {
        self.labels.bind(label, self.code.offset());
    }

    fn emit_prologue(&mut self) {
        for r in [RBP, RBX, R12, R13, R14, R15] {
            self.push(r);
        }
        self.mov_rr(true, RBX, RDI);
        self.mov_rr(true, R12, RSI);
        self.mov_rr(true, R13, RDX);
        self.mov_rr(true, R14, RCX);
        self.mov_rr(true, R15, R8);
    }

    fn emit_gas_check(&mut self, cost: u32) {
        if let Ok(imm) = i32::try_from(cost) {
            // sub qword [r14], imm32
            self.code.u8(rex(true, 0, 0, R14));
            self.code.u8(0x81);
            self.code.u8(modrm(0, 5, R14));
            self.code.u32(imm as u32);
        } else {
            self.mov_ri32(RAX, cost);
            // sub qword [r14], rax
            self.code.u8(rex(true, RAX, 0, R14));
            self.code.u8(0x29);
            self.code.u8(modrm(0, RAX, R14));
        }
        self.jcc(CC_S, self.out_of_gas);
    }

    fn emit_load_imm(&mut self, dst: RegId, value: u64) {
        self.load_const(RAX, value);
        self.guest_store64(dst, RAX);
    }

    fn emit_move(&mut self, dst: RegId, src: RegId) {
        self.guest_load64(RAX, src);
        self.guest_store64(dst, RAX);
    }

    fn emit_alu(&mut self, width: OpWidth, op: AluOp, dst: RegId, lhs: RegImm, rhs: RegImm) {
        let w = width == OpWidth::W64;
        self.operand(width, RAX, lhs);
        match op {
            AluOp::Add | AluOp::Sub | AluOp::And | AluOp::Or | AluOp::Xor => {
                let opcode = match op {
                    AluOp::Add => 0x01,
                    AluOp::Sub => 0x29,
                    AluOp::And => 0x21,
                    AluOp::Or => 0x09,
                    _ => 0x31,
                };
                self.operand(width, RDX, rhs);
                self.alu_rr(w, opcode, RAX, RDX);
            }
            AluOp::Mul => {
                self.operand(width, RDX, rhs);
                self.imul_rr(w, RAX, RDX);
            }
            AluOp::AndInv | AluOp::OrInv => {
                self.operand(width, RDX, rhs);
                self.f7(w, 2, RDX);
                let opcode = if op == AluOp::AndInv { 0x21 } else { 0x09 };
                self.alu_rr(w, opcode, RAX, RDX);
            }
            AluOp::Xnor => {
                self.operand(width, RDX, rhs);
                self.alu_rr(w, 0x31, RAX, RDX);
                self.f7(w, 2, RAX);
            }
            AluOp::ShiftLeft
            | AluOp::ShiftRightLogical
            | AluOp::ShiftRightArith
            | AluOp::RotateLeft
            | AluOp::RotateRight => {
                let ext = match op {
                    AluOp::ShiftLeft => 4,
                    AluOp::ShiftRightLogical => 5,
                    AluOp::ShiftRightArith => 7,
                    AluOp::RotateLeft => 0,
                    _ => 1,
                };
                // The hardware masks the count in cl to the operand width.
                self.operand(width, RCX, rhs);
                self.shift_cl(w, ext, RAX);
            }
        }
        self.guest_store64(dst, RAX);
    }

    fn emit_div_rem(
        &mut self,
        width: OpWidth,
        kind: DivKind,
        dst: RegId,
        dividend: RegId,
        divisor: RegImm,
    ) {
        let w = width == OpWidth::W64;
        let rem = matches!(kind, DivKind::RemU | DivKind::RemS);

        self.operand(width, RCX, divisor);
        self.test_rr(w, RCX, RCX);
        self.jcc(CC_E, self.div_zero);
        match width {
            OpWidth::W64 => self.guest_load64(RAX, dividend),
            OpWidth::W32 => self.guest_load32(RAX, dividend),
        }

        match kind {
            DivKind::DivU | DivKind::RemU => {
                self.alu_rr(false, 0x31, RDX, RDX);
                self.f7(w, 6, RCX);
                if rem {
                    self.mov_rr(w, RAX, RDX);
                }
            }
            DivKind::DivS | DivKind::RemS => {
                // MIN / -1 overflows idiv on the host; short-circuit it to
                // the wrapped quotient / zero remainder the VM mandates.
                let do_div = self.labels.alloc();
                let done = self.labels.alloc();
                self.cmp_ri8(w, RCX, -1);
                self.jcc(CC_NE, do_div);
                if w {
                    self.mov_ri64(RDX, i64::MIN as u64);
                    self.alu_rr(true, 0x39, RAX, RDX);
                } else {
                    self.cmp_eax_imm(0x8000_0000);
                }
                self.jcc(CC_NE, do_div);
                if rem {
                    self.alu_rr(false, 0x31, RAX, RAX);
                }
                self.jmp(done);
                self.bind_label(do_div);
                if w {
                    self.code.bytes(&[0x48, 0x99]); // cqo
                } else {
                    self.code.u8(0x99); // cdq
                }
                self.f7(w, 7, RCX);
                if rem {
                    self.mov_rr(w, RAX, RDX);
                }
                self.bind_label(done);
            }
        }
        self.guest_store64(dst, RAX);
    }

    fn emit_mul_high(&mut self, kind: MulHighKind, dst: RegId, a: RegId, b: RegId) {
        self.guest_load64(RAX, a);
        self.guest_load64(RCX, b);
        match kind {
            MulHighKind::UnsignedUnsigned => self.f7(true, 4, RCX),
            MulHighKind::SignedSigned => self.f7(true, 5, RCX),
            MulHighKind::SignedUnsigned => {
                // high = umulh(a, b) - (a < 0 ? b : 0)
                self.f7(true, 4, RCX);
                self.guest_load64(RAX, a);
                self.shift_imm(true, 7, RAX, 63);
                self.alu_rr(true, 0x21, RAX, RCX);
                self.alu_rr(true, 0x29, RDX, RAX);
            }
        }
        self.guest_store64(dst, RDX);
    }

    fn emit_unary(&mut self, op: UnaryOp, dst: RegId, src: RegId) {
        match op {
            UnaryOp::CountSetBits64 => {
                self.guest_load64(RAX, src);
                self.bitcount_rax(0xB8, true);
            }
            UnaryOp::CountSetBits32 => {
                self.guest_load32(RAX, src);
                self.bitcount_rax(0xB8, false);
            }
            UnaryOp::LeadingZeros64 => {
                self.guest_load64(RAX, src);
                self.bitcount_rax(0xBD, true);
            }
            UnaryOp::LeadingZeros32 => {
                self.guest_load32(RAX, src);
                self.bitcount_rax(0xBD, false);
            }
            UnaryOp::TrailingZeros64 => {
                self.guest_load64(RAX, src);
                self.bitcount_rax(0xBC, true);
            }
            UnaryOp::TrailingZeros32 => {
                self.guest_load32(RAX, src);
                self.bitcount_rax(0xBC, false);
            }
            UnaryOp::SignExtend8 => {
                self.guest_load64(RAX, src);
                // movsx rax, al
                self.code.bytes(&[0x48, 0x0F, 0xBE, 0xC0]);
            }
            UnaryOp::SignExtend16 => {
                self.guest_load64(RAX, src);
                // movsx rax, ax
                self.code.bytes(&[0x48, 0x0F, 0xBF, 0xC0]);
            }
            UnaryOp::ZeroExtend16 => {
                self.guest_load32(RAX, src);
                // movzx eax, ax
                self.code.bytes(&[0x0F, 0xB7, 0xC0]);
            }
            UnaryOp::ReverseBytes => {
                self.guest_load64(RAX, src);
                // bswap rax
                self.code.bytes(&[0x48, 0x0F, 0xC8]);
            }
        }
        self.guest_store64(dst, RAX);
    }

    fn emit_set_cmp(&mut self, cond: Cond, dst: RegId, a: RegId, b: RegImm) {
        self.guest_load64(RAX, a);
        self.operand(OpWidth::W64, RDX, b);
        // xor clears flags, so it has to come before the compare.
        self.alu_rr(false, 0x31, RCX, RCX);
        self.alu_rr(true, 0x39, RAX, RDX);
        self.setcc(cc_for(cond), RCX);
        self.guest_store64(dst, RCX);
    }

    fn emit_cmov(&mut self, when_zero: bool, dst: RegId, src: RegImm, cond: RegId) {
        self.guest_load64(RCX, cond);
        self.operand(OpWidth::W64, RAX, src);
        self.guest_load64(RDX, dst);
        self.test_rr(true, RCX, RCX);
        self.cmovcc(if when_zero { CC_E } else { CC_NE }, RDX, RAX);
        self.guest_store64(dst, RDX);
    }

    fn emit_minmax(&mut self, signed: bool, is_max: bool, dst: RegId, a: RegId, b: RegId) {
        self.guest_load64(RAX, a);
        self.guest_load64(RDX, b);
        self.alu_rr(true, 0x39, RAX, RDX);
        let cc = match (signed, is_max) {
            (true, true) => CC_L,
            (false, true) => CC_B,
            (true, false) => CC_G,
            (false, false) => CC_A,
        };
        self.cmovcc(cc, RAX, RDX);
        self.guest_store64(dst, RAX);
    }

    fn emit_load(
        &mut self,
        width: MemWidth,
        signed: bool,
        dst: RegId,
        base: Option<RegId>,
        offset: u32,
    ) {
        self.effective_address(base, offset);
        self.bounds_check(width);
        match (width, signed) {
            (MemWidth::B1, false) => self.mem_insn(false, false, &[0x0F, 0xB6], RDX),
            (MemWidth::B1, true) => self.mem_insn(false, true, &[0x0F, 0xBE], RDX),
            (MemWidth::B2, false) => self.mem_insn(false, false, &[0x0F, 0xB7], RDX),
            (MemWidth::B2, true) => self.mem_insn(false, true, &[0x0F, 0xBF], RDX),
            (MemWidth::B4, false) => self.mem_insn(false, false, &[0x8B], RDX),
            (MemWidth::B4, true) => self.mem_insn(false, true, &[0x63], RDX),
            (MemWidth::B8, _) => self.mem_insn(false, true, &[0x8B], RDX),
        }
        self.guest_store64(dst, RDX);
    }

    fn emit_store(&mut self, width: MemWidth, value: RegImm, base: Option<RegId>, offset: u32) {
        self.effective_address(base, offset);
        self.bounds_check(width);
        match value {
            RegImm::Reg(reg) => self.guest_load64(RDX, reg),
            RegImm::Imm(imm) => self.load_const(RDX, imm),
        }
        match width {
            MemWidth::B1 => self.mem_insn(false, false, &[0x88], RDX),
            MemWidth::B2 => self.mem_insn(true, false, &[0x89], RDX),
            MemWidth::B4 => self.mem_insn(false, false, &[0x89], RDX),
            MemWidth::B8 => self.mem_insn(false, true, &[0x89], RDX),
        }
    }

    fn emit_branch(&mut self, cond: Cond, a: RegId, b: RegImm, target: Label) {
        self.guest_load64(RAX, a);
        self.operand(OpWidth::W64, RDX, b);
        self.alu_rr(true, 0x39, RAX, RDX);
        self.jcc(cc_for(cond), target);
    }

    fn emit_jump(&mut self, target: Label) {
        self.jmp(target);
    }

    fn emit_jump_dynamic(&mut self, base: RegId, offset: u32) {
        self.guest_load32(RAX, base);
        if offset != 0 {
            self.add_eax_imm(offset);
        }
        self.jmp(self.dispatch);
    }

    fn emit_load_imm_jump_ind(&mut self, ra: RegId, rb: RegId, value: u64, offset: u32) {
        // The target uses the pre-assignment value of rb; eax holds it across
        // the register write, so ra == rb decodes correctly.
        self.guest_load32(RAX, rb);
        if offset != 0 {
            self.add_eax_imm(offset);
        }
        self.load_const(RDX, value);
        self.guest_store64(ra, RDX);
        self.jmp(self.dispatch);
    }

    fn emit_exit(&mut self, exit: VmExit) {
        self.exit_code(exit.code());
        self.jmp(self.epilogue);
    }

    fn finalize(mut self, jump_table: &[(u32, Label)]) -> Result<CodeArtifact, EmitError> {
        for (label, code) in [
            (self.trap, EXIT_TRAP),
            (self.out_of_gas, EXIT_OUT_OF_GAS),
            (self.mem_fault, EXIT_MEMORY_FAULT),
            (self.div_zero, EXIT_DIVISION_BY_ZERO),
        ] {
            self.labels.bind(label, self.code.offset());
            self.exit_code(code);
            self.jmp(self.epilogue);
        }

        // Dynamic dispatch: guest target PC arrives in eax. A direct-index
        // table of host offsets is baked at the buffer tail; entry 0 marks an
        // invalid target (the prologue guarantees no block sits at offset 0).
        self.labels.bind(self.dispatch, self.code.offset());
        self.cmp_eax_imm(self.guest_len);
        self.jcc(CC_AE, self.trap);
        self.lea_rip(RDX, self.table);
        // mov edx, [rdx + rax*4]
        self.code.u8(0x8B);
        self.code.u8(modrm(0, RDX, 4));
        self.code.u8(0x82); // scale 4, index rax, base rdx
        self.test_rr(false, RDX, RDX);
        self.jcc(CC_E, self.trap);
        self.lea_rip(RCX, self.base);
        self.alu_rr(true, 0x01, RCX, RDX);
        // jmp rcx
        self.code.u8(0xFF);
        self.code.u8(modrm(3, 4, RCX));

        self.labels.bind(self.epilogue, self.code.offset());
        for r in [R15, R14, R13, R12, RBX, RBP] {
            self.pop(r);
        }
        self.code.u8(0xC3);

        while self.code.offset() % 4 != 0 {
            self.code.u8(0xCC);
        }
        self.labels.bind(self.table, self.code.offset());
        let mut entries = vec![0u32; self.guest_len as usize];
        for (pc, label) in jump_table {
            let offset = self
                .labels
                .offset(*label)
                .ok_or(EmitError::UnresolvedLabel(*label))?;
            entries[*pc as usize] = offset;
        }
        for entry in entries {
            self.code.u32(entry);
        }

        self.labels.resolve(&mut self.code)?;
        Ok(CodeArtifact {
            code: self.code.into_bytes(),
            entry_offset: 0,
        })
    }
}
