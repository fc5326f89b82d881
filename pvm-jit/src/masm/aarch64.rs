//! AArch64 backend.
//!
//! Register binding, stable across every emitter:
//!
//! | Host  | Role                        |
//! |-------|-----------------------------|
//! | `x19` | guest register file pointer |
//! | `x20` | guest memory base           |
//! | `x21` | guest memory size           |
//! | `x22` | gas counter pointer         |
//! | `x23` | host context pointer        |
//! | `x24` | code buffer base            |
//! | `x6`, `x7`, `x8` | scratch          |
//!
//! Guest register `i` lives at `[x19 + 8*i]`. `x24` is loaded once in the
//! prologue with the buffer base (`adr`) so the dynamic-dispatch sequence can
//! form absolute entry addresses without relocations. The entry point follows
//! the AAPCS64: `x0` register file, `x1` memory base, `x2` memory size, `x3`
//! gas pointer, `x4` context.

use pvm_asm::RegId;

use super::{
    AluOp, CodeArtifact, CodeBuf, Cond, DivKind, EmitError, FixupKind, Label, Labels,
    MachineEmitter, MemWidth, MulHighKind, OpWidth, RegImm, UnaryOp,
};
use crate::state::{
    VmExit, EXIT_DIVISION_BY_ZERO, EXIT_MEMORY_FAULT, EXIT_OUT_OF_GAS, EXIT_TRAP,
};

const X0: u8 = 0;
const X6: u8 = 6;
const X7: u8 = 7;
const X8: u8 = 8;
const REG_FILE: u8 = 19;
const MEM_BASE: u8 = 20;
const MEM_SIZE: u8 = 21;
const GAS_PTR: u8 = 22;
const CODE_BASE: u8 = 24;
const SP: u8 = 31;
const ZR: u8 = 31;

// Condition codes for b.cond/csel/cset.
const COND_EQ: u8 = 0;
const COND_NE: u8 = 1;
const COND_HS: u8 = 2;
const COND_LO: u8 = 3;
const COND_MI: u8 = 4;
const COND_HI: u8 = 8;
const COND_LS: u8 = 9;
const COND_GE: u8 = 10;
const COND_LT: u8 = 11;
const COND_GT: u8 = 12;
const COND_LE: u8 = 13;

fn cond_for(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => COND_EQ,
        Cond::Ne => COND_NE,
        Cond::LtU => COND_LO,
        Cond::LtS => COND_LT,
        Cond::LeU => COND_LS,
        Cond::LeS => COND_LE,
        Cond::GeU => COND_HS,
        Cond::GeS => COND_GE,
        Cond::GtU => COND_HI,
        Cond::GtS => COND_GT,
    }
}

/// sf selector: 1 = 64-bit operation, shifted into bit 31.
fn sf(width: OpWidth) -> u32 {
    match width {
        OpWidth::W64 => 1 << 31,
        OpWidth::W32 => 0,
    }
}

/// Machine-code emitter for AArch64.
pub struct A64Emitter {
    code: CodeBuf,
    labels: Labels,
    guest_len: u32,
    epilogue: Label,
    trap: Label,
    out_of_gas: Label,
    mem_fault: Label,
    div_zero: Label,
    dispatch: Label,
    table: Label,
}

impl A64Emitter {
    /// Create an emitter for an image of `guest_len` bytecode bytes.
    pub fn new(guest_len: u32) -> Self {
        let mut labels = Labels::default();
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
            epilogue,
            trap,
            out_of_gas,
            mem_fault,
            div_zero,
            dispatch,
            table,
        }
    }

    fn word(&mut self, word: u32) {
        self.code.u32(word);
    }

    fn movz(&mut self, rd: u8, imm16: u32, hw: u32) {
        self.word(0xD280_0000 | hw << 21 | imm16 << 5 | rd as u32);
    }

    fn movk(&mut self, rd: u8, imm16: u32, hw: u32) {
        self.word(0xF280_0000 | hw << 21 | imm16 << 5 | rd as u32);
    }

    /// Materialize a 64-bit constant with movz plus up to three movk.
    fn load_const(&mut self, rd: u8, value: u64) {
        if value == 0 {
            self.movz(rd, 0, 0);
            return;
        }
        let mut first = true;
        for hw in 0..4 {
            let chunk = ((value >> (hw * 16)) & 0xFFFF) as u32;
            if chunk == 0 {
                continue;
            }
            if first {
                self.movz(rd, chunk, hw);
                first = false;
            } else {
                self.movk(rd, chunk, hw);
            }
        }
    }

    /// `mov xd, xm` (orr with the zero register).
    fn mov_reg(&mut self, rd: u8, rm: u8) {
        self.word(0xAA00_03E0 | (rm as u32) << 16 | rd as u32);
    }

    fn guest_load64(&mut self, host: u8, reg: RegId) {
        let imm = reg.slot_offset() / 8;
        self.word(0xF940_0000 | imm << 10 | (REG_FILE as u32) << 5 | host as u32);
    }

    fn guest_load32(&mut self, host: u8, reg: RegId) {
        let imm = reg.slot_offset() / 4;
        self.word(0xB940_0000 | imm << 10 | (REG_FILE as u32) << 5 | host as u32);
    }

    fn guest_store64(&mut self, reg: RegId, host: u8) {
        let imm = reg.slot_offset() / 8;
        self.word(0xF900_0000 | imm << 10 | (REG_FILE as u32) << 5 | host as u32);
    }

    fn operand(&mut self, width: OpWidth, host: u8, value: RegImm) {
        match (value, width) {
            (RegImm::Reg(reg), OpWidth::W64) => self.guest_load64(host, reg),
            (RegImm::Reg(reg), OpWidth::W32) => self.guest_load32(host, reg),
            (RegImm::Imm(imm), OpWidth::W64) => self.load_const(host, imm),
            (RegImm::Imm(imm), OpWidth::W32) => self.load_const(host, imm as u32 as u64),
        }
    }

    /// Shifted-register data op from its 32-bit base opcode.
    fn reg3(&mut self, base: u32, rd: u8, rn: u8, rm: u8) {
        self.word(base | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32);
    }

    fn add_reg(&mut self, width: OpWidth, rd: u8, rn: u8, rm: u8) {
        self.reg3(0x0B00_0000 | sf(width), rd, rn, rm);
    }

    fn sub_reg(&mut self, width: OpWidth, rd: u8, rn: u8, rm: u8) {
        self.reg3(0x4B00_0000 | sf(width), rd, rn, rm);
    }

    /// `cmp rn, rm` (subs into the zero register).
    fn cmp_reg(&mut self, width: OpWidth, rn: u8, rm: u8) {
        self.reg3(0x6B00_0000 | sf(width), ZR, rn, rm);
    }

    fn add_imm(&mut self, width: OpWidth, rd: u8, rn: u8, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.word(0x1100_0000 | sf(width) | imm12 << 10 | (rn as u32) << 5 | rd as u32);
    }

    fn subs_imm(&mut self, width: OpWidth, rd: u8, rn: u8, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.word(0x7100_0000 | sf(width) | imm12 << 10 | (rn as u32) << 5 | rd as u32);
    }

    fn subs_reg(&mut self, width: OpWidth, rd: u8, rn: u8, rm: u8) {
        self.reg3(0x6B00_0000 | sf(width), rd, rn, rm);
    }

    /// `mul rd, rn, rm` (madd with the zero register accumulator).
    fn mul(&mut self, width: OpWidth, rd: u8, rn: u8, rm: u8) {
        self.word(
            0x1B00_0000
                | sf(width)
                | (rm as u32) << 16
                | (ZR as u32) << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    /// `msub rd, rn, rm, ra` = `ra - rn * rm`.
    fn msub(&mut self, width: OpWidth, rd: u8, rn: u8, rm: u8, ra: u8) {
        self.word(
            0x1B00_8000
                | sf(width)
                | (rm as u32) << 16
                | (ra as u32) << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    /// `lsr rd, rn, #shift` (64-bit).
    fn lsr_imm64(&mut self, rd: u8, rn: u8, shift: u32) {
        self.word(0xD340_FC00 | shift << 16 | (rn as u32) << 5 | rd as u32);
    }

    /// `asr rd, rn, #shift` (64-bit).
    fn asr_imm64(&mut self, rd: u8, rn: u8, shift: u32) {
        self.word(0x9340_FC00 | shift << 16 | (rn as u32) << 5 | rd as u32);
    }

    fn csel(&mut self, width: OpWidth, rd: u8, rn: u8, rm: u8, cond: u8) {
        self.word(
            0x1A80_0000
                | sf(width)
                | (rm as u32) << 16
                | (cond as u32) << 12
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    /// `cset rd, cond` (csinc from the zero register with the inverted
    /// condition).
    fn cset(&mut self, rd: u8, cond: u8) {
        self.word(0x9A9F_07E0 | ((cond ^ 1) as u32) << 12 | rd as u32);
    }

    fn b(&mut self, target: Label) {
        self.labels.record(self.code.offset(), target, FixupKind::A64Branch26);
        self.word(0x1400_0000);
    }

    fn b_cond(&mut self, cond: u8, target: Label) {
        self.labels.record(self.code.offset(), target, FixupKind::A64Branch19);
        self.word(0x5400_0000 | cond as u32);
    }

    fn cbz(&mut self, width: OpWidth, rt: u8, target: Label) {
        self.labels.record(self.code.offset(), target, FixupKind::A64Branch19);
        self.word(0x3400_0000 | sf(width) | rt as u32);
    }

    fn br(&mut self, rn: u8) {
        self.word(0xD61F_0000 | (rn as u32) << 5);
    }

    fn ret(&mut self) {
        self.word(0xD65F_03C0);
    }

    /// `adr rd, pc + byte_offset`.
    fn adr(&mut self, rd: u8, byte_offset: i32) {
        let imm = byte_offset as u32;
        let immlo = imm & 0x3;
        let immhi = (imm >> 2) & 0x7_FFFF;
        self.word(0x1000_0000 | immlo << 29 | immhi << 5 | rd as u32);
    }

    fn stp(&mut self, rt: u8, rt2: u8, slot_pair_offset: u32) {
        self.word(
            0xA900_0000
                | slot_pair_offset << 15
                | (rt2 as u32) << 10
                | (SP as u32) << 5
                | rt as u32,
        );
    }

    fn ldp(&mut self, rt: u8, rt2: u8, slot_pair_offset: u32) {
        self.word(
            0xA940_0000
                | slot_pair_offset << 15
                | (rt2 as u32) << 10
                | (SP as u32) << 5
                | rt as u32,
        );
    }

    /// Guest memory access `[x20 + x6]` from its register-offset base opcode.
    fn mem_insn(&mut self, base: u32, rt: u8) {
        self.word(base | (X6 as u32) << 16 | (MEM_BASE as u32) << 5 | rt as u32);
    }

    /// Effective address of a guest access into `w6`, wrapping mod 2^32.
    fn effective_address(&mut self, base: Option<RegId>, offset: u32) {
        match base {
            Some(base) => {
                self.guest_load32(X6, base);
                if offset != 0 {
                    if offset < 4096 {
                        self.add_imm(OpWidth::W32, X6, X6, offset);
                    } else {
                        self.load_const(X7, offset as u64);
                        self.add_reg(OpWidth::W32, X6, X6, X7);
                    }
                }
            }
            None => self.load_const(X6, offset as u64),
        }
    }

    /// Compare `x6 + width` against the memory size and escape to the
    /// memory-fault thunk on overflow. Clobbers `x7`.
    fn bounds_check(&mut self, width: MemWidth) {
        self.add_imm(OpWidth::W64, X7, X6, width.bytes());
        self.cmp_reg(OpWidth::W64, X7, MEM_SIZE);
        self.b_cond(COND_HI, self.mem_fault);
    }

    /// Parallel-prefix population count of `x6`; clobbers `x7` and `x8`.
    fn popcount(&mut self) {
        self.lsr_imm64(X7, X6, 1);
        self.load_const(X8, 0x5555_5555_5555_5555);
        self.reg3(0x8A00_0000, X7, X7, X8);
        self.sub_reg(OpWidth::W64, X6, X6, X7);
        self.load_const(X8, 0x3333_3333_3333_3333);
        self.reg3(0x8A00_0000, X7, X6, X8);
        self.lsr_imm64(X6, X6, 2);
        self.reg3(0x8A00_0000, X6, X6, X8);
        self.add_reg(OpWidth::W64, X6, X6, X7);
        self.lsr_imm64(X7, X6, 4);
        self.add_reg(OpWidth::W64, X6, X6, X7);
        self.load_const(X8, 0x0F0F_0F0F_0F0F_0F0F);
        self.reg3(0x8A00_0000, X6, X6, X8);
        self.load_const(X8, 0x0101_0101_0101_0101);
        self.mul(OpWidth::W64, X6, X6, X8);
        self.lsr_imm64(X6, X6, 56);
    }
}

impl MachineEmitter for A64Emitter {
    fn new_label(&mut self) -> Label {
        self.labels.alloc()
    }

    fn bind_label(&mut self, label: Label) {
        self.labels.bind(label, self.code.offset());
    }

    fn emit_prologue(&mut self) {
        self.word(0xD100_C3FF); // sub sp, sp, #48
        self.stp(19, 20, 0);
        self.stp(21, 22, 2);
        self.stp(23, 24, 4);
        // The prologue sits at offset 0, so pc of this instruction is its
        // own buffer offset; x24 becomes the buffer base.
        let at = self.code.offset() as i32;
        self.adr(CODE_BASE, -at);
        self.mov_reg(REG_FILE, 0);
        self.mov_reg(MEM_BASE, 1);
        self.mov_reg(MEM_SIZE, 2);
        self.mov_reg(GAS_PTR, 3);
        self.mov_reg(23, 4);
    }

    fn emit_gas_check(&mut self, cost: u32) {
        // ldr x6, [x22]
        self.word(0xF940_0000 | (GAS_PTR as u32) << 5 | X6 as u32);
        if cost < 4096 {
            self.subs_imm(OpWidth::W64, X6, X6, cost);
        } else {
            self.load_const(X7, cost as u64);
            self.subs_reg(OpWidth::W64, X6, X6, X7);
        }
        // str x6, [x22]
        self.word(0xF900_0000 | (GAS_PTR as u32) << 5 | X6 as u32);
        self.b_cond(COND_MI, self.out_of_gas);
    }

    fn emit_load_imm(&mut self, dst: RegId, value: u64) {
        self.load_const(X6, value);
        self.guest_store64(dst, X6);
    }

    fn emit_move(&mut self, dst: RegId, src: RegId) {
        self.guest_load64(X6, src);
        self.guest_store64(dst, X6);
    }

    fn emit_alu(&mut self, width: OpWidth, op: AluOp, dst: RegId, lhs: RegImm, rhs: RegImm) {
        self.operand(width, X6, lhs);
        self.operand(width, X7, rhs);
        match op {
            AluOp::Add => self.add_reg(width, X6, X6, X7),
            AluOp::Sub => self.sub_reg(width, X6, X6, X7),
            AluOp::Mul => self.mul(width, X6, X6, X7),
            AluOp::And => self.reg3(0x0A00_0000 | sf(width), X6, X6, X7),
            AluOp::Or => self.reg3(0x2A00_0000 | sf(width), X6, X6, X7),
            AluOp::Xor => self.reg3(0x4A00_0000 | sf(width), X6, X6, X7),
            AluOp::AndInv => self.reg3(0x0A20_0000 | sf(width), X6, X6, X7),
            AluOp::OrInv => self.reg3(0x2A20_0000 | sf(width), X6, X6, X7),
            AluOp::Xnor => self.reg3(0x4A20_0000 | sf(width), X6, X6, X7),
            AluOp::ShiftLeft => self.reg3(0x1AC0_2000 | sf(width), X6, X6, X7),
            AluOp::ShiftRightLogical => self.reg3(0x1AC0_2400 | sf(width), X6, X6, X7),
            AluOp::ShiftRightArith => self.reg3(0x1AC0_2800 | sf(width), X6, X6, X7),
            AluOp::RotateLeft => {
                // ror by the negated count; rorv masks to the width.
                self.sub_reg(width, X7, ZR, X7);
                self.reg3(0x1AC0_2C00 | sf(width), X6, X6, X7);
            }
            AluOp::RotateRight => self.reg3(0x1AC0_2C00 | sf(width), X6, X6, X7),
        }
        self.guest_store64(dst, X6);
    }

    fn emit_div_rem(
        &mut self,
        width: OpWidth,
        kind: DivKind,
        dst: RegId,
        dividend: RegId,
        divisor: RegImm,
    ) {
        self.operand(width, X7, divisor);
        match width {
            OpWidth::W64 => self.guest_load64(X6, dividend),
            OpWidth::W32 => self.guest_load32(X6, dividend),
        }
        self.cbz(width, X7, self.div_zero);
        // sdiv already yields MIN for MIN / -1, and msub then yields 0 for
        // the remainder, so no overflow special case is needed here.
        match kind {
            DivKind::DivU => self.reg3(0x1AC0_0800 | sf(width), X6, X6, X7),
            DivKind::DivS => self.reg3(0x1AC0_0C00 | sf(width), X6, X6, X7),
            DivKind::RemU => {
                self.reg3(0x1AC0_0800 | sf(width), X8, X6, X7);
                self.msub(width, X6, X8, X7, X6);
            }
            DivKind::RemS => {
                self.reg3(0x1AC0_0C00 | sf(width), X8, X6, X7);
                self.msub(width, X6, X8, X7, X6);
            }
        }
        self.guest_store64(dst, X6);
    }

    fn emit_mul_high(&mut self, kind: MulHighKind, dst: RegId, a: RegId, b: RegId) {
        self.guest_load64(X6, a);
        self.guest_load64(X7, b);
        match kind {
            MulHighKind::UnsignedUnsigned => self.reg3(0x9BC0_7C00, X6, X6, X7),
            MulHighKind::SignedSigned => self.reg3(0x9B40_7C00, X6, X6, X7),
            MulHighKind::SignedUnsigned => {
                // high = umulh(a, b) - (a < 0 ? b : 0)
                self.reg3(0x9BC0_7C00, X8, X6, X7);
                self.asr_imm64(X6, X6, 63);
                self.reg3(0x8A00_0000, X6, X6, X7);
                self.sub_reg(OpWidth::W64, X6, X8, X6);
            }
        }
        self.guest_store64(dst, X6);
    }

    fn emit_unary(&mut self, op: UnaryOp, dst: RegId, src: RegId) {
        match op {
            UnaryOp::CountSetBits64 => {
                self.guest_load64(X6, src);
                self.popcount();
            }
            UnaryOp::CountSetBits32 => {
                self.guest_load32(X6, src);
                self.popcount();
            }
            UnaryOp::LeadingZeros64 => {
                self.guest_load64(X6, src);
                self.word(0xDAC0_1000 | (X6 as u32) << 5 | X6 as u32);
            }
            UnaryOp::LeadingZeros32 => {
                self.guest_load32(X6, src);
                self.word(0x5AC0_1000 | (X6 as u32) << 5 | X6 as u32);
            }
            UnaryOp::TrailingZeros64 => {
                self.guest_load64(X6, src);
                self.word(0xDAC0_0000 | (X6 as u32) << 5 | X6 as u32); // rbit
                self.word(0xDAC0_1000 | (X6 as u32) << 5 | X6 as u32); // clz
            }
            UnaryOp::TrailingZeros32 => {
                self.guest_load32(X6, src);
                self.word(0x5AC0_0000 | (X6 as u32) << 5 | X6 as u32);
                self.word(0x5AC0_1000 | (X6 as u32) << 5 | X6 as u32);
            }
            UnaryOp::SignExtend8 => {
                self.guest_load64(X6, src);
                self.word(0x9340_1C00 | (X6 as u32) << 5 | X6 as u32); // sxtb
            }
            UnaryOp::SignExtend16 => {
                self.guest_load64(X6, src);
                self.word(0x9340_3C00 | (X6 as u32) << 5 | X6 as u32); // sxth
            }
            UnaryOp::ZeroExtend16 => {
                self.guest_load32(X6, src);
                self.word(0x5300_3C00 | (X6 as u32) << 5 | X6 as u32); // uxth
            }
            UnaryOp::ReverseBytes => {
                self.guest_load64(X6, src);
                self.word(0xDAC0_0C00 | (X6 as u32) << 5 | X6 as u32); // rev
            }
        }
        self.guest_store64(dst, X6);
    }

    fn emit_set_cmp(&mut self, cond: Cond, dst: RegId, a: RegId, b: RegImm) {
        self.guest_load64(X6, a);
        self.operand(OpWidth::W64, X7, b);
        self.cmp_reg(OpWidth::W64, X6, X7);
        self.cset(X6, cond_for(cond));
        self.guest_store64(dst, X6);
    }

    fn emit_cmov(&mut self, when_zero: bool, dst: RegId, src: RegImm, cond: RegId) {
        self.guest_load64(X6, cond);
        self.operand(OpWidth::W64, X7, src);
        self.guest_load64(X8, dst);
        self.subs_imm(OpWidth::W64, ZR, X6, 0);
        let cc = if when_zero { COND_EQ } else { COND_NE };
        self.csel(OpWidth::W64, X8, X7, X8, cc);
        self.guest_store64(dst, X8);
    }

    fn emit_minmax(&mut self, signed: bool, is_max: bool, dst: RegId, a: RegId, b: RegId) {
        self.guest_load64(X6, a);
        self.guest_load64(X7, b);
        self.cmp_reg(OpWidth::W64, X6, X7);
        let keep_a = match (signed, is_max) {
            (true, true) => COND_GT,
            (false, true) => COND_HI,
            (true, false) => COND_LT,
            (false, false) => COND_LO,
        };
        self.csel(OpWidth::W64, X6, X6, X7, keep_a);
        self.guest_store64(dst, X6);
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
        let base_op = match (width, signed) {
            (MemWidth::B1, false) => 0x3860_6800,
            (MemWidth::B1, true) => 0x38A0_6800,
            (MemWidth::B2, false) => 0x7860_6800,
            (MemWidth::B2, true) => 0x78A0_6800,
            (MemWidth::B4, false) => 0xB860_6800,
            (MemWidth::B4, true) => 0xB8A0_6800,
            (MemWidth::B8, _) => 0xF860_6800,
        };
        self.mem_insn(base_op, X7);
        self.guest_store64(dst, X7);
    }

    fn emit_store(&mut self, width: MemWidth, value: RegImm, base: Option<RegId>, offset: u32) {
        self.effective_address(base, offset);
        self.bounds_check(width);
        match value {
            RegImm::Reg(reg) => self.guest_load64(X7, reg),
            RegImm::Imm(imm) => self.load_const(X7, imm),
        }
        let base_op = match width {
            MemWidth::B1 => 0x3820_6800,
            MemWidth::B2 => 0x7820_6800,
            MemWidth::B4 => 0xB820_6800,
            MemWidth::B8 => 0xF820_6800,
        };
        self.mem_insn(base_op, X7);
    }

    fn emit_branch(&mut self, cond: Cond, a: RegId, b: RegImm, target: Label) {
        self.guest_load64(X6, a);
        self.operand(OpWidth::W64, X7, b);
        self.cmp_reg(OpWidth::W64, X6, X7);
        self.b_cond(cond_for(cond), target);
    }

    fn emit_jump(&mut self, target: Label) {
        self.b(target);
    }

    fn emit_jump_dynamic(&mut self, base: RegId, offset: u32) {
        self.emit_jump_dynamic_target_only(base, offset);
        self.b(self.dispatch);
    }

    fn emit_load_imm_jump_ind(&mut self, ra: RegId, rb: RegId, value: u64, offset: u32) {
        // The target uses the pre-assignment value of rb; w6 holds it across
        // the register write, so ra == rb decodes correctly.
        self.emit_jump_dynamic_target_only(rb, offset);
        self.load_const(X7, value);
        self.guest_store64(ra, X7);
        self.b(self.dispatch);
    }

    fn emit_exit(&mut self, exit: VmExit) {
        self.load_const(X0, exit.code() as u64);
        self.b(self.epilogue);
    }

    fn finalize(mut self, jump_table: &[(u32, Label)]) -> Result<CodeArtifact, EmitError> {
        for (label, code) in [
            (self.trap, EXIT_TRAP),
            (self.out_of_gas, EXIT_OUT_OF_GAS),
            (self.mem_fault, EXIT_MEMORY_FAULT),
            (self.div_zero, EXIT_DIVISION_BY_ZERO),
        ] {
            self.labels.bind(label, self.code.offset());
            self.load_const(X0, code as u64);
            self.b(self.epilogue);
        }

        // Dynamic dispatch: guest target PC arrives in w6. A direct-index
        // table of host offsets is baked at the buffer tail; entry 0 marks an
        // invalid target (the prologue guarantees no block sits at offset 0).
        self.labels.bind(self.dispatch, self.code.offset());
        self.load_const(X7, self.guest_len as u64);
        self.cmp_reg(OpWidth::W64, X6, X7);
        self.b_cond(COND_HS, self.trap);
        // movz/movk pair patched with the absolute table offset.
        self.labels
            .record(self.code.offset(), self.table, FixupKind::A64AbsMovPair);
        self.movz(X7, 0, 0);
        self.movk(X7, 0, 1);
        self.add_reg(OpWidth::W64, X7, CODE_BASE, X7);
        // ldr w8, [x7, x6, lsl #2]
        self.word(0xB860_7800 | (X6 as u32) << 16 | (X7 as u32) << 5 | X8 as u32);
        self.cbz(OpWidth::W32, X8, self.trap);
        self.add_reg(OpWidth::W64, X7, CODE_BASE, X8);
        self.br(X7);

        self.labels.bind(self.epilogue, self.code.offset());
        self.ldp(23, 24, 4);
        self.ldp(21, 22, 2);
        self.ldp(19, 20, 0);
        self.word(0x9100_C3FF); // add sp, sp, #48
        self.ret();

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

impl A64Emitter {
    /// Target computation shared by `emit_jump_dynamic` and
    /// `emit_load_imm_jump_ind`, leaving the guest target PC in `w6`.
    fn emit_jump_dynamic_target_only(&mut self, base: RegId, offset: u32) {
        self.guest_load32(X6, base);
        if offset != 0 {
            if offset < 4096 {
                self.add_imm(OpWidth::W32, X6, X6, offset);
            } else {
                self.load_const(X7, offset as u64);
                self.add_reg(OpWidth::W32, X6, X6, X7);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(emitter: A64Emitter) -> Vec<u32> {
        emitter
            .finalize(&[])
            .unwrap()
            .code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn prologue_saves_pairs_and_takes_the_base() {
        let mut emitter = A64Emitter::new(0);
        emitter.emit_prologue();
        let words = words(emitter);
        assert_eq!(words[0], 0xD100_C3FF); // sub sp, sp, #48
        assert_eq!(words[1], 0xA900_53F3); // stp x19, x20, [sp]
        assert_eq!(words[2], 0xA901_5BF5); // stp x21, x22, [sp, #16]
        assert_eq!(words[3], 0xA902_63F7); // stp x23, x24, [sp, #32]
        // adr x24, #-16
        assert_eq!(words[4], 0x1000_0000 | (0x7FFFC << 5) | 24);
        assert_eq!(words[5], 0xAA00_03F3); // mov x19, x0
    }

    #[test]
    fn guest_slots_are_scaled_loads() {
        let mut emitter = A64Emitter::new(0);
        emitter.emit_move(RegId::new(2), RegId::new(1));
        let words = words(emitter);
        assert_eq!(words[0], 0xF940_0666); // ldr x6, [x19, #8]
        assert_eq!(words[1], 0xF900_0A66); // str x6, [x19, #16]
    }

    #[test]
    fn load_imm_uses_movz_movk() {
        let mut emitter = A64Emitter::new(0);
        emitter.emit_load_imm(RegId::new(0), 0x0001_0000_0000_0005);
        let words = words(emitter);
        assert_eq!(words[0], 0xD280_0000 | 5 << 5 | 6); // movz x6, #5
        assert_eq!(words[1], 0xF280_0000 | 3 << 21 | 1 << 5 | 6); // movk x6, #1, lsl #48
        assert_eq!(words[2], 0xF900_0266); // str x6, [x19]
    }

    #[test]
    fn thirty_two_bit_add_uses_w_registers() {
        let mut emitter = A64Emitter::new(0);
        emitter.emit_alu(
            OpWidth::W32,
            AluOp::Add,
            RegId::new(0),
            RegImm::Reg(RegId::new(1)),
            RegImm::Reg(RegId::new(2)),
        );
        let words = words(emitter);
        assert_eq!(words[0], 0xB940_0A66); // ldr w6, [x19, #8]
        assert_eq!(words[1], 0xB940_1267); // ldr w7, [x19, #16]
        assert_eq!(words[2], 0x0B07_00C6); // add w6, w6, w7
        assert_eq!(words[3], 0xF900_0266); // str x6, [x19]
    }

    #[test]
    fn branch_cond_words_get_patched() {
        let mut emitter = A64Emitter::new(0);
        let target = emitter.new_label();
        emitter.bind_label(target);
        emitter.emit_branch(
            Cond::LtU,
            RegId::new(0),
            RegImm::Reg(RegId::new(1)),
            target,
        );
        let words = words(emitter);
        // ldr, ldr, cmp, then b.lo back over four instructions.
        assert_eq!(words[2], 0xEB07_00DF); // cmp x6, x7
        let imm19 = ((-3i32 as u32) & 0x7FFFF) << 5;
        assert_eq!(words[3], 0x5400_0000 | imm19 | COND_LO as u32);
    }
}
