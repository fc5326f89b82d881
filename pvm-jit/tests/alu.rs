//! Arithmetic, logic and comparison semantics of compiled programs.

use pvm_asm::VM_REGISTER_COUNT;
use pvm_jit::util::ImageBuilder;
use pvm_jit::{compile, Target, VmExit};

struct Run {
    exit: VmExit,
    regs: [u64; VM_REGISTER_COUNT],
}

fn run(image: &ImageBuilder) -> Option<Run> {
    let target = Target::host()?;
    let (code, mask) = image.build();
    let program = compile(&code, &mask, 0, target).expect("program compiles");
    let mut regs = [0u64; VM_REGISTER_COUNT];
    let mut gas = 1_000i64;
    let exit = program
        .run(&mut regs, &mut [], &mut gas)
        .expect("target matches host");
    Some(Run { exit, regs })
}

// Three-register opcodes used below.
const SUB32: u8 = 191;
const MUL32: u8 = 192;
const DIVS32: u8 = 194;
const REMU32: u8 = 195;
const ADD64: u8 = 200;
const DIVS64: u8 = 204;
const REMS64: u8 = 206;
const SHLOL32: u8 = 197;
const SHARR32: u8 = 199;
const SHLOL64: u8 = 207;
const AND: u8 = 210;
const XOR: u8 = 211;
const MULUPPERSS: u8 = 213;
const MULUPPERUU: u8 = 214;
const MULUPPERSU: u8 = 215;
const SETLTU: u8 = 216;
const SETLTS: u8 = 217;
const CMOVIZ: u8 = 218;
const CMOVNZ: u8 = 219;
const ROTL32: u8 = 221;
const ROTR64: u8 = 222;
const ANDINV: u8 = 224;
const XNOR: u8 = 226;
const MAX: u8 = 227;
const MINU: u8 = 230;

#[test]
fn add32_adds() {
    let mut image = ImageBuilder::new();
    image.load_imm(1, 5).load_imm(2, 7).add_32(0, 1, 2).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.regs[0], 12);
}

#[test]
fn add32_wraps_to_zero() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0xFFFF_FFFF)
        .load_imm(2, 1)
        .add_32(0, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 0);
}

#[test]
fn thirty_two_bit_results_zero_extend() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, u64::MAX)
        .add_32(0, 1, 2) // r2 is zero
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 0xFFFF_FFFF);
}

#[test]
fn sub_and_mul_32() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 100)
        .load_imm(2, 42)
        .three_reg(SUB32, 0, 1, 2)
        .three_reg(MUL32, 3, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 58);
    assert_eq!(run.regs[3], 4200);
}

#[test]
fn add64_uses_the_full_register() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, 1 << 40)
        .load_imm64(2, 3)
        .three_reg(ADD64, 0, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], (1 << 40) + 3);
}

#[test]
fn division_by_zero_exits_minus_four() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 10)
        .load_imm(2, 0)
        .div_u32(0, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::DivisionByZero);
    assert_eq!(run.regs[0], 0, "destination must stay unwritten");
}

#[test]
fn unsigned_division_and_remainder() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 10)
        .load_imm(2, 3)
        .div_u32(0, 1, 2)
        .three_reg(REMU32, 3, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 3);
    assert_eq!(run.regs[3], 1);
}

#[test]
fn signed_min_over_minus_one_does_not_trap() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, i64::MIN as u64)
        .load_imm64(2, -1i64 as u64)
        .three_reg(DIVS64, 0, 1, 2)
        .three_reg(REMS64, 3, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.regs[0], i64::MIN as u64);
    assert_eq!(run.regs[3], 0);
}

#[test]
fn signed_min32_over_minus_one() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0x8000_0000)
        .load_imm(2, 0xFFFF_FFFF)
        .three_reg(DIVS32, 0, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.regs[0], 0x8000_0000);
}

#[test]
fn shift_counts_are_taken_modulo_width() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 1)
        .load_imm(2, 33)
        .three_reg(SHLOL32, 0, 1, 2) // 1 << (33 % 32)
        .three_reg(SHLOL64, 3, 1, 2) // 1 << 33
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 2);
    assert_eq!(run.regs[3], 1 << 33);
}

#[test]
fn arithmetic_shift_keeps_the_sign() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0x8000_0000)
        .load_imm(2, 31)
        .three_reg(SHARR32, 0, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    // -2^31 >> 31 arithmetically is -1; zero-extended as a 32-bit result.
    assert_eq!(run.regs[0], 0xFFFF_FFFF);
}

#[test]
fn rotates() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 1)
        .load_imm(2, 1)
        .three_reg(ROTR64, 0, 1, 2)
        .three_reg(ROTL32, 3, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 1u64.rotate_right(1));
    assert_eq!(run.regs[3], 2);
}

#[test]
fn bitwise_and_inverted_variants() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, 0xFF00)
        .load_imm64(2, 0x0F0F)
        .three_reg(AND, 0, 1, 2)
        .three_reg(XOR, 3, 1, 2)
        .three_reg(ANDINV, 4, 1, 2)
        .three_reg(XNOR, 5, 1, 2)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 0xF00);
    assert_eq!(run.regs[3], 0xF00F);
    assert_eq!(run.regs[4], 0xF000);
    assert_eq!(run.regs[5], !0xF00Fu64);
}

#[test]
fn mul_upper_halves() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, 1 << 32)
        .load_imm64(2, 1 << 33)
        .three_reg(MULUPPERUU, 0, 1, 2)
        .load_imm64(3, -1i64 as u64)
        .load_imm64(4, 2)
        .three_reg(MULUPPERSS, 5, 3, 4)
        .three_reg(MULUPPERSU, 6, 3, 4)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 2); // (2^32 * 2^33) >> 64
    assert_eq!(run.regs[5], -1i64 as u64); // high half of -2
    assert_eq!(run.regs[6], -1i64 as u64); // signed * unsigned
}

#[test]
fn set_on_compare() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 3)
        .load_imm(2, 5)
        .three_reg(SETLTU, 0, 1, 2)
        .load_imm64(3, -7i64 as u64)
        .three_reg(SETLTS, 4, 3, 1) // -7 < 3 signed
        .three_reg(SETLTU, 5, 3, 1) // huge unsigned, not less
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 1);
    assert_eq!(run.regs[4], 1);
    assert_eq!(run.regs[5], 0);
}

#[test]
fn conditional_moves() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(0, 7)
        .load_imm(1, 42)
        .three_reg(CMOVIZ, 0, 1, 2) // r2 is zero: r0 = r1
        .load_imm(3, 9)
        .three_reg(CMOVNZ, 3, 1, 2) // r2 is zero: r3 unchanged
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 42);
    assert_eq!(run.regs[3], 9);
}

#[test]
fn min_max_signedness() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, -1i64 as u64)
        .load_imm(2, 5)
        .three_reg(MAX, 0, 1, 2) // signed max(-1, 5)
        .three_reg(MINU, 3, 1, 2) // unsigned min(2^64-1, 5)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 5);
    assert_eq!(run.regs[3], 5);
}

#[test]
fn unary_bit_operations() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0xFF)
        .op(&[102, 1, 2]) // countsetbits64 r2, r1
        .op(&[105, 1, 3]) // leadingzerobits32 r3, r1
        .op(&[106, 1, 4]) // trailingzerobits64 r4, r1
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[2], 8);
    assert_eq!(run.regs[3], 24);
    assert_eq!(run.regs[4], 0);
}

#[test]
fn extension_and_byte_reverse() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0x8081)
        .op(&[108, 1, 2]) // signextend8
        .op(&[109, 1, 3]) // signextend16
        .op(&[110, 1, 4]) // zeroextend16
        .load_imm64(5, 0x0102_0304_0506_0708)
        .op(&[111, 5, 6]) // reversebytes
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[2], 0xFFFF_FFFF_FFFF_FF81);
    assert_eq!(run.regs[3], 0xFFFF_FFFF_FFFF_8081);
    assert_eq!(run.regs[4], 0x8081);
    assert_eq!(run.regs[6], 0x0807_0605_0403_0201);
}

#[test]
fn load_imm_sign_extends() {
    let mut image = ImageBuilder::new();
    image.load_imm(1, 0xFFFF_FFFF).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[1], u64::MAX);
}

#[test]
fn immediate_alu_forms() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 10)
        .reg_reg_imm(131, 0, 1, 5) // addimm32: r0 = r1 + 5
        .reg_reg_imm(141, 2, 1, 3) // negaddimm32: r2 = 3 - r1
        .reg_reg_imm(138, 3, 1, 2) // shlolimm32: r3 = r1 << 2
        .reg_reg_imm(144, 4, 1, 2) // shlolimmalt32: r4 = 2 << r1
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 15);
    assert_eq!(run.regs[2], (3u32.wrapping_sub(10)) as u64);
    assert_eq!(run.regs[3], 40);
    assert_eq!(run.regs[4], 2 << 10);
}

#[test]
fn and_imm_is_sign_extended() {
    let mut image = ImageBuilder::new();
    image
        .load_imm64(1, 0x1234_5678_9ABC_DEF0)
        .reg_reg_imm(132, 0, 1, 0xFFFF_FFFF) // andimm with -1
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 0x1234_5678_9ABC_DEF0);
}

#[test]
fn cmov_imm_forms() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(0, 7)
        .reg_reg_imm(147, 0, 2, 42) // cmovizimm: r2 is zero, r0 = 42
        .load_imm(3, 9)
        .reg_reg_imm(148, 3, 2, 42) // cmovnzimm: r2 is zero, r3 unchanged
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[0], 42);
    assert_eq!(run.regs[3], 9);
}
