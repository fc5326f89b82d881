//! Guest memory semantics: bounds checks, access widths, extension rules
//! and address wrapping.

use pvm_asm::VM_REGISTER_COUNT;
use pvm_jit::util::ImageBuilder;
use pvm_jit::{compile, Target, VmExit};
use rstest::rstest;

const MEM_SIZE: usize = 0x10000;

struct Run {
    exit: VmExit,
    regs: [u64; VM_REGISTER_COUNT],
    memory: Vec<u8>,
}

fn run(image: &ImageBuilder) -> Option<Run> {
    let target = Target::host()?;
    let (code, mask) = image.build();
    let program = compile(&code, &mask, 0, target).expect("program compiles");
    let mut regs = [0u64; VM_REGISTER_COUNT];
    let mut memory = vec![0u8; MEM_SIZE];
    let mut gas = 1_000i64;
    let exit = program
        .run(&mut regs, &mut memory, &mut gas)
        .expect("target matches host");
    Some(Run { exit, regs, memory })
}

#[test]
fn store_then_load_round_trips() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0xDEAD_BEEF)
        .store_u32(1, 0x100)
        .load_u32(2, 0x100)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.regs[2], 0xDEAD_BEEF);
    assert_eq!(&run.memory[0x100..0x104], &0xDEAD_BEEFu32.to_le_bytes());
}

#[test]
fn out_of_bounds_store_faults_without_writing() {
    let mut image = ImageBuilder::new();
    image
        .load_imm(1, 0x4141_4141)
        .store_u32(1, MEM_SIZE as u32)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::MemoryFault);
    assert!(run.memory.iter().all(|byte| *byte == 0), "memory unchanged");
}

#[test]
fn access_crossing_the_end_faults() {
    // The last byte is in range but the access extends past it.
    let mut image = ImageBuilder::new();
    image.load_imm(1, 7).store_u32(1, MEM_SIZE as u32 - 3).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::MemoryFault);
}

#[test]
fn store_at_the_last_valid_slot_succeeds() {
    let mut image = ImageBuilder::new();
    image.load_imm(1, 7).store_u32(1, MEM_SIZE as u32 - 4).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(&run.memory[MEM_SIZE - 4..], &7u32.to_le_bytes());
}

#[test]
fn huge_address_cannot_wrap_the_bounds_check() {
    let mut image = ImageBuilder::new();
    image.load_imm(1, 7).store_u32(1, 0xFFFF_FFFF).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::MemoryFault);
}

#[rstest]
#[case::u8(59, 1)]
#[case::u16(60, 2)]
#[case::u32(61, 4)]
#[case::u64(62, 8)]
fn store_widths_write_exactly_their_bytes(#[case] opcode: u8, #[case] width: usize) {
    let mut image = ImageBuilder::new();
    let mut store = vec![opcode, 1];
    store.extend_from_slice(&0x80u32.to_le_bytes());
    image.load_imm64(1, u64::MAX).op(&store).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert!(run.memory[0x80..0x80 + width].iter().all(|byte| *byte == 0xFF));
    assert_eq!(run.memory[0x80 + width], 0);
    assert_eq!(run.memory[0x7F], 0);
}

#[test]
fn signed_loads_sign_extend() {
    let mut image = ImageBuilder::new();
    // StoreImmU8: one byte of 0x80 at address 0x40.
    let mut store = vec![30, 0x80];
    store.extend_from_slice(&0x40u32.to_le_bytes());
    let mut load_i8 = vec![53, 1];
    load_i8.extend_from_slice(&0x40u32.to_le_bytes());
    let mut load_u8 = vec![52, 2];
    load_u8.extend_from_slice(&0x40u32.to_le_bytes());
    image.op(&store).op(&load_i8).op(&load_u8).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[1], 0xFFFF_FFFF_FFFF_FF80);
    assert_eq!(run.regs[2], 0x80);
}

#[test]
fn store_imm_direct_writes_the_value() {
    let mut image = ImageBuilder::new();
    image.store_imm_u32(0x40, 0xCAFE_BABE).load_u32(1, 0x40).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.regs[1], 0xCAFE_BABE);
}

#[test]
fn indirect_store_and_load_use_base_plus_offset() {
    let mut image = ImageBuilder::new();
    let mut store_ind = vec![122, 2, 1]; // storeindu32: value r2, base r1
    store_ind.extend_from_slice(&4u32.to_le_bytes());
    let mut load_ind = vec![128, 3, 1]; // loadindu32: dst r3, base r1
    load_ind.extend_from_slice(&4u32.to_le_bytes());
    image
        .load_imm(1, 0x200)
        .load_imm(2, 0x1234_5678)
        .op(&store_ind)
        .op(&load_ind)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.regs[3], 0x1234_5678);
    assert_eq!(&run.memory[0x204..0x208], &0x1234_5678u32.to_le_bytes());
}

#[test]
fn effective_addresses_wrap_mod_2_pow_32() {
    // base 0xFFFFFFFF + offset 1 wraps to address 0.
    let mut image = ImageBuilder::new();
    let mut store_ind = vec![120, 2, 1]; // storeindu8
    store_ind.extend_from_slice(&1u32.to_le_bytes());
    image
        .load_imm(1, 0xFFFF_FFFF)
        .load_imm(2, 0xAB)
        .op(&store_ind)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.exit, VmExit::Halt);
    assert_eq!(run.memory[0], 0xAB);
}

#[test]
fn store_imm_indirect() {
    let mut image = ImageBuilder::new();
    let mut store = vec![72, 1]; // storeimmindu32: base r1
    store.extend_from_slice(&8u32.to_le_bytes()); // offset
    store.extend_from_slice(&0x0BAD_F00Du32.to_le_bytes()); // value
    image.load_imm(1, 0x300).op(&store).load_u32(2, 0x308).halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[2], 0x0BAD_F00D);
}

#[test]
fn load_u64_reads_the_full_word() {
    let mut image = ImageBuilder::new();
    let mut store = vec![62, 1]; // storeu64
    store.extend_from_slice(&0x400u32.to_le_bytes());
    let mut load = vec![58, 2]; // loadu64
    load.extend_from_slice(&0x400u32.to_le_bytes());
    image
        .load_imm64(1, 0x0102_0304_0506_0708)
        .op(&store)
        .op(&load)
        .halt();
    let Some(run) = run(&image) else { return };
    assert_eq!(run.regs[2], 0x0102_0304_0506_0708);
}
