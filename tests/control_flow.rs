//! Branches, calls, returns and jump tables in translated code.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{IN_TEXT, Program, XorShift, engine, run};
use pip2::isa::{BranchForm, encode_inline};
use pip2::{Opcode, Register, VmOptions};
use Register::*;

#[test]
fn test_counting_loop() {
    let mut program = Program::new();
    program.ldq(R0, 0);
    let top = program.here();
    program
        .op(Opcode::Add, R0, R0, P0)
        .imm8(Opcode::Addq, P0, P0, 0xFF)
        .branch_imm(Opcode::Bnei, P0, 0, top)
        .ret();
    let mut engine = engine(&program, 64, Vec::new(), VmOptions::default());
    engine.set_reg(P0, 10).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(R0), 55);
    assert_eq!(engine.reg(P0), 0);
}

/// `B<cond> ...; R0 = 0; return; taken: R0 = 1; return`
fn branch_program(op: Opcode, form: BranchForm, imm: u8) -> Program {
    let mut program = Program::new();
    let taken = op.size() + 8;
    match form {
        BranchForm::Registers => program.branch(op, P1, P2, taken),
        _ => program.branch_imm(op, P1, imm, taken),
    };
    program.ldq(R0, 0).ret().ldq(R0, 1).ret();
    program
}

#[test]
fn test_every_branch_condition() {
    let mut rng = XorShift::new(7);
    for &op in Opcode::ALL {
        let Some((form, cond)) = op.branch() else {
            continue;
        };
        let imm = (rng.next_u32() & 0xFF) as u8;
        let mut engine = engine(&branch_program(op, form, imm), 64, Vec::new(), VmOptions::default());

        let mut values = vec![0, 1, u32::MAX, 0x7F, 0x80, 0xFF, 0x8000_0000, imm as u32];
        values.extend((0..16).map(|_| rng.next_u32()));
        for a in values {
            let b = rng.next_u32();
            let expected = match form {
                BranchForm::Registers => cond.holds(a, b),
                BranchForm::Immediate => cond.holds(a, imm as i8 as i32 as u32),
                BranchForm::ByteImmediate if cond.is_unsigned() => cond.holds(a & 0xFF, imm as u32),
                BranchForm::ByteImmediate => cond.holds(a as u8 as i8 as i32 as u32, imm as i8 as i32 as u32),
            };
            engine.set_reg(P1, a).unwrap();
            engine.set_reg(P2, b).unwrap();
            run(&mut engine);
            assert_eq!(engine.reg(R0), expected as u32, "{} {a:#x} {b:#x} imm {imm:#x}", op.mnemonic());
        }
    }
}

#[test]
fn test_direct_call_and_return() {
    let mut program = Program::new();
    // main at 0, callee at 24
    program
        .local(Opcode::Calll, 24)
        .imm8(Opcode::Addq, R0, R0, 1)
        .op(Opcode::Mov, S0, Ra, Zr)
        .ret()
        .pad_to(24)
        .op(Opcode::Add, R0, P0, P1)
        .ret();
    let mut engine = engine(&program, 64, Vec::new(), VmOptions::default());
    assert_eq!(engine.function_count(), 2);
    engine.set_reg(P0, 40).unwrap();
    engine.set_reg(P1, 1).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(R0), 42);
    // RA was the address after the call.
    assert_eq!(engine.reg(S0), 8);
}

#[test]
fn test_backward_jump_is_a_tail_call() {
    let mut program = Program::new();
    program
        .op(Opcode::Add, R0, P0, P1)
        .ret()
        .imm8(Opcode::Addq, P0, P0, 1);
    program.local(Opcode::Jpl, 0);
    let options = VmOptions {
        entry_point: 8,
        ..VmOptions::default()
    };
    let mut engine = engine(&program, 64, Vec::new(), options);
    engine.set_reg(P0, 1).unwrap();
    engine.set_reg(P1, 2).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(R0), 4);
    assert_eq!(engine.reg(Pc), 0);
}

#[test]
fn test_register_call_through_lookup() {
    let mut program = Program::new();
    program
        .dword(Opcode::Ldi, G0, Zr, 1)
        .dest(Opcode::Callr, G0)
        .imm8(Opcode::Addq, R0, R0, 1)
        .ret()
        .pad_to(32)
        .op(Opcode::Add, R0, P0, P0)
        .ret();
    let pool = vec![IN_TEXT | 32];
    let mut engine = engine(&program, 64, pool, VmOptions::default());
    engine.set_reg(P0, 5).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(R0), 11);
    assert_eq!(engine.reg(Ra), 12);
}

#[test]
fn test_register_jump_is_a_tail_call() {
    let mut program = Program::new();
    program
        .dword(Opcode::Ldi, G0, Zr, 1)
        .dest(Opcode::Jpr, G0)
        .pad_to(16)
        .ldq(R0, 9)
        .ret();
    let pool = vec![IN_TEXT | 16];
    let mut engine = engine(&program, 64, pool, VmOptions::default());
    run(&mut engine);
    assert_eq!(engine.reg(R0), 9);
}

#[test]
fn test_call_to_untranslated_address_continues() {
    let mut program = Program::new();
    program
        .ldi(G0, 0x4000)
        .dest(Opcode::Callr, G0)
        .ldi(G0, 4)
        .dest(Opcode::Callr, G0)
        .ldq(R0, 3)
        .ret();
    let mut engine = engine(&program, 64, Vec::new(), VmOptions::default());
    run(&mut engine);
    assert_eq!(engine.reg(R0), 3);
    assert_eq!(engine.reg(Pc), 4);
}

#[test]
fn test_direct_jump_table() {
    let mut program = Program::new();
    program
        .branch_imm(Opcode::Bgtui, P0, 3, 52)
        .imm8(Opcode::Slli, G0, P0, 2)
        .dword(Opcode::Ldwd, G1, G0, encode_inline(64))
        .dest(Opcode::Jpr, G1);
    for case in 0..4 {
        program.ldq(R0, 100 + case).ret();
    }
    program.ldq(R0, 7).ret().pad_to(64);
    for target in [20, 28, 36, 44] {
        program.word(target);
    }
    let mut engine = engine(&program, 128, Vec::new(), VmOptions::default());

    for index in 0..4 {
        engine.set_reg(P0, index).unwrap();
        run(&mut engine);
        assert_eq!(engine.reg(R0), 100 + index);
        assert_eq!(engine.reg(G1), 20 + 8 * index);
    }
    engine.set_reg(P0, 9).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(R0), 7);
}

#[test]
fn test_based_jump_table() {
    let mut program = Program::new();
    program
        .ldi(G2, 64)
        .branch_imm(Opcode::Bleui, P0, 2, 16)
        .ret()
        .imm8(Opcode::Slli, G0, P0, 2)
        .op(Opcode::Add, G0, G0, G2)
        .dword(Opcode::Ldwd, G1, G0, encode_inline(16))
        .dest(Opcode::Jpr, G1);
    for case in 0..3 {
        program.ldq(R0, 200 + case).ret();
    }
    program.pad_to(80);
    for target in [36, 44, 52] {
        program.word(target);
    }
    let mut engine = engine(&program, 128, Vec::new(), VmOptions::default());

    for index in 0..3 {
        engine.set_reg(R0, 0).unwrap();
        engine.set_reg(P0, index).unwrap();
        run(&mut engine);
        assert_eq!(engine.reg(R0), 200 + index);
    }
    engine.set_reg(R0, 0).unwrap();
    engine.set_reg(P0, 3).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(R0), 0);
}

/// `JPl check; body: ...; check: BLTI P0, n -> body`
#[test]
fn test_loop_body_before_its_condition() {
    let mut program = Program::new();
    program
        .ldq(R0, 0)
        .local(Opcode::Jpl, 24)
        .local(Opcode::Calll, 32)
        .imm8(Opcode::Addq, P0, P0, 1)
        .branch_imm(Opcode::Blti, P0, 5, 12)
        .ret()
        .imm8(Opcode::Addq, R0, R0, 3)
        .ret();
    let mut engine = engine(&program, 64, Vec::new(), VmOptions::default());
    assert_eq!(engine.function_count(), 2);

    run(&mut engine);
    assert_eq!(engine.reg(P0), 5);
    assert_eq!(engine.reg(R0), 15);

    engine.set_reg(P0, 7).unwrap();
    run(&mut engine);
    assert_eq!(engine.reg(P0), 7);
    assert_eq!(engine.reg(R0), 0);
}

#[test]
fn test_jump_table_inside_bottom_tested_loop() {
    let mut program = Program::new();
    program
        .ldq(R0, 0)
        .local(Opcode::Jpl, 60)
        .branch_imm(Opcode::Bgtui, P0, 1, 56)
        .imm8(Opcode::Slli, G0, P0, 2)
        .dword(Opcode::Ldwd, G1, G0, encode_inline(72))
        .dest(Opcode::Jpr, G1)
        .imm8(Opcode::Addq, R0, R0, 1)
        .local(Opcode::Jpl, 56)
        .imm8(Opcode::Addq, R0, R0, 10)
        .local(Opcode::Jpl, 56)
        .imm8(Opcode::Addq, P0, P0, 1)
        .branch_imm(Opcode::Blti, P0, 3, 12)
        .ret()
        .pad_to(72)
        .word(32)
        .word(44);
    let mut engine = engine(&program, 128, Vec::new(), VmOptions::default());
    assert_eq!(engine.function_count(), 1);

    run(&mut engine);
    assert_eq!(engine.reg(P0), 3);
    assert_eq!(engine.reg(R0), 11);
}
