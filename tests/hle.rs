//! Host calls from guest code.

#![cfg(target_arch = "x86_64")]

mod common;

use std::ffi::c_void;

use common::{HleLog, IMPORT, Program, TERMINATE, engine, record_hle};
use pip2::{Opcode, Register, VmOptions};
use Register::*;

fn program() -> Program {
    let mut program = Program::new();
    program
        .call_pool(1)
        .imm8(Opcode::Addq, R0, R0, 1)
        .call_pool(1)
        .call_pool(2)
        .ldq(R0, 99)
        .ret();
    program
}

#[test]
fn test_handler_sees_flushed_return_state() {
    let mut engine = engine(&program(), 64, vec![IMPORT | 5, TERMINATE], VmOptions::default());
    let mut log = HleLog {
        context: engine.context_ptr(),
        calls: Vec::new(),
    };
    engine
        .execute(record_hle, &mut log as *mut HleLog as *mut c_void)
        .unwrap();

    assert_eq!(log.calls, vec![(1, 8, 8), (1, 20, 20), (2, 28, 28)]);
    // The terminating import returns straight to the host.
    assert_eq!(engine.reg(R0), 1);
    assert!(!engine.uses_task_subsystem());
}

#[test]
fn test_handler_can_change_registers() {
    unsafe extern "C" fn double_p0(userdata: *mut c_void, _code: i32) {
        let context = unsafe { &mut *(userdata as *mut pip2::VmContext) };
        context.set(P0, context.get(P0) * 2);
    }

    let mut program = Program::new();
    program.call_pool(1).op(Opcode::Mov, R0, P0, Zr).ret();
    let mut engine = engine(&program, 64, vec![IMPORT], VmOptions::default());
    engine.set_reg(P0, 21).unwrap();
    let context = engine.context_ptr() as *mut c_void;
    engine.execute(double_p0, context).unwrap();
    assert_eq!(engine.reg(R0), 42);
}
