//! Guest tasks driven through service imports.

#![cfg(target_arch = "x86_64")]

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{IMPORT, IN_TEXT, Program, engine, setup};
use pip2::isa::encode_inline;
use pip2::{Engine, Opcode, Register, Service, ServiceImport, StackCallbacks, VmOptions};
use Register::*;

const CREATE: u32 = 1;
const YIELD: u32 = 2;
const SEND: u32 = 3;
const RECEIVE: u32 = 4;
const THIS: u32 = 5;
const WORKER: u32 = 6;

fn options() -> VmOptions {
    let service_imports = [
        (CREATE, Service::Create),
        (YIELD, Service::Yield),
        (SEND, Service::Send),
        (RECEIVE, Service::Receive),
        (THIS, Service::This),
    ]
    .into_iter()
    .map(|(pool_index, service)| ServiceImport { pool_index, service })
    .collect();
    VmOptions {
        service_imports,
        ..VmOptions::default()
    }
}

fn pool(worker: u32) -> Vec<u64> {
    vec![IMPORT, IMPORT, IMPORT, IMPORT, IMPORT, IN_TEXT | worker as u64]
}

fn run_tasks(engine: &mut Engine) {
    engine
        .execute_task_aware(pip2::log_hle_call, std::ptr::null_mut())
        .unwrap();
}

fn read_u32(engine: &Engine, at: usize) -> u32 {
    u32::from_le_bytes(engine.memory()[at..at + 4].try_into().unwrap())
}

#[test]
fn test_tasks_interleave_in_creation_order() {
    let mut program = Program::new();
    program
        .dword(Opcode::Ldi, P0, Zr, WORKER)
        .call_pool(CREATE)
        .call_pool(CREATE)
        .ret();
    // Appends its task id to the log at 0x204, three times.
    let worker = program.here();
    program.ldq(S0, 3);
    let top = program.here();
    program
        .call_pool(THIS)
        .dword(Opcode::Ldwd, G0, Zr, encode_inline(0x200))
        .imm8(Opcode::Slli, G1, G0, 2)
        .dword(Opcode::Stwd, R0, G1, encode_inline(0x204))
        .imm8(Opcode::Addq, G0, G0, 1)
        .dword(Opcode::Stwd, G0, Zr, encode_inline(0x200))
        .call_pool(YIELD)
        .imm8(Opcode::Addq, S0, S0, 0xFF)
        .branch_imm(Opcode::Bnei, S0, 0, top)
        .ret();

    let mut engine = engine(&program, 1024, pool(worker), options());
    assert!(engine.uses_task_subsystem());
    run_tasks(&mut engine);

    assert_eq!(read_u32(&engine, 0x200), 6);
    let log: Vec<u32> = (0..6).map(|i| read_u32(&engine, 0x204 + 4 * i)).collect();
    assert_eq!(log, vec![2, 3, 2, 3, 2, 3]);
    assert_eq!(engine.scheduler().task_count(), 0);
}

#[test]
fn test_mailbox_round_trip() {
    let mut program = Program::new();
    program
        .dword(Opcode::Ldi, P0, Zr, WORKER)
        .ldq(P1, 77)
        .call_pool(CREATE)
        .call_pool(YIELD)
        .call_pool(RECEIVE)
        .ret();
    // Sends its first argument plus one to task 1.
    let worker = program.here();
    program
        .imm8(Opcode::Addq, P1, P0, 1)
        .ldq(P0, 1)
        .call_pool(SEND)
        .ret();

    let mut engine = engine(&program, 256, pool(worker), options());
    run_tasks(&mut engine);
    assert_eq!(engine.reg(R0), 78);
}

#[test]
fn test_services_outside_tasks_do_not_switch() {
    let mut program = Program::new();
    program.call_pool(YIELD).call_pool(THIS).ret();
    let mut engine = engine(&program, 64, pool(0), options());
    common::run(&mut engine);
    assert_eq!(engine.reg(R0), u32::MAX);
}

static FREED: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" fn create_stack(_: *mut c_void, _size: i64) -> u32 {
    0x300
}

unsafe extern "C" fn free_stack(_: *mut c_void, stack: u32) {
    FREED.store(stack, Ordering::SeqCst);
}

#[test]
fn test_created_tasks_get_host_stacks() {
    let mut program = Program::new();
    program
        .dword(Opcode::Ldi, P0, Zr, WORKER)
        .call_pool(CREATE)
        .ret();
    let worker = program.here();
    program
        .dword(Opcode::Stwd, Sp, Zr, encode_inline(0x200))
        .ret();

    let (mut config, options) = setup(&program, 1024, pool(worker), options());
    config.stack = StackCallbacks {
        create: Some(create_stack),
        free: Some(free_stack),
    };
    let mut engine = Engine::new("stacks", config, options).unwrap();
    run_tasks(&mut engine);
    assert_eq!(read_u32(&engine, 0x200), 0x300);
    assert_eq!(FREED.load(Ordering::SeqCst), 0x300);
}
