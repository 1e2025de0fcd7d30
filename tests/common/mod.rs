//! Shared helpers for the integration tests: a small guest assembler, engine
//! setup and a seeded generator.

#![allow(dead_code)]

use std::ffi::c_void;

use pip2::isa::encode_inline;
use pip2::{Engine, MemoryConfig, Opcode, Register, VmContext, VmOptions};

/// Pool item tag of host imports.
pub const IMPORT: u64 = 1 << 63;
/// Pool item tag of imports that never return.
pub const TERMINATE: u64 = (1 << 63) | (1 << 32);
/// Pool item tag of constants that point into the text.
pub const IN_TEXT: u64 = 1 << 62;

/// Guest assembler writing little-endian words.
#[derive(Default)]
pub struct Program {
    bytes: Vec<u8>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn word(&mut self, word: u32) -> &mut Self {
        self.bytes.extend_from_slice(&word.to_le_bytes());
        self
    }

    /// `op rd, rs, rt` with raw bytes for rs and rt.
    pub fn raw(&mut self, op: Opcode, rd: Register, rs: u8, rt: u8) -> &mut Self {
        self.word(op as u32 | (rd.id() as u32) << 8 | (rs as u32) << 16 | (rt as u32) << 24)
    }

    pub fn op(&mut self, op: Opcode, rd: Register, rs: Register, rt: Register) -> &mut Self {
        self.raw(op, rd, rs.id(), rt.id())
    }

    /// `op rd, rs, imm8`
    pub fn imm8(&mut self, op: Opcode, rd: Register, rs: Register, imm: u8) -> &mut Self {
        self.raw(op, rd, rs.id(), imm)
    }

    /// `op rd, rs, <inline dword>`
    pub fn imm(&mut self, op: Opcode, rd: Register, rs: Register, value: i32) -> &mut Self {
        self.raw(op, rd, rs.id(), 0);
        self.word(encode_inline(value))
    }

    /// `op rd, rs, <dword>` with a raw dword (pool index or inline).
    pub fn dword(&mut self, op: Opcode, rd: Register, rs: Register, dword: u32) -> &mut Self {
        self.raw(op, rd, rs.id(), 0);
        self.word(dword)
    }

    pub fn dest(&mut self, op: Opcode, rd: Register) -> &mut Self {
        self.raw(op, rd, 0, 0)
    }

    pub fn ldi(&mut self, rd: Register, value: i32) -> &mut Self {
        self.dest(Opcode::Ldi, rd);
        self.word(encode_inline(value))
    }

    pub fn ldq(&mut self, rd: Register, value: i16) -> &mut Self {
        self.word(Opcode::Ldq as u32 | (rd.id() as u32) << 8 | (value as u16 as u32) << 16)
    }

    /// `STORE`/`RESTORE rs, count`
    pub fn range(&mut self, op: Opcode, rs: Register, count: u8) -> &mut Self {
        self.word(op as u32 | (rs.id() as u32) << 8 | (count as u32) << 16)
    }

    /// Register-form branch to an absolute target.
    pub fn branch(&mut self, op: Opcode, rd: Register, rs: Register, target: u32) -> &mut Self {
        let offset = target.wrapping_sub(self.here()) as i32;
        self.raw(op, rd, rs.id(), 0);
        self.word(encode_inline(offset))
    }

    /// Compare-immediate branch to an absolute target.
    pub fn branch_imm(&mut self, op: Opcode, rd: Register, imm: u8, target: u32) -> &mut Self {
        let words = (target.wrapping_sub(self.here()) as i32) / 4;
        self.raw(op, rd, imm, words as i8 as u8)
    }

    /// `JPl`/`CALLl` with a relative inline target.
    pub fn local(&mut self, op: Opcode, target: u32) -> &mut Self {
        let offset = target.wrapping_sub(self.here()) as i32;
        self.dest(op, Register::Zr);
        self.word(encode_inline(offset))
    }

    /// `CALLl` through a pool index.
    pub fn call_pool(&mut self, index: u32) -> &mut Self {
        self.dest(Opcode::Calll, Register::Zr);
        self.word(index)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.dest(Opcode::Jpr, Register::Ra)
    }

    pub fn pad_to(&mut self, addr: u32) -> &mut Self {
        while self.here() < addr {
            self.dest(Opcode::Nop, Register::Zr);
        }
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// Guest memory with the program at 0 and `size` bytes in total. The text
/// covers only the program.
pub fn setup(program: &Program, size: usize, pool: Vec<u64>, options: VmOptions) -> (MemoryConfig, VmOptions) {
    let mut memory = program.finish();
    let text_size = memory.len() as u32;
    memory.resize(size.max(memory.len()), 0);
    let options = VmOptions {
        text_size: options.text_size.or(Some(text_size)),
        ..options
    };
    let config = MemoryConfig {
        memory,
        pool_items: pool,
        ..MemoryConfig::default()
    };
    (config, options)
}

pub fn engine(program: &Program, size: usize, pool: Vec<u64>, options: VmOptions) -> Engine {
    let (config, options) = setup(program, size, pool, options);
    Engine::new("test", config, options).unwrap()
}

pub fn run(engine: &mut Engine) {
    engine.execute(pip2::log_hle_call, std::ptr::null_mut()).unwrap();
}

/// What an HLE handler saw: code, RA and PC at the time of the call.
pub struct HleLog {
    pub context: *mut VmContext,
    pub calls: Vec<(i32, u32, u32)>,
}

pub unsafe extern "C" fn record_hle(userdata: *mut c_void, code: i32) {
    let log = unsafe { &mut *(userdata as *mut HleLog) };
    let ctx = unsafe { &*log.context };
    log.calls.push((code, ctx.get(Register::Ra), ctx.get(Register::Pc)));
}

/// Seeded xorshift generator for property checks.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 16) as u32
    }
}
