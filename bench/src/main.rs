use pip2::isa::encode_inline;
use pip2::{Engine, MemoryConfig, Opcode, Register, VmOptions};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    translate_secs: f64,
    cached_load_secs: f64,
    execute_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

struct Asm(Vec<u8>);

impl Asm {
    fn word(&mut self, word: u32) -> &mut Self {
        self.0.extend_from_slice(&word.to_le_bytes());
        self
    }

    fn op(&mut self, op: Opcode, rd: Register, rs: u8, rt: u8) -> &mut Self {
        self.word(op as u32 | (rd.id() as u32) << 8 | (rs as u32) << 16 | (rt as u32) << 24)
    }

    fn ldq(&mut self, rd: Register, value: i16) -> &mut Self {
        self.word(Opcode::Ldq as u32 | (rd.id() as u32) << 8 | (value as u16 as u32) << 16)
    }

    /// `BNEI rd, 0` back to `target`
    fn loop_to(&mut self, rd: Register, target: u32) -> &mut Self {
        let words = (target as i32 - self.0.len() as i32) / 4;
        self.op(Opcode::Bnei, rd, 0, words as i8 as u8)
    }
}

// Guest programs

/// R0 = sum of 1..=P0
fn guest_sum_loop() -> Vec<u8> {
    use Register::*;
    let mut asm = Asm(Vec::new());
    asm.ldq(R0, 0)
        .op(Opcode::Add, R0, R0.id(), P0.id())
        .op(Opcode::Addq, P0, P0.id(), 0xFF)
        .loop_to(P0, 4)
        .op(Opcode::Jpr, Ra, 0, 0);
    asm.0
}

/// R0 = sum of i * j for i, j in 1..=500
fn guest_nested_loop() -> Vec<u8> {
    use Register::*;
    let mut asm = Asm(Vec::new());
    asm.ldq(R0, 0)
        .ldq(G0, 500)
        .ldq(G1, 500)
        .op(Opcode::Mul, G2, G0.id(), G1.id())
        .op(Opcode::Add, R0, R0.id(), G2.id())
        .op(Opcode::Addq, G1, G1.id(), 0xFF)
        .loop_to(G1, 12)
        .op(Opcode::Addq, G0, G0.id(), 0xFF)
        .loop_to(G0, 8)
        .op(Opcode::Jpr, Ra, 0, 0);
    asm.0
}

/// R0 = P0 words at 0x1000 summed through a loaded pointer
fn guest_memory_sum() -> Vec<u8> {
    use Register::*;
    let mut asm = Asm(Vec::new());
    asm.ldq(R0, 0).ldq(G0, 0x1000);
    asm.op(Opcode::Ldwd, G1, G0.id(), 0).word(encode_inline(0));
    asm.op(Opcode::Add, R0, R0.id(), G1.id())
        .op(Opcode::Addq, G0, G0.id(), 4)
        .op(Opcode::Addq, P0, P0.id(), 0xFF)
        .loop_to(P0, 8)
        .op(Opcode::Jpr, Ra, 0, 0);
    asm.0
}

// Rust reference implementations

fn rust_sum_loop(n: u32) -> u32 {
    let mut sum = 0u32;
    for i in 1..=n {
        sum = sum.wrapping_add(i);
    }
    sum
}

fn rust_nested_loop() -> u32 {
    let mut sum = 0u32;
    for i in 1..=500u32 {
        for j in 1..=500u32 {
            sum = sum.wrapping_add(i * j);
        }
    }
    sum
}

fn rust_memory_sum(words: &[u32]) -> u32 {
    words.iter().fold(0u32, |sum, word| sum.wrapping_add(*word))
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce() -> u32,
{
    let start = Instant::now();
    eprintln!("{}", f());
    start.elapsed().as_secs_f64()
}

fn build(name: &str, text: &[u8], memory_size: usize, cache_dir: &Path) -> (Engine, f64) {
    let mut memory = text.to_vec();
    memory.resize(memory_size, 0);
    let config = MemoryConfig {
        memory,
        ..MemoryConfig::default()
    };
    let options = VmOptions {
        cache: true,
        cache_dir: Some(cache_dir.to_path_buf()),
        text_size: Some(text.len() as u32),
        ..VmOptions::default()
    };
    let start = Instant::now();
    let engine = Engine::new(name, config, options).unwrap();
    (engine, start.elapsed().as_secs_f64())
}

fn run_pip2_benchmark(
    name: &str,
    text: &[u8],
    memory_size: usize,
    setup: impl Fn(&mut Engine),
) -> (f64, f64, f64) {
    let cache_dir = std::env::temp_dir().join(format!("pip2_bench_{}", std::process::id()));
    let (_, translate) = build(name, text, memory_size, &cache_dir);
    let (mut engine, cached_load) = build(name, text, memory_size, &cache_dir);
    if !engine.loaded_from_cache() {
        eprintln!("pip2 benchmark {name}: cached module was not reused");
    }

    setup(&mut engine);
    let start = Instant::now();
    if let Err(e) = engine.execute(pip2::log_hle_call, std::ptr::null_mut()) {
        eprintln!("pip2 benchmark {name} failed: {e}");
    }
    let execute = start.elapsed().as_secs_f64();
    eprintln!("{}", engine.reg(Register::R0));

    std::fs::remove_dir_all(&cache_dir).ok();
    (translate, cached_load, execute)
}

fn main() {
    let mut results = Vec::new();

    // sum_loop benchmark
    let n = 10_000_000;
    let rust_time = time_rust(|| rust_sum_loop(n));
    let (translate, cached_load, execute) =
        run_pip2_benchmark("sum_loop", &guest_sum_loop(), 4096, |engine| {
            engine.set_reg(Register::P0, n).unwrap();
        });
    results.push(BenchmarkResult {
        name: "sum_loop".to_string(),
        translate_secs: translate,
        cached_load_secs: cached_load,
        execute_secs: execute,
        rust_time_secs: rust_time,
    });

    // nested_loop benchmark
    let rust_time = time_rust(rust_nested_loop);
    let (translate, cached_load, execute) =
        run_pip2_benchmark("nested_loop", &guest_nested_loop(), 4096, |_| {});
    results.push(BenchmarkResult {
        name: "nested_loop".to_string(),
        translate_secs: translate,
        cached_load_secs: cached_load,
        execute_secs: execute,
        rust_time_secs: rust_time,
    });

    // memory_sum benchmark
    let words: Vec<u32> = (0..16_384u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();
    let rust_time = time_rust(|| rust_memory_sum(&words));
    let (translate, cached_load, execute) =
        run_pip2_benchmark("memory_sum", &guest_memory_sum(), 0x1000 + 4 * words.len(), |engine| {
            for (i, word) in words.iter().enumerate() {
                let at = 0x1000 + 4 * i;
                engine.memory_mut()[at..at + 4].copy_from_slice(&word.to_le_bytes());
            }
            engine.set_reg(Register::P0, words.len() as u32).unwrap();
        });
    results.push(BenchmarkResult {
        name: "memory_sum".to_string(),
        translate_secs: translate,
        cached_load_secs: cached_load,
        execute_secs: execute,
        rust_time_secs: rust_time,
    });

    let output = BenchmarkOutput { results };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
