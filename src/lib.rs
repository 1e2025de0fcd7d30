//! pip2 - a native translator and runtime for Pip2 guest programs.
//!
//! Guest code is recovered into functions, translated to x86-64 and run
//! against a register file in host memory. Cooperative guest tasks run on
//! their own host stacks.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod isa;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{DivideByZeroPolicy, MemoryConfig, ServiceImport, StackCallbacks, VmOptions};
pub use isa::{Opcode, PoolItems, Register};
pub use jit::HleHandler;
pub use vm::{Engine, EngineError, Service, VmContext, log_hle_call};
