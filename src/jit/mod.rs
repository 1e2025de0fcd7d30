//! Native code generation for x86-64.
//!
//! - Executable memory allocation
//! - Code buffer with labels and relocations
//! - x86-64 instruction encoding
//! - The guest-to-native translator
//! - The lookup table and service trampolines used by generated code

pub mod backend;
pub mod codebuf;
pub mod lookup;
pub mod memory;
pub mod services;
pub mod translator;
pub mod x86_64;

pub use backend::{Backend, BackendError};
pub use lookup::LookupTable;
pub use memory::{ExecutableMemory, MemoryError};
pub use services::ServiceTrampolines;
pub use translator::{CompiledModule, HleHandler, Routine, TranslateError, TranslateOptions, Translator};
