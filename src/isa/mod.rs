//! Guest instruction set: registers, opcodes, instruction views and the
//! constant pool.

pub mod instruction;
pub mod opcode;
pub mod pool;
pub mod register;

pub use instruction::{DecodeError, Encoding, Instruction, read_word};
pub use opcode::{BranchForm, Condition, Format, Opcode};
pub use pool::{PoolItemKind, PoolItems, decode_inline, encode_inline};
pub use register::{REGISTER_COUNT, Register};
