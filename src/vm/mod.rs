//! Runtime: register file, task scheduler, VM services and the engine.

pub mod context;
pub mod engine;
pub mod scheduler;
pub mod services;

pub use context::VmContext;
pub use engine::{Engine, EngineError, log_hle_call};
pub use scheduler::{Scheduler, TaskError, TaskId};
pub use services::Service;
