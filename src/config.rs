//! Engine configuration types.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vm::services::Service;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid options: {0}")]
    Parse(#[from] toml::de::Error),
}

/// What a guest division by zero does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivideByZeroPolicy {
    /// The quotient register is set to 0
    #[default]
    ZeroResult,
    /// The host raises a divide-error exception
    Trap,
}

/// A constant-pool entry that `CALLl` uses to reach a VM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceImport {
    pub pool_index: u32,
    pub service: Service,
}

/// Options for building an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    pub divide_by_zero: DivideByZeroPolicy,
    /// Load and store translated code in the object cache
    pub cache: bool,
    /// Cache directory (None = `<temp>/pip2-cache`)
    pub cache_dir: Option<PathBuf>,
    /// Guest address of the first text byte
    pub text_base: u32,
    /// Text length in bytes (None = the rest of memory)
    pub text_size: Option<u32>,
    /// Entry point offset from `text_base`
    pub entry_point: u32,
    pub service_imports: Vec<ServiceImport>,
    /// Host stack size for each task coroutine
    pub task_stack_size: usize,
}

pub const DEFAULT_TASK_STACK_SIZE: usize = 256 * 1024;

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            divide_by_zero: DivideByZeroPolicy::ZeroResult,
            cache: false,
            cache_dir: None,
            text_base: 0,
            text_size: None,
            entry_point: 0,
            service_imports: Vec::new(),
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
        }
    }
}

impl VmOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pip2-cache"))
    }

    /// Service bound to a pool index, if any.
    pub fn service_for(&self, pool_index: u32) -> Option<Service> {
        self.service_imports
            .iter()
            .find(|import| import.pool_index == pool_index)
            .map(|import| import.service)
    }
}

/// Allocates a guest stack of the given size (negative = host default) and
/// returns its top address.
pub type StackCreateFn = unsafe extern "C" fn(userdata: *mut c_void, size: i64) -> u32;

/// Releases a guest stack by its top address.
pub type StackFreeFn = unsafe extern "C" fn(userdata: *mut c_void, stack: u32);

/// Host hooks for guest task stacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackCallbacks {
    pub create: Option<StackCreateFn>,
    pub free: Option<StackFreeFn>,
}

/// Guest memory and the tables that come with the image.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Whole guest address space; the text segment lives inside it.
    pub memory: Vec<u8>,
    /// Raw 64-bit constant-pool items, index 1 first.
    pub pool_items: Vec<u64>,
    pub stack: StackCallbacks,
}
