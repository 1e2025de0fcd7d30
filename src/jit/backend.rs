//! Process-wide native backend initialisation.

use std::sync::OnceLock;

use thiserror::Error;
use tracing::debug;

use super::memory::page_size;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("native code generation is not supported on {0}")]
    UnsupportedArchitecture(&'static str),
}

/// Facts about the host the translator depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    pub arch: &'static str,
    pub page_size: usize,
}

static BACKEND: OnceLock<Result<Backend, BackendError>> = OnceLock::new();

/// Probe the host once; every later call returns the cached result.
pub fn initialize() -> Result<&'static Backend, BackendError> {
    BACKEND
        .get_or_init(|| {
            let arch = std::env::consts::ARCH;
            if !cfg!(all(target_arch = "x86_64", unix)) {
                return Err(BackendError::UnsupportedArchitecture(arch));
            }
            let backend = Backend {
                arch,
                page_size: page_size(),
            };
            debug!(arch, page_size = backend.page_size, "native backend initialised");
            Ok(backend)
        })
        .as_ref()
        .map_err(Clone::clone)
}
