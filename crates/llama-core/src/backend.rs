//! Global llama.cpp backend initialization.

use std::ffi::CStr;
use std::sync::Once;
use tracing::info;

use crate::log::{self, LogLevel};

static BACKEND_INIT: Once = Once::new();

/// Token proving the llama.cpp backend has been initialized.
///
/// The first call to [`LlamaBackend::init`] initializes the C backend and
/// routes native logs into `tracing`; subsequent calls are no-ops. The
/// backend lives until process exit.
#[derive(Debug, Clone, Copy)]
pub struct LlamaBackend {
    _private: (),
}

impl LlamaBackend {
    /// Initialize the backend, keeping the current log level.
    pub fn init() -> Self {
        BACKEND_INIT.call_once(|| {
            unsafe {
                llama_sys::llama_backend_init();
            }
            log::install_native_hooks();
            info!("llama.cpp backend initialized");
        });
        Self { _private: () }
    }

    /// Initialize the backend and apply `level` to native diagnostics.
    ///
    /// The level is process-wide; see [`crate::log`].
    pub fn init_with_log_level(level: LogLevel) -> Self {
        let backend = Self::init();
        log::set_log_level(level);
        backend
    }

    /// Human-readable description of the compiled-in CPU/GPU features.
    pub fn system_info(&self) -> String {
        unsafe {
            CStr::from_ptr(llama_sys::llama_print_system_info())
                .to_string_lossy()
                .into_owned()
        }
    }
}
