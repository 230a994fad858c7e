//! Process-wide verbosity switch for llama.cpp and ggml diagnostics.
//!
//! llama.cpp keeps its log callback in global state, so the level chosen
//! here is shared by every model and context in the process.  Writers are
//! serialised by a mutex; the native callback only ever reads the level.
//! Native messages that pass the filter are re-emitted through `tracing`
//! under the `llama.cpp` target.

use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LlamaError, Result};

/// llguidance reports grammar completion through the error channel.
const LLG_CHATTER_PREFIX: &str = "llg error:";

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::All as u8);
static LAST_SEVERITY: AtomicU32 = AtomicU32::new(Severity::Info as u32);
static WRITER: Mutex<()> = Mutex::new(());

/// How much native diagnostic output is let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Silent = 0,
    ErrorsOnly = 1,
    #[default]
    All = 2,
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Silent,
            1 => Self::ErrorsOnly,
            _ => Self::All,
        }
    }
}

impl TryFrom<i32> for LogLevel {
    type Error = LlamaError;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Self::Silent),
            1 => Ok(Self::ErrorsOnly),
            2 => Ok(Self::All),
            _ => Err(LlamaError::InvalidArgument(format!(
                "log level must be 0 (silent), 1 (errors) or 2 (all), got {v}"
            ))),
        }
    }
}

impl FromStr for LogLevel {
    type Err = LlamaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" | "0" => Ok(Self::Silent),
            "errors" | "errors-only" | "error" | "1" => Ok(Self::ErrorsOnly),
            "all" | "2" => Ok(Self::All),
            other => Err(LlamaError::InvalidArgument(format!(
                "unknown log level '{other}' (expected silent, errors or all)"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silent => write!(f, "silent"),
            Self::ErrorsOnly => write!(f, "errors"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Severity attached to a native log line (`enum ggml_log_level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    None = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    /// Continuation of the previous line.
    Cont = 5,
}

impl Severity {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            4 => Self::Error,
            5 => Self::Cont,
            _ => Self::None,
        }
    }
}

/// Filter applied to every native message.
///
/// `severity` must already be resolved, i.e. never [`Severity::Cont`].
pub fn should_forward(level: LogLevel, severity: Severity, text: &str) -> bool {
    match level {
        LogLevel::Silent => false,
        LogLevel::ErrorsOnly => {
            severity == Severity::Error && !text.starts_with(LLG_CHATTER_PREFIX)
        }
        LogLevel::All => true,
    }
}

/// Current process-wide level.
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Acquire))
}

/// Set the process-wide level and re-install every native log hook under
/// one lock, so llama.cpp, ggml and (with `llguidance`) the `common` log
/// always agree.
pub fn set_log_level(level: LogLevel) {
    let _writer = WRITER.lock().unwrap_or_else(PoisonError::into_inner);
    LEVEL.store(level as u8, Ordering::Release);
    install_native_hooks();

    #[cfg(feature = "llguidance")]
    unsafe {
        if level == LogLevel::Silent {
            llama_sys::llama_shim_common_log_pause();
        } else {
            llama_sys::llama_shim_common_log_resume();
        }
    }

    debug!(%level, "native log level set");
}

/// Shorthand for [`LogLevel::Silent`] / [`LogLevel::All`].
pub fn set_quiet(quiet: bool) {
    set_log_level(if quiet { LogLevel::Silent } else { LogLevel::All });
}

pub(crate) fn install_native_hooks() {
    unsafe {
        llama_sys::llama_log_set(Some(forward_native_log), std::ptr::null_mut());
        llama_sys::ggml_log_set(Some(forward_native_log), std::ptr::null_mut());
    }
}

unsafe extern "C" fn forward_native_log(
    level: llama_sys::ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }

    let mut severity = Severity::from_raw(level as u32);
    if severity == Severity::Cont {
        severity = Severity::from_raw(LAST_SEVERITY.load(Ordering::Relaxed));
    } else {
        LAST_SEVERITY.store(severity as u32, Ordering::Relaxed);
    }

    let msg = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    if !should_forward(log_level(), severity, &msg) {
        return;
    }
    let msg = msg.trim();
    if msg.is_empty() {
        return;
    }

    match severity {
        Severity::Error => tracing::error!(target: "llama.cpp", "{msg}"),
        Severity::Warn => tracing::warn!(target: "llama.cpp", "{msg}"),
        Severity::Info => tracing::info!(target: "llama.cpp", "{msg}"),
        _ => tracing::debug!(target: "llama.cpp", "{msg}"),
    }
}
