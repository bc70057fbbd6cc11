//! Logger setup plus conditional logging macros that check a module-level
//! `ENABLE_LOGS` flag.
//!
//! Usage:
//! ```rust,ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macros (they're exported at the crate root):
//! use crate::{log_info, log_warn, log_error};
//!
//! log_info!("cycle moved={} device={}", moved, device_id);
//! ```
//!
//! Lines carry `key=value` pairs so external monitoring can pick fields out
//! without a structured backend.

/// Initialize `env_logger`. `RUST_LOG` wins; otherwise Info, or Debug when
/// `CAPKEEP_DEBUG` is set to `1`/`true`.
pub fn init() {
    let debug_mode = std::env::var("CAPKEEP_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let default_level = if debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    // try_init so tests and repeated setup don't panic
    let _ = builder.try_init();
}

/// Shared body of the gated macros below. The `ENABLE_LOGS` const is looked
/// up in the module that invokes the public macro.
#[doc(hidden)]
#[macro_export]
macro_rules! __log_if_enabled {
    ($level:ident, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::$level!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::__log_if_enabled!(debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::__log_if_enabled!(info, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::__log_if_enabled!(warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::__log_if_enabled!(error, $($arg)*) };
}
