//! Log macros that stay quiet unless the calling module opts in.
//!
//! A module turns its output on or off with a local flag:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("connected to {id}");
//! ```
//! The macros are exported at the crate root and forward to the `log` facade.

/// `log::info!` gated on the caller's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// `log::warn!` gated on the caller's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// `log::error!` gated on the caller's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Installs the `env_logger` backend, reading `RUST_LOG` and defaulting to
/// `info`. Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_ok() {
        log::info!("bandsync {} logging initialised", env!("CARGO_PKG_VERSION"));
    }
}
