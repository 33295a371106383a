//! Process-wide logging setup.

/// Subscriber construction and installation (filters, formatting).
pub mod logging;

pub use logging::{LogConfig, LogFormat};

/// Initialize logging with the `info` default.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    init_with("info");
}

/// Initialize logging; `default_directive` applies when `RUST_LOG` is unset.
pub fn init_with(default_directive: &str) {
    logging::install(&LogConfig::from_env(default_directive));
}
