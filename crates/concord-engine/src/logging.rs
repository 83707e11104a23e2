//! Tracing setup for hosts embedding the engine.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the host's decision.  [`init_tracing`] is the stock setup.

use tracing_subscriber::EnvFilter;

/// Install a compact `fmt` subscriber filtered by `RUST_LOG`, falling back
/// to `default_level` when the variable is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_level: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

/// Emit a lifecycle event at `info` when the policy asks for logging, or at
/// `debug` otherwise.
macro_rules! lifecycle {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

pub(crate) use lifecycle;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let _ = init_tracing("debug");
        assert!(!init_tracing("debug"));
    }
}
