//! Global subscriber installation.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter directive when `RUST_LOG` is unset or invalid.
const DEFAULT_DIRECTIVE: &str = "info";

/// Installs a global subscriber with a compact or JSON formatter.
///
/// The filter comes from `RUST_LOG`, falling back to `info`. Returns false
/// if a global subscriber was already installed; the existing one is kept.
pub fn init_tracing(json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected_without_panicking() {
        let first = init_tracing(false);
        assert!(!init_tracing(true));
        // another test in the binary may have installed one first
        let _ = first;
    }
}
