//! Runtime mode enum.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable consulted by [`RuntimeMode::from_env`].
pub const RUNTIME_MODE_ENV: &str = "PHASEFLOW_RUNTIME_MODE";

/// Execution profile that scales timeouts and relaxes success criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Production profile: base timeouts, failure-rate tolerance check.
    #[default]
    #[serde(alias = "production")]
    Strict,
    /// Development profile: doubled timeouts, majority-success tolerance.
    #[serde(alias = "development")]
    Relaxed,
    /// Exploratory profile: quadrupled timeouts, majority-success tolerance.
    Exploratory,
}

impl RuntimeMode {
    /// Returns the timeout multiplier for this mode.
    #[must_use]
    pub const fn timeout_multiplier(self) -> f64 {
        match self {
            Self::Strict => 1.0,
            Self::Relaxed => 2.0,
            Self::Exploratory => 4.0,
        }
    }

    /// Returns true for the strict/production profile.
    #[must_use]
    pub const fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }

    /// Reads the mode from [`RUNTIME_MODE_ENV`], falling back to `fallback`
    /// when the variable is unset or unparsable.
    #[must_use]
    pub fn from_env(fallback: Self) -> Self {
        match std::env::var(RUNTIME_MODE_ENV) {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(value = %raw, error = %err, "Ignoring invalid runtime mode");
                fallback
            }),
            Err(_) => fallback,
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Relaxed => write!(f, "relaxed"),
            Self::Exploratory => write!(f, "exploratory"),
        }
    }
}

impl FromStr for RuntimeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "production" | "prod" => Ok(Self::Strict),
            "relaxed" | "development" | "dev" => Ok(Self::Relaxed),
            "exploratory" | "explore" => Ok(Self::Exploratory),
            other => Err(ConfigError::new(
                "runtime_mode",
                format!("unknown runtime mode '{other}'"),
            )),
        }
    }
}
