//! Backend configuration.
//!
//! Mirrors the teacher's layered `DecompilerConfig`/`ConfigLoader` shape:
//! a `Default`-able struct, a TOML file format, and environment-variable
//! overrides for the knobs that matter when iterating locally.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for a single backend run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub emitter: EmitterConfig,
    pub dispatch_table: DispatchTableConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            emitter: EmitterConfig::default(),
            dispatch_table: DispatchTableConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        let config: BackendConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load defaults, then apply any `BC_BACKEND_*` environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("BC_BACKEND_PEEPHOLE") {
            if let Ok(enabled) = value.parse() {
                config.emitter.enable_peephole = enabled;
            }
        }
        if let Ok(value) = std::env::var("BC_BACKEND_VERBOSE") {
            if let Ok(verbose) = value.parse() {
                config.diagnostics.verbose_packing = verbose;
            }
        }
        config
    }
}

/// Toggles for the emitter's assembly behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    /// Enable the peephole fusion rules in §4.2. Disabling is useful when
    /// diffing raw bytecode against a reference encoding.
    pub enable_peephole: bool,
    /// Prefer the narrow encoding whenever the operand fits, as specified.
    /// Kept as a knob so tests can force the wide form to exercise it.
    pub prefer_narrow: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            enable_peephole: true,
            prefer_narrow: true,
        }
    }
}

/// Toggles for the dispatch-table row-displacement packer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTableConfig {
    /// Initial table capacity hint, avoids repeated growth for typical programs.
    pub initial_capacity: usize,
}

impl Default for DispatchTableConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 256,
        }
    }
}

/// Toggles for ambient logging, not semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Emit a `tracing::debug!` per row placement decision. Noisy; off by default.
    pub verbose_packing: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            verbose_packing: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_peephole_enabled() {
        let config = BackendConfig::default();
        assert!(config.emitter.enable_peephole);
        assert!(!config.diagnostics.verbose_packing);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = BackendConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: BackendConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(
            config.dispatch_table.initial_capacity,
            deserialized.dispatch_table.initial_capacity
        );
    }
}
