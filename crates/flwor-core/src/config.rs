//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the FLWOR rewrite rules after compilation. When false, clauses are
    /// only compiled (constant folding, error recovery) and kept in source order.
    pub optimize: bool,

    /// Upper bound on fixed-point rounds per FLWOR expression. Exceeding it is
    /// reported as an invariant failure instead of looping forever.
    pub max_optimizer_rounds: usize,

    /// Keep a log of every applied rewrite in the prepared plan.
    pub collect_diagnostics: bool,

    /// Optional wall-clock budget for one execution, checked between items.
    pub timeout_ms: Option<u64>,

    /// Optional cap on produced items; the stream is interrupted beyond it.
    pub item_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            max_optimizer_rounds: 64,
            collect_diagnostics: false,
            timeout_ms: None,
            item_limit: None,
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `FLWOR_OPTIMIZE`: `true`/`false`
    /// - `FLWOR_MAX_OPTIMIZER_ROUNDS`: fixed-point round cap
    /// - `FLWOR_DIAGNOSTICS`: `true`/`false`
    /// - `FLWOR_TIMEOUT_MS`: execution deadline in milliseconds
    /// - `FLWOR_ITEM_LIMIT`: maximum number of produced items
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("FLWOR_OPTIMIZE") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.optimize = v;
            }
        }

        if let Ok(s) = std::env::var("FLWOR_MAX_OPTIMIZER_ROUNDS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_optimizer_rounds = v;
            }
        }

        if let Ok(s) = std::env::var("FLWOR_DIAGNOSTICS") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.collect_diagnostics = v;
            }
        }

        if let Ok(s) = std::env::var("FLWOR_TIMEOUT_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.timeout_ms = Some(v);
            }
        }

        if let Ok(s) = std::env::var("FLWOR_ITEM_LIMIT") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.item_limit = Some(v);
            }
        }

        cfg
    }

    /// Reject settings the optimizer cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.optimize && self.max_optimizer_rounds == 0 {
            return Err(crate::error::Error::Config(
                "max_optimizer_rounds must be at least 1 when optimizing".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_optimize_with_bounded_rounds() {
        let cfg = EngineConfig::default();
        assert!(cfg.optimize);
        assert_eq!(cfg.max_optimizer_rounds, 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_rounds_is_rejected() {
        let cfg = EngineConfig {
            max_optimizer_rounds: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"item_limit": 3}"#).unwrap();
        assert_eq!(cfg.item_limit, Some(3));
        assert!(cfg.optimize);
    }
}
