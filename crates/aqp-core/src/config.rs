//! Planner/executor configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqpConfig {
    /// Schema that receives every scratch table a plan creates.
    pub scratch_schema: String,

    /// Upper bound on nodes executing at once.
    pub max_parallel_nodes: usize,

    /// Run the compression pass after building.
    pub compress: bool,

    /// Convert top aggregate blocks to progressive nodes when possible.
    pub progressive: bool,

    /// Drop scratch tables once the run finishes (success or failure).
    pub cleanup_scratch: bool,
}

impl Default for AqpConfig {
    fn default() -> Self {
        Self {
            scratch_schema: "aqp_temp".to_string(),
            max_parallel_nodes: 4,
            compress: true,
            progressive: true,
            cleanup_scratch: true,
        }
    }
}

impl AqpConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `AQP_SCRATCH_SCHEMA`: scratch schema name
    /// - `AQP_MAX_PARALLEL_NODES`: max concurrently executing nodes
    /// - `AQP_COMPRESS`: `true`/`false`
    /// - `AQP_PROGRESSIVE`: `true`/`false`
    /// - `AQP_CLEANUP_SCRATCH`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("AQP_SCRATCH_SCHEMA") {
            if !s.trim().is_empty() {
                cfg.scratch_schema = s.trim().to_string();
            }
        }

        if let Ok(s) = std::env::var("AQP_MAX_PARALLEL_NODES") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_parallel_nodes = v;
            }
        }

        if let Ok(s) = std::env::var("AQP_COMPRESS") {
            if let Some(v) = parse_flag(&s) {
                cfg.compress = v;
            }
        }

        if let Ok(s) = std::env::var("AQP_PROGRESSIVE") {
            if let Some(v) = parse_flag(&s) {
                cfg.progressive = v;
            }
        }

        if let Ok(s) = std::env::var("AQP_CLEANUP_SCRATCH") {
            if let Some(v) = parse_flag(&s) {
                cfg.cleanup_scratch = v;
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.scratch_schema.is_empty() {
            return Err(Error::Config("scratch_schema must not be empty".into()));
        }
        if self.max_parallel_nodes == 0 {
            return Err(Error::Config("max_parallel_nodes must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AqpConfig::default().validate().is_ok());
        let bad = AqpConfig {
            max_parallel_nodes: 0,
            ..AqpConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
