//! Configuration for statement preparation
//!
//! Provides the limits applied when preparing a statement, with serde
//! support so the section can be embedded in a larger configuration file
//! and sensible zero-value defaults (zero means unlimited).

use serde::{Deserialize, Serialize};

/// Limits applied when preparing and reading a statement
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectConfig {
    /// Maximum number of points a cursor may emit (0 = unlimited)
    #[serde(default = "default_max_point_n")]
    pub max_point_n: usize,

    /// Maximum number of concurrent series (0 = unlimited)
    #[serde(default = "default_max_series_n")]
    pub max_series_n: usize,

    /// Maximum number of interval buckets a statement may produce
    /// (0 = unlimited)
    #[serde(default = "default_max_buckets_n")]
    pub max_buckets_n: usize,
}

fn default_max_point_n() -> usize {
    0
}

fn default_max_series_n() -> usize {
    0
}

fn default_max_buckets_n() -> usize {
    0
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            max_point_n: default_max_point_n(),
            max_series_n: default_max_series_n(),
            max_buckets_n: default_max_buckets_n(),
        }
    }
}

impl SelectConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        // All limits are usize; zero means unlimited, so every value is valid.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unlimited() {
        let config = SelectConfig::default();
        assert_eq!(config.max_point_n, 0);
        assert_eq!(config.max_series_n, 0);
        assert_eq!(config.max_buckets_n, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SelectConfig = toml_from_str("max_point_n = 1000");
        assert_eq!(config.max_point_n, 1000);
        assert_eq!(config.max_buckets_n, 0);
    }

    fn toml_from_str(s: &str) -> SelectConfig {
        // serde_json round-trip keeps the test free of a TOML dev-dependency;
        // the serde defaults under test are format-agnostic.
        let mut value = serde_json::Map::new();
        for line in s.lines() {
            let (k, v) = line.split_once('=').unwrap();
            value.insert(
                k.trim().to_string(),
                serde_json::Value::Number(v.trim().parse::<u64>().unwrap().into()),
            );
        }
        serde_json::from_value(serde_json::Value::Object(value)).unwrap()
    }
}
