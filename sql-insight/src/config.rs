//! Engine limits and analysis thresholds

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::database::ExecutionLimits;
use crate::Error;

/// Limits applied to every request, plus the fixed analysis constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Row bound injected when a request does not name one
    pub default_row_limit: u64,

    /// Upper bound for any requested row limit
    pub max_row_limit: u64,

    pub execution_timeout_seconds: u64,

    /// Maximum estimated size of a materialized result set
    pub max_result_bytes: usize,

    pub connect_timeout_seconds: u64,

    /// Pool size per request
    pub max_connections: u32,

    /// A categorical column with at most this many distinct values is "low cardinality"
    pub low_cardinality_threshold: usize,

    /// Normalized slopes with an absolute value at or below this are flat
    pub trend_noise_threshold: f64,

    /// Lifetime of cached schema snapshots; 0 disables the cache
    pub schema_cache_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_row_limit: 1000,
            max_row_limit: 10_000,
            execution_timeout_seconds: 30,
            max_result_bytes: 8 * 1024 * 1024,
            connect_timeout_seconds: 10,
            max_connections: 4,
            low_cardinality_threshold: 12,
            trend_noise_threshold: 0.01,
            schema_cache_ttl_seconds: 300,
        }
    }
}

impl EngineConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Bounds handed to a provider for one statement
    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: self.execution_timeout(),
            max_result_bytes: self.max_result_bytes,
        }
    }

    pub fn schema_cache_ttl(&self) -> Option<Duration> {
        (self.schema_cache_ttl_seconds > 0).then(|| Duration::from_secs(self.schema_cache_ttl_seconds))
    }

    /// Row bound for a request: the requested limit or the default, capped at the maximum
    pub fn effective_row_limit(&self, requested: Option<u64>) -> Result<u64, Error> {
        match requested {
            Some(0) => Err(Error::InvalidRequest(
                "row limit must be at least 1".to_string(),
            )),
            Some(limit) => Ok(limit.min(self.max_row_limit)),
            None => Ok(self.default_row_limit.min(self.max_row_limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_row_limit() {
        let config = EngineConfig::default();
        assert_eq!(config.effective_row_limit(None).unwrap(), 1000);
        assert_eq!(config.effective_row_limit(Some(10)).unwrap(), 10);
        assert_eq!(config.effective_row_limit(Some(1_000_000)).unwrap(), 10_000);
        assert!(matches!(
            config.effective_row_limit(Some(0)),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"default_row_limit": 50}"#).unwrap();
        assert_eq!(config.default_row_limit, 50);
        assert_eq!(config.low_cardinality_threshold, 12);
        assert!(config.schema_cache_ttl().is_some());
    }
}
