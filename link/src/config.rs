//! TOML configuration for the realtime engine.
//!
//! ```toml
//! [connection]
//! primary_base_delay_secs = 30
//! max_reconnect_attempts = 8
//!
//! [timeouts]
//! health_check_interval = 15000   # ms
//! hidden_disconnect_after = 600000
//!
//! [cache]
//! page_size = 500
//!
//! [cache.reconciliation]
//! match_ratio = 0.85
//! ```
//!
//! Every section and key is optional; omitted values take their defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{CourseLinkError, Result};
use crate::models::{ConnectionOptions, TableCacheOptions};
use crate::timeouts::LinkTimeouts;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connection: ConnectionOptions,
    pub timeouts: LinkTimeouts,
    pub cache: TableCacheOptions,
}

impl LinkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CourseLinkError::ConfigurationError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: LinkConfig = toml::from_str(content).map_err(|e| {
            CourseLinkError::ConfigurationError(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CourseLinkError::ConfigurationError(msg));

        let conn = &self.connection;
        if conn.min_base_delay_secs == 0 {
            return invalid("min_base_delay_secs cannot be 0".to_string());
        }
        if conn.max_reconnect_delay_secs < conn.min_base_delay_secs {
            return invalid(format!(
                "max_reconnect_delay_secs ({}) cannot be below min_base_delay_secs ({})",
                conn.max_reconnect_delay_secs, conn.min_base_delay_secs
            ));
        }
        if conn.max_backoff_exponent > 32 {
            return invalid(format!(
                "max_backoff_exponent ({}) cannot exceed 32",
                conn.max_backoff_exponent
            ));
        }

        let timeouts = &self.timeouts;
        if timeouts.reconnect_attempt_timeout.is_zero() {
            return invalid("reconnect_attempt_timeout cannot be 0".to_string());
        }
        if timeouts.health_check_interval.is_zero() {
            return invalid("health_check_interval cannot be 0".to_string());
        }
        if timeouts.stuck_channel_threshold < timeouts.health_check_interval {
            return invalid(format!(
                "stuck_channel_threshold ({:?}) cannot be shorter than health_check_interval ({:?})",
                timeouts.stuck_channel_threshold, timeouts.health_check_interval
            ));
        }

        let cache = &self.cache;
        if cache.page_size == 0 {
            return invalid("page_size cannot be 0".to_string());
        }
        if cache.max_rows == Some(0) {
            return invalid("max_rows cannot be 0".to_string());
        }
        if cache.id_column.trim().is_empty() {
            return invalid("id_column cannot be empty".to_string());
        }

        let policy = &cache.reconciliation;
        if !(policy.match_ratio > 0.0 && policy.match_ratio <= 1.0) {
            return invalid(format!(
                "match_ratio ({}) must be in (0, 1]",
                policy.match_ratio
            ));
        }
        if policy.min_comparable_fields == 0 {
            return invalid("min_comparable_fields cannot be 0".to_string());
        }
        if policy.timestamp_tolerance_ms < 0 {
            return invalid("timestamp_tolerance_ms cannot be negative".to_string());
        }

        Ok(())
    }
}
