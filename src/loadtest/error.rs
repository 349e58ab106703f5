//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for configuration errors, [`RequestError`] for
//! transport failures encountered while a virtual user is running, and
//! [`MetricError`] for invalid writes into the metric registry.

use crate::loadtest::metrics::MetricKind;

/// Errors that occur during load test configuration parsing, validation, or file I/O.
///
/// Every variant except [`LoadTestError::Cli`] is a configuration error: it is
/// raised before the first virtual user starts and the run never executes.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., zero-length stage, missing URL).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// A threshold expression or metric key could not be parsed, references an
    /// unknown metric, or uses an aggregation the metric kind does not support.
    #[error("Invalid threshold '{expression}' on '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// CLI-level error (config not found, file I/O for reports).
    #[error("{message}")]
    Cli { message: String },
}

impl LoadTestError {
    /// Returns `true` for errors raised while loading the configuration.
    pub fn is_config_error(&self) -> bool {
        !matches!(self, Self::Cli { .. })
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// Transport errors encountered by the HTTP client during a run.
///
/// Each variant represents a distinct error category that the metrics pipeline
/// counts separately. HTTP error statuses are not errors: they come back as a
/// regular [`Response`](crate::loadtest::client::Response).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The request exceeded the configured per-request timeout.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake,
    /// connection reset).
    #[error("Network error: {message}")]
    Network { message: String },
}

impl RequestError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"timeout"`, `"network"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network { .. } => "network",
        }
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`RequestError`] variant.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}

/// Rejected metric writes.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum MetricError {
    /// The metric already exists with a different kind.
    #[error("metric '{name}' is a {existing}, cannot record it as a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    /// Trend samples must be finite and non-negative.
    #[error("metric '{name}' rejected sample {value}: trends accept finite non-negative values")]
    InvalidSample { name: String, value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_timeout() {
        assert_eq!(RequestError::Timeout.error_category(), "timeout");
    }

    #[test]
    fn test_error_category_network() {
        let err = RequestError::Network {
            message: "connection refused".to_string(),
        };
        assert_eq!(err.error_category(), "network");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_config_errors_are_flagged() {
        let err = LoadTestError::InvalidThreshold {
            metric: "http_req_duration".to_string(),
            expression: "p(999)<1".to_string(),
            reason: "percentile out of range".to_string(),
        };
        assert!(err.is_config_error());
        assert!(LoadTestError::validation("bad").is_config_error());

        let cli = LoadTestError::Cli {
            message: "no config".to_string(),
        };
        assert!(!cli.is_config_error());
    }

    #[test]
    fn test_kind_mismatch_message() {
        let err = MetricError::KindMismatch {
            name: "failed_requests".to_string(),
            existing: MetricKind::Rate,
            requested: MetricKind::Trend,
        };
        let msg = err.to_string();
        assert!(msg.contains("failed_requests"));
        assert!(msg.contains("rate"));
        assert!(msg.contains("trend"));
    }
}
