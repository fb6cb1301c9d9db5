use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CounterError, SharedSecret};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCheck {
    /// Every counter must have a change record whose `to_value` matches.
    Required,
    /// Cross-check only counters that have a change record; databases that
    /// predate the ledger validate against their identity alone.
    WhenPresent,
}

impl LedgerCheck {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::WhenPresent => "when_present",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "required" => Some(Self::Required),
            "when_present" => Some(Self::WhenPresent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CounterConfig {
    pub ledger_check: LedgerCheck,
    pub validation_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            ledger_check: LedgerCheck::Required,
            validation_attempts: 3,
            retry_delay_ms: 25,
        }
    }
}

impl CounterConfig {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`CounterError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), CounterError> {
        if self.validation_attempts == 0 {
            return Err(CounterError::Configuration(
                "validation_attempts MUST be >= 1".to_string(),
            ));
        }

        if self.validation_attempts > 20 {
            return Err(CounterError::Configuration(
                "validation_attempts MUST be <= 20".to_string(),
            ));
        }

        if self.retry_delay_ms > 5_000 {
            return Err(CounterError::Configuration(
                "retry_delay_ms MUST be <= 5000".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns [`CounterError::Configuration`] when JSON decoding fails
    /// or decoded values violate config constraints.
    pub fn from_json(value: &Value) -> Result<Self, CounterError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            CounterError::Configuration(format!("invalid counter config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Secret plus policy handed to every component that seals or validates.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub secret: SharedSecret,
    pub config: CounterConfig,
}

impl SecurityContext {
    #[must_use]
    pub fn new(secret: SharedSecret, config: CounterConfig) -> Self {
        Self { secret, config }
    }
}
