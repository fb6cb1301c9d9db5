//! Tamper-evident usage counters bound to a single database instance.
//!
//! The crate is storage-agnostic: it encodes, seals, hashes and validates
//! [`DatabaseIdentity`], [`SecureCounter`], [`CounterChangeRecord`] and
//! [`UpdateCode`] values. Persistence lives in `usage-counter-store-sqlite`.

use time::{Duration, OffsetDateTime, UtcOffset};

pub mod codec;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod hash;
pub mod identity;
pub mod ledger;
pub mod update_code;

pub use config::{CounterConfig, LedgerCheck, SecurityContext};
pub use counter::{standard_counter_name, CounterId, SecureCounter, COUNTER_ID_BITS};
pub use crypto::{SealPurpose, SharedSecret};
pub use identity::{DatabaseFacts, DatabaseIdentity};
pub use ledger::{CounterChangeRecord, InsertStatement, LedgerRow, SqlParam};
pub use update_code::{
    CodeFormat, CounterAction, CounterOperation, OperationSummary, UpdateCode, UpdateCodeSummary,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CounterError {
    /// Malformed, truncated or undecryptable bytes.
    #[error("format error: {0}")]
    Format(String),
    /// A decoded hash disagrees with the value recomputed from its fields.
    #[error("corruption detected: {detail} (expected {expected:#018x}, found {actual:#018x})")]
    Corruption {
        detail: String,
        expected: u64,
        actual: u64,
        recorded_at: Option<OffsetDateTime>,
    },
    #[error("validation failed [{reason}]: {detail}")]
    Validation { reason: String, detail: String },
    #[error("replay rejected: {0}")]
    Replay(String),
    #[error("update code operation #{index} (counter {counter_id}) failed: {detail}")]
    Operation {
        index: usize,
        counter_id: u16,
        detail: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CounterError {
    pub(crate) fn validation(reason: &str, detail: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.to_string(),
            detail: detail.into(),
        }
    }

    /// Short machine-readable reason for support tooling.
    #[must_use]
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Format(_) => "format",
            Self::Corruption { .. } => "corruption",
            Self::Validation { reason, .. } => reason,
            Self::Replay(_) => "replay",
            Self::Operation { .. } => "operation",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CounterError::Format`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CounterError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CounterError::Format(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CounterError::Format(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CounterError::Format`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CounterError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CounterError::Format(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Returns a timestamp strictly later than every floor, preferring `now`.
///
/// # Errors
/// Returns [`CounterError::Format`] when the latest floor sits at the end of
/// the representable range.
pub fn strictly_after(
    now: OffsetDateTime,
    floors: &[OffsetDateTime],
) -> Result<OffsetDateTime, CounterError> {
    let Some(latest) = floors.iter().copied().max() else {
        return Ok(now);
    };

    if now > latest {
        return Ok(now);
    }

    latest.checked_add(Duration::milliseconds(1)).ok_or_else(|| {
        CounterError::Format(format!("no timestamp is representable after {latest}"))
    })
}
