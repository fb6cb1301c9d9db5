use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::codec::{RecordReader, RecordWriter};
use crate::hash::FieldMixer;
use crate::{CounterChangeRecord, CounterError, DatabaseIdentity, SealPurpose, SharedSecret};

/// Low bits of the composite hash reserved for the counter id.
pub const COUNTER_ID_BITS: u32 = 10;
pub const COUNTER_ID_MASK: u64 = (1 << COUNTER_ID_BITS) - 1;
/// Ids below this value are vendor-defined standard counters.
pub const FIRST_CUSTOM_COUNTER_ID: u16 = 100;

const COUNTER_FORMAT_V1: u8 = 1;
/// format + value + composite hash + checksum.
pub const COUNTER_RECORD_LEN: usize = 1 + 8 + 8 + 8;

const STANDARD_COUNTERS: &[(u16, &str)] = &[
    (1, "Indexing by document"),
    (2, "Indexing by page"),
    (3, "Redaction by document"),
    (4, "Redaction by page"),
    (5, "OCR by page"),
    (6, "Classification by document"),
    (7, "Data extraction by document"),
    (8, "Export by document"),
];

#[must_use]
pub fn standard_counter_name(id: CounterId) -> Option<&'static str> {
    STANDARD_COUNTERS
        .iter()
        .find(|(candidate, _)| *candidate == id.get())
        .map(|(_, name)| *name)
}

/// Counter id that fits the reserved bits of the composite hash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u16", into = "u16")]
pub struct CounterId(u16);

impl CounterId {
    /// # Errors
    /// Returns [`CounterError::Format`] for ids that do not fit in
    /// [`COUNTER_ID_BITS`] bits.
    pub fn new(raw: u16) -> Result<Self, CounterError> {
        if u64::from(raw) > COUNTER_ID_MASK {
            return Err(CounterError::Format(format!(
                "counter id {raw} exceeds the {COUNTER_ID_BITS}-bit limit ({COUNTER_ID_MASK})"
            )));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn is_custom(self) -> bool {
        self.0 >= FIRST_CUSTOM_COUNTER_ID
    }
}

impl Display for CounterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for CounterId {
    type Error = CounterError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<i64> for CounterId {
    type Error = CounterError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let raw = u16::try_from(value)
            .map_err(|_| CounterError::Format(format!("counter id {value} is out of range")))?;
        Self::new(raw)
    }
}

impl From<CounterId> for u16 {
    fn from(value: CounterId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct CounterSeal {
    composite_hash: u64,
    checksum: u64,
}

/// A named usage counter whose sealed form is bound to its id and to one
/// database identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SecureCounter {
    pub counter_id: CounterId,
    /// Explicit name; only custom counters carry one.
    pub name: Option<String>,
    pub value: i64,
    pub alert_level: Option<i64>,
    pub alert_multiple: Option<i64>,
    #[serde(skip)]
    seal: Option<CounterSeal>,
}

impl SecureCounter {
    /// # Errors
    /// Returns [`CounterError::Validation`] when a custom counter has no name
    /// or the value is negative.
    pub fn new(counter_id: CounterId, name: Option<String>, value: i64) -> Result<Self, CounterError> {
        let name = name.filter(|candidate| !candidate.trim().is_empty());
        if counter_id.is_custom() && name.is_none() {
            return Err(CounterError::validation(
                "counter.name_required",
                format!("custom counter {counter_id} requires a name"),
            ));
        }

        if value < 0 {
            return Err(CounterError::validation(
                "counter.negative_value",
                format!("counter {counter_id} value {value} is negative"),
            ));
        }

        Ok(Self {
            counter_id,
            name,
            value,
            alert_level: None,
            alert_multiple: None,
            seal: None,
        })
    }

    #[must_use]
    pub fn with_alerts(mut self, alert_level: Option<i64>, alert_multiple: Option<i64>) -> Self {
        self.alert_level = alert_level;
        self.alert_multiple = alert_multiple;
        self
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        standard_counter_name(self.counter_id).map_or_else(
            || format!("Standard counter {}", self.counter_id),
            str::to_string,
        )
    }

    #[must_use]
    pub fn expected_composite_hash(identity: &DatabaseIdentity, counter_id: CounterId) -> u64 {
        (identity.compute_hash() << COUNTER_ID_BITS) | u64::from(counter_id.get())
    }

    /// Composite hash read from the sealed form, if this value was loaded.
    #[must_use]
    pub fn composite_hash(&self) -> Option<u64> {
        self.seal.map(|seal| seal.composite_hash)
    }

    fn record_checksum(value: i64, composite_hash: u64) -> u64 {
        FieldMixer::new().i64(value).u64(composite_hash).finish()
    }

    /// Decrypted record layout: format byte, value, composite hash, checksum.
    ///
    /// # Errors
    /// Returns [`CounterError::Validation`] for a negative value.
    pub fn to_record_bytes(&self, identity: &DatabaseIdentity) -> Result<Vec<u8>, CounterError> {
        if self.value < 0 {
            return Err(CounterError::validation(
                "counter.negative_value",
                format!("counter {} value {} is negative", self.counter_id, self.value),
            ));
        }

        let composite = Self::expected_composite_hash(identity, self.counter_id);
        let mut writer = RecordWriter::new();
        writer
            .u8(COUNTER_FORMAT_V1)
            .i64(self.value)
            .u64(composite)
            .u64(Self::record_checksum(self.value, composite));
        Ok(writer.into_bytes())
    }

    /// Decodes a decrypted record for the counter stored under `counter_id`.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] for malformed records and
    /// [`CounterError::Corruption`] when the id bits of the composite hash do
    /// not name `counter_id`.
    pub fn from_record_bytes(
        counter_id: CounterId,
        name: Option<String>,
        bytes: &[u8],
    ) -> Result<Self, CounterError> {
        let mut reader = RecordReader::new(bytes);
        let format = reader.u8("counter format")?;
        if format != COUNTER_FORMAT_V1 {
            return Err(CounterError::Format(format!(
                "unsupported counter format {format}"
            )));
        }
        let value = reader.i64("counter value")?;
        let composite_hash = reader.u64("composite hash")?;
        let checksum = reader.u64("counter checksum")?;
        reader.finish()?;

        let embedded_id = composite_hash & COUNTER_ID_MASK;
        if embedded_id != u64::from(counter_id.get()) {
            return Err(CounterError::Corruption {
                detail: format!(
                    "counter {counter_id} holds a value sealed for counter {embedded_id}"
                ),
                expected: u64::from(counter_id.get()),
                actual: embedded_id,
                recorded_at: None,
            });
        }

        Ok(Self {
            counter_id,
            name: name.filter(|candidate| !candidate.trim().is_empty()),
            value,
            alert_level: None,
            alert_multiple: None,
            seal: Some(CounterSeal {
                composite_hash,
                checksum,
            }),
        })
    }

    /// # Errors
    /// Returns [`CounterError::Validation`] for a negative value and
    /// [`CounterError::Format`] if sealing fails.
    pub fn encrypted_value(
        &self,
        identity: &DatabaseIdentity,
        secret: &SharedSecret,
    ) -> Result<Vec<u8>, CounterError> {
        secret.seal(SealPurpose::Counter, &self.to_record_bytes(identity)?)
    }

    /// Decrypts a stored blob. The id check runs before anything that needs
    /// the database identity.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when decryption or decoding fails and
    /// [`CounterError::Corruption`] when the blob belongs to another counter.
    pub fn load_from(
        counter_id: CounterId,
        name: Option<String>,
        bytes: &[u8],
        secret: &SharedSecret,
    ) -> Result<Self, CounterError> {
        let plain = secret.open(SealPurpose::Counter, bytes)?;
        Self::from_record_bytes(counter_id, name, &plain)
    }

    /// Checks the loaded value against the live identity and, when given,
    /// the latest ledger entry for this counter.
    ///
    /// # Errors
    /// * [`CounterError::Corruption`] when the record checksum fails (the
    ///   value was edited inside the sealed record).
    /// * [`CounterError::Validation`] with reasons `counter.unsealed`,
    ///   `counter.composite_mismatch`, `counter.ledger_foreign` or
    ///   `counter.ledger_mismatch`.
    pub fn validate(
        &self,
        identity: &DatabaseIdentity,
        latest_change: Option<&CounterChangeRecord>,
    ) -> Result<(), CounterError> {
        let Some(seal) = self.seal else {
            return Err(CounterError::validation(
                "counter.unsealed",
                format!("counter {} was not loaded from a sealed value", self.counter_id),
            ));
        };

        let checksum = Self::record_checksum(self.value, seal.composite_hash);
        if checksum != seal.checksum {
            return Err(CounterError::Corruption {
                detail: format!("counter {} record checksum mismatch", self.counter_id),
                expected: checksum,
                actual: seal.checksum,
                recorded_at: None,
            });
        }

        let expected = Self::expected_composite_hash(identity, self.counter_id);
        if seal.composite_hash != expected {
            return Err(CounterError::validation(
                "counter.composite_mismatch",
                format!(
                    "counter {} expected {expected:#018x} found {:#018x}",
                    self.counter_id, seal.composite_hash
                ),
            ));
        }

        if let Some(change) = latest_change {
            if change.counter_id != self.counter_id {
                return Err(CounterError::validation(
                    "counter.ledger_foreign",
                    format!(
                        "counter {} checked against ledger entry of counter {}",
                        self.counter_id, change.counter_id
                    ),
                ));
            }

            if change.to_value != self.value {
                return Err(CounterError::validation(
                    "counter.ledger_mismatch",
                    format!(
                        "counter {} value {} but ledger to_value {}",
                        self.counter_id, self.value, change.to_value
                    ),
                ));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn is_valid(
        &self,
        identity: &DatabaseIdentity,
        latest_change: Option<&CounterChangeRecord>,
    ) -> bool {
        self.validate(identity, latest_change).is_ok()
    }
}
