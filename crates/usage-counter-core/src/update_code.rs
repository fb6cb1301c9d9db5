//! Offline-issued batches of counter operations.
//!
//! Plain layout before sealing:
//!
//! ```text
//! target identity record | generated_at | issued_by_user | issued_from_machine
//! | operation_count: i32 | operations...
//! ```
//!
//! A non-negative count selects the current format, where each operation is
//! `counter_id: i32 [name if id >= 100] kind: u8 [value: i64 unless Delete]`.
//! A negative count selects the legacy unlock format: `|count|` pairs of
//! `counter_id: i32, value: i64`, each an unnamed `Set`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::codec::{RecordReader, RecordWriter};
use crate::counter::standard_counter_name;
use crate::crypto::{from_transport, to_transport};
use crate::{format_rfc3339, CounterError, CounterId, DatabaseIdentity, SealPurpose, SharedSecret};

const KIND_CREATE: u8 = 1;
const KIND_SET: u8 = 2;
const KIND_DELETE: u8 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CodeFormat {
    Current,
    LegacyUnlock,
}

impl CodeFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::LegacyUnlock => "legacy_unlock",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterAction {
    Create { value: i64 },
    Set { value: i64 },
    Delete,
}

impl CounterAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Set { .. } => "set",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn value(self) -> Option<i64> {
        match self {
            Self::Create { value } | Self::Set { value } => Some(value),
            Self::Delete => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Create { .. } => KIND_CREATE,
            Self::Set { .. } => KIND_SET,
            Self::Delete => KIND_DELETE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CounterOperation {
    pub counter_id: CounterId,
    /// Present only for custom counters in current-format codes.
    pub counter_name: Option<String>,
    pub action: CounterAction,
}

impl CounterOperation {
    #[must_use]
    pub fn new(counter_id: CounterId, counter_name: Option<String>, action: CounterAction) -> Self {
        Self {
            counter_id,
            counter_name: if counter_id.is_custom() {
                counter_name
            } else {
                None
            },
            action,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        match (&self.counter_name, standard_counter_name(self.counter_id)) {
            (Some(name), _) => name.clone(),
            (None, Some(name)) => name.to_string(),
            (None, None) => format!("Counter {}", self.counter_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateCode {
    pub target_identity: DatabaseIdentity,
    pub generated_at: OffsetDateTime,
    pub issued_by_user: String,
    pub issued_from_machine: String,
    pub format: CodeFormat,
    pub operations: Vec<CounterOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationSummary {
    pub index: usize,
    pub counter_id: CounterId,
    pub counter_name: String,
    pub action: String,
    pub value: Option<i64>,
    pub description: String,
}

/// What an update code will do, derived from decoding only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateCodeSummary {
    pub target_database_id: Ulid,
    pub target_server: String,
    pub target_database: String,
    pub generated_at: String,
    pub issued_by_user: String,
    pub issued_from_machine: String,
    pub format: CodeFormat,
    pub operation_count: i32,
    pub operations: Vec<OperationSummary>,
}

impl UpdateCode {
    /// Vendor-side constructor. The embedded target is certified as of
    /// `generated_at`, so a code issued after a restore of the target
    /// database passes the target check.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when the target cannot be certified
    /// at any representable time.
    pub fn issue(
        target: &DatabaseIdentity,
        generated_at: OffsetDateTime,
        issued_by_user: impl Into<String>,
        issued_from_machine: impl Into<String>,
        format: CodeFormat,
        operations: Vec<CounterOperation>,
    ) -> Result<Self, CounterError> {
        let generated_at = generated_at.to_offset(time::UtcOffset::UTC);
        Ok(Self {
            target_identity: target.touched(generated_at)?,
            generated_at,
            issued_by_user: issued_by_user.into(),
            issued_from_machine: issued_from_machine.into(),
            format,
            operations,
        })
    }

    /// Signed count as written on the wire; the sign selects the format.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when there are more operations than
    /// an `i32` count can describe.
    pub fn operation_count(&self) -> Result<i32, CounterError> {
        let count = i32::try_from(self.operations.len()).map_err(|_| {
            CounterError::Format(format!("too many operations: {}", self.operations.len()))
        })?;
        Ok(match self.format {
            CodeFormat::Current => count,
            CodeFormat::LegacyUnlock => -count,
        })
    }

    /// # Errors
    /// Returns [`CounterError::Format`] when the operations cannot be
    /// expressed in the selected format.
    pub fn to_plain_bytes(&self) -> Result<Vec<u8>, CounterError> {
        let mut writer = RecordWriter::new();
        write_identity(&mut writer, &self.target_identity)?;
        writer.timestamp(self.generated_at);
        writer
            .string(&self.issued_by_user)?
            .string(&self.issued_from_machine)?;
        writer.i32(self.operation_count()?);

        for (index, operation) in self.operations.iter().enumerate() {
            let counter_id = i32::from(operation.counter_id.get());
            match self.format {
                CodeFormat::Current => {
                    writer.i32(counter_id);
                    if operation.counter_id.is_custom() {
                        let name = operation
                            .counter_name
                            .as_deref()
                            .filter(|name| !name.trim().is_empty())
                            .ok_or_else(|| {
                                CounterError::Format(format!(
                                    "operation #{index}: custom counter {} needs a name",
                                    operation.counter_id
                                ))
                            })?;
                        writer.string(name)?;
                    }
                    writer.u8(operation.action.tag());
                    if let Some(value) = operation.action.value() {
                        writer.i64(value);
                    }
                }
                CodeFormat::LegacyUnlock => {
                    let CounterAction::Set { value } = operation.action else {
                        return Err(CounterError::Format(format!(
                            "operation #{index}: legacy unlock codes only carry set operations"
                        )));
                    };
                    writer.i32(counter_id).i64(value);
                }
            }
        }

        Ok(writer.into_bytes())
    }

    /// Single forward pass over a decrypted code.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] for truncated, trailing or
    /// out-of-range input.
    pub fn from_plain_bytes(bytes: &[u8]) -> Result<Self, CounterError> {
        let mut reader = RecordReader::new(bytes);
        let target_identity = DatabaseIdentity::read_from(&mut reader)?;
        let generated_at = reader.timestamp("generated_at")?;
        let issued_by_user = reader.string("issued_by_user")?;
        let issued_from_machine = reader.string("issued_from_machine")?;
        let operation_count = reader.i32("operation_count")?;

        let (format, operations) = if operation_count >= 0 {
            (
                CodeFormat::Current,
                read_current_operations(&mut reader, operation_count.unsigned_abs())?,
            )
        } else {
            (
                CodeFormat::LegacyUnlock,
                read_legacy_operations(&mut reader, operation_count.unsigned_abs())?,
            )
        };
        reader.finish()?;

        Ok(Self {
            target_identity,
            generated_at,
            issued_by_user,
            issued_from_machine,
            format,
            operations,
        })
    }

    /// # Errors
    /// Returns [`CounterError::Format`] when encoding or sealing fails.
    pub fn encode(&self, secret: &SharedSecret) -> Result<Vec<u8>, CounterError> {
        secret.seal(SealPurpose::UpdateCode, &self.to_plain_bytes()?)
    }

    /// # Errors
    /// Returns [`CounterError::Format`] for a wrong key, damaged blob or
    /// malformed contents.
    pub fn decode(bytes: &[u8], secret: &SharedSecret) -> Result<Self, CounterError> {
        let plain = secret.open(SealPurpose::UpdateCode, bytes)?;
        Self::from_plain_bytes(&plain)
    }

    /// # Errors
    /// Returns [`CounterError::Format`] when encoding or sealing fails.
    pub fn to_transport(&self, secret: &SharedSecret) -> Result<String, CounterError> {
        Ok(to_transport(&self.encode(secret)?))
    }

    /// # Errors
    /// Returns [`CounterError::Format`] for invalid text or a bad blob.
    pub fn from_transport(text: &str, secret: &SharedSecret) -> Result<Self, CounterError> {
        Self::decode(&from_transport(text)?, secret)
    }

    /// # Errors
    /// Returns [`CounterError::Format`] if the operation count overflows.
    pub fn summary(&self) -> Result<UpdateCodeSummary, CounterError> {
        let operations = self
            .operations
            .iter()
            .enumerate()
            .map(|(index, operation)| {
                let counter_name = operation.display_name();
                let description = match operation.action {
                    CounterAction::Create { value } => format!(
                        "create counter {} '{counter_name}' with value {value}",
                        operation.counter_id
                    ),
                    CounterAction::Set { value } => format!(
                        "set counter {} '{counter_name}' to {value}",
                        operation.counter_id
                    ),
                    CounterAction::Delete => format!(
                        "delete counter {} '{counter_name}'",
                        operation.counter_id
                    ),
                };
                OperationSummary {
                    index,
                    counter_id: operation.counter_id,
                    counter_name,
                    action: operation.action.as_str().to_string(),
                    value: operation.action.value(),
                    description,
                }
            })
            .collect();

        Ok(UpdateCodeSummary {
            target_database_id: self.target_identity.id,
            target_server: self.target_identity.server.clone(),
            target_database: self.target_identity.name.clone(),
            generated_at: format_rfc3339(self.generated_at)?,
            issued_by_user: self.issued_by_user.clone(),
            issued_from_machine: self.issued_from_machine.clone(),
            format: self.format,
            operation_count: self.operation_count()?,
            operations,
        })
    }
}

fn write_identity(writer: &mut RecordWriter, identity: &DatabaseIdentity) -> Result<(), CounterError> {
    writer.raw(&identity.to_record_bytes()?);
    Ok(())
}

fn read_counter_id(reader: &mut RecordReader<'_>, index: u32) -> Result<CounterId, CounterError> {
    let raw = reader.i32("counter_id")?;
    CounterId::try_from(i64::from(raw))
        .map_err(|err| CounterError::Format(format!("operation #{index}: {err}")))
}

fn read_value(reader: &mut RecordReader<'_>, index: u32) -> Result<i64, CounterError> {
    let value = reader.i64("value")?;
    if value < 0 {
        return Err(CounterError::Format(format!(
            "operation #{index}: negative counter value {value}"
        )));
    }
    Ok(value)
}

fn read_current_operations(
    reader: &mut RecordReader<'_>,
    count: u32,
) -> Result<Vec<CounterOperation>, CounterError> {
    let mut operations = Vec::new();
    for index in 0..count {
        let counter_id = read_counter_id(reader, index)?;
        let counter_name = if counter_id.is_custom() {
            let name = reader.string("counter_name")?;
            if name.trim().is_empty() {
                return Err(CounterError::Format(format!(
                    "operation #{index}: custom counter {counter_id} has an empty name"
                )));
            }
            Some(name)
        } else {
            None
        };

        let action = match reader.u8("operation kind")? {
            KIND_CREATE => CounterAction::Create {
                value: read_value(reader, index)?,
            },
            KIND_SET => CounterAction::Set {
                value: read_value(reader, index)?,
            },
            KIND_DELETE => CounterAction::Delete,
            other => {
                return Err(CounterError::Format(format!(
                    "operation #{index}: unknown operation kind {other}"
                )))
            }
        };

        operations.push(CounterOperation {
            counter_id,
            counter_name,
            action,
        });
    }
    Ok(operations)
}

fn read_legacy_operations(
    reader: &mut RecordReader<'_>,
    count: u32,
) -> Result<Vec<CounterOperation>, CounterError> {
    let mut operations = Vec::new();
    for index in 0..count {
        let counter_id = read_counter_id(reader, index)?;
        let value = read_value(reader, index)?;
        operations.push(CounterOperation {
            counter_id,
            counter_name: None,
            action: CounterAction::Set { value },
        });
    }
    Ok(operations)
}
