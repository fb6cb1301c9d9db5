//! Append-only audit trail of counter transitions.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::hash::FieldMixer;
use crate::{format_rfc3339, parse_rfc3339_utc, CounterError, CounterId};

pub const INSERT_CHANGE_SQL: &str = "INSERT INTO counter_changes(
    counter_id, to_value, from_value, updated_time,
    updated_by_session_id, min_document_count, hash_value, comment
 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterChangeRecord {
    pub counter_id: CounterId,
    pub from_value: i64,
    pub to_value: i64,
    pub updated_time: OffsetDateTime,
    pub updated_by_session_id: Option<Ulid>,
    pub min_document_count: i64,
    pub comment: String,
    pub record_hash: u64,
}

/// Raw persisted columns of one `counter_changes` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub counter_id: i64,
    pub from_value: i64,
    pub to_value: i64,
    pub updated_time: String,
    pub updated_by_session_id: Option<String>,
    pub min_document_count: i64,
    pub hash_value: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Integer(i64),
    Text(String),
    Null,
}

/// Parameterized statement; values are never spliced into the SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub sql: &'static str,
    pub params: Vec<SqlParam>,
}

impl CounterChangeRecord {
    /// Builds a record and stamps its hash. `updated_time` is normalized
    /// to UTC.
    #[must_use]
    pub fn new(
        counter_id: CounterId,
        from_value: i64,
        to_value: i64,
        updated_time: OffsetDateTime,
        updated_by_session_id: Option<Ulid>,
        min_document_count: i64,
        comment: impl Into<String>,
    ) -> Self {
        let mut record = Self {
            counter_id,
            from_value,
            to_value,
            updated_time: updated_time.to_offset(time::UtcOffset::UTC),
            updated_by_session_id,
            min_document_count,
            comment: comment.into(),
            record_hash: 0,
        };
        record.record_hash = record.compute_hash();
        record
    }

    #[must_use]
    pub fn compute_hash(&self) -> u64 {
        let mixer = FieldMixer::new()
            .i64(i64::from(self.counter_id.get()))
            .i64(self.from_value)
            .i64(self.to_value)
            .timestamp(self.updated_time)
            .optional_ulid(self.updated_by_session_id)
            .i64(self.min_document_count);

        // Records written before comments existed hash without this field.
        if self.comment.is_empty() {
            mixer.finish()
        } else {
            mixer.str(&self.comment).finish()
        }
    }

    /// Parses one persisted row.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] for unparseable columns and
    /// [`CounterError::Corruption`] when `validate_hash` is set and the stored
    /// hash disagrees with the recomputed one.
    pub fn load(row: LedgerRow, validate_hash: bool) -> Result<Self, CounterError> {
        let counter_id = CounterId::try_from(row.counter_id)?;
        let updated_time = parse_rfc3339_utc(&row.updated_time)?;
        let updated_by_session_id = row
            .updated_by_session_id
            .as_deref()
            .map(|raw| {
                Ulid::from_string(raw)
                    .map_err(|_| CounterError::Format(format!("invalid session id: {raw}")))
            })
            .transpose()?;

        let record = Self {
            counter_id,
            from_value: row.from_value,
            to_value: row.to_value,
            updated_time,
            updated_by_session_id,
            min_document_count: row.min_document_count,
            comment: row.comment.unwrap_or_default(),
            record_hash: hash_from_sql(row.hash_value),
        };

        if validate_hash {
            let expected = record.compute_hash();
            if expected != record.record_hash {
                return Err(CounterError::Corruption {
                    detail: format!(
                        "change record for counter {} does not match its hash",
                        record.counter_id
                    ),
                    expected,
                    actual: record.record_hash,
                    recorded_at: Some(record.updated_time),
                });
            }
        }

        Ok(record)
    }

    /// # Errors
    /// Returns [`CounterError::Format`] when the timestamp cannot be rendered.
    pub fn to_insert_statement(&self) -> Result<InsertStatement, CounterError> {
        Ok(InsertStatement {
            sql: INSERT_CHANGE_SQL,
            params: vec![
                SqlParam::Integer(i64::from(self.counter_id.get())),
                SqlParam::Integer(self.to_value),
                SqlParam::Integer(self.from_value),
                SqlParam::Text(format_rfc3339(self.updated_time)?),
                self.updated_by_session_id
                    .map_or(SqlParam::Null, |id| SqlParam::Text(id.to_string())),
                SqlParam::Integer(self.min_document_count),
                SqlParam::Integer(hash_to_sql(self.record_hash)),
                if self.comment.is_empty() {
                    SqlParam::Null
                } else {
                    SqlParam::Text(self.comment.clone())
                },
            ],
        })
    }
}

/// SQLite integers are signed; hashes are stored bit-for-bit.
#[must_use]
pub fn hash_to_sql(hash: u64) -> i64 {
    i64::from_le_bytes(hash.to_le_bytes())
}

#[must_use]
pub fn hash_from_sql(value: i64) -> u64 {
    u64::from_le_bytes(value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_record(comment: &str) -> CounterChangeRecord {
        CounterChangeRecord::new(
            must_ok(CounterId::new(3)),
            41,
            42,
            must_ok(parse_rfc3339_utc("2024-06-01T12:30:00.25Z")),
            Some(must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M2"))),
            1_000,
            comment,
        )
    }

    fn row_for(record: &CounterChangeRecord) -> LedgerRow {
        LedgerRow {
            counter_id: i64::from(record.counter_id.get()),
            from_value: record.from_value,
            to_value: record.to_value,
            updated_time: must_ok(format_rfc3339(record.updated_time)),
            updated_by_session_id: record.updated_by_session_id.map(|id| id.to_string()),
            min_document_count: record.min_document_count,
            hash_value: hash_to_sql(record.record_hash),
            comment: (!record.comment.is_empty()).then(|| record.comment.clone()),
        }
    }

    #[test]
    fn empty_comment_does_not_contribute_to_hash() {
        let record = fixture_record("");
        let legacy = FieldMixer::new()
            .i64(3)
            .i64(41)
            .i64(42)
            .timestamp(record.updated_time)
            .optional_ulid(record.updated_by_session_id)
            .i64(1_000)
            .finish();
        assert_eq!(record.record_hash, legacy);
        assert_ne!(fixture_record("note").record_hash, legacy);
    }

    #[test]
    fn persisted_row_loads_with_matching_hash() {
        let record = fixture_record("increment");
        let loaded = must_ok(CounterChangeRecord::load(row_for(&record), true));
        assert_eq!(loaded, record);
    }

    #[test]
    fn edited_row_is_reported_with_hashes_and_timestamp() {
        let record = fixture_record("increment");
        let mut row = row_for(&record);
        row.to_value = 4_200;

        let err = CounterChangeRecord::load(row.clone(), true);
        match err {
            Err(CounterError::Corruption {
                expected,
                actual,
                recorded_at,
                ..
            }) => {
                assert_eq!(actual, record.record_hash);
                assert_ne!(expected, actual);
                assert_eq!(recorded_at, Some(record.updated_time));
            }
            other => panic!("expected corruption, got {other:?}"),
        }

        assert!(CounterChangeRecord::load(row, false).is_ok());
    }

    #[test]
    fn insert_statement_is_parameterized_and_utc() {
        let record = fixture_record("");
        let statement = must_ok(record.to_insert_statement());
        assert_eq!(statement.params.len(), 8);
        assert!(!statement.sql.contains("2024"));
        match &statement.params[3] {
            SqlParam::Text(raw) => {
                assert!(raw.ends_with('Z'));
                assert_eq!(must_ok(parse_rfc3339_utc(raw)), record.updated_time);
            }
            other => panic!("expected text timestamp, got {other:?}"),
        }
        assert_eq!(statement.params[7], SqlParam::Null);
    }

    #[test]
    fn hash_sql_conversion_is_lossless() {
        for hash in [0, 1, u64::MAX, 0x8000_0000_0000_0000] {
            assert_eq!(hash_from_sql(hash_to_sql(hash)), hash);
        }
    }
}
