use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::codec::{RecordReader, RecordWriter};
use crate::hash::FieldMixer;
use crate::{strictly_after, CounterError, SealPurpose, SharedSecret};

const IDENTITY_FORMAT_V1: u8 = 1;

/// What the live database engine reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseFacts {
    pub server: String,
    pub name: String,
    pub created: OffsetDateTime,
    pub restored: OffsetDateTime,
}

/// Fingerprint of one database instance.
///
/// The integrity hash is never stored: [`DatabaseIdentity::compute_hash`]
/// derives it from the fields every time it is needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseIdentity {
    pub id: Ulid,
    pub server: String,
    pub name: String,
    pub created: OffsetDateTime,
    pub restored: OffsetDateTime,
    pub last_updated: OffsetDateTime,
    /// Generation time of the newest update code applied to this database.
    /// Codes generated at or before it are spent.
    pub code_watermark: OffsetDateTime,
}

impl DatabaseIdentity {
    /// Identity for a freshly provisioned database.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when no `last_updated` after the
    /// engine dates is representable.
    pub fn provision(facts: &DatabaseFacts, now: OffsetDateTime) -> Result<Self, CounterError> {
        Ok(Self {
            id: Ulid::new(),
            server: facts.server.clone(),
            name: facts.name.clone(),
            created: facts.created,
            restored: facts.restored,
            last_updated: strictly_after(now, &[facts.created, facts.restored])?,
            code_watermark: facts.created,
        })
    }

    #[must_use]
    pub fn compute_hash(&self) -> u64 {
        FieldMixer::new()
            .ulid(self.id)
            .str(&self.server)
            .str(&self.name)
            .timestamp(self.created)
            .timestamp(self.restored)
            .timestamp(self.last_updated)
            .timestamp(self.code_watermark)
            .finish()
    }

    /// Same identity with `last_updated` moved strictly forward.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when `last_updated` cannot move
    /// forward any more.
    pub fn touched(&self, now: OffsetDateTime) -> Result<Self, CounterError> {
        Ok(Self {
            last_updated: strictly_after(now, &[self.created, self.restored, self.last_updated])?,
            ..self.clone()
        })
    }

    /// # Errors
    /// Returns [`CounterError::Replay`] unless `generated_at` is strictly
    /// after [`DatabaseIdentity::code_watermark`].
    pub fn check_code_unspent(&self, generated_at: OffsetDateTime) -> Result<(), CounterError> {
        if generated_at > self.code_watermark {
            return Ok(());
        }

        Err(CounterError::Replay(format!(
            "update code generated {generated_at} is not newer than the last applied code ({})",
            self.code_watermark
        )))
    }

    /// Decrypted record layout: format byte, id, server, name, created,
    /// restored, `last_updated`, `code_watermark`.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when a string field is too long.
    pub fn to_record_bytes(&self) -> Result<Vec<u8>, CounterError> {
        let mut writer = RecordWriter::new();
        writer.u8(IDENTITY_FORMAT_V1).ulid(self.id);
        writer.string(&self.server)?.string(&self.name)?;
        writer
            .timestamp(self.created)
            .timestamp(self.restored)
            .timestamp(self.last_updated)
            .timestamp(self.code_watermark);
        Ok(writer.into_bytes())
    }

    /// # Errors
    /// Returns [`CounterError::Format`] on truncation, trailing bytes or an
    /// unknown format byte.
    pub fn from_record_bytes(bytes: &[u8]) -> Result<Self, CounterError> {
        let mut reader = RecordReader::new(bytes);
        let identity = Self::read_from(&mut reader)?;
        reader.finish()?;
        Ok(identity)
    }

    pub(crate) fn read_from(reader: &mut RecordReader<'_>) -> Result<Self, CounterError> {
        let format = reader.u8("identity format")?;
        if format != IDENTITY_FORMAT_V1 {
            return Err(CounterError::Format(format!(
                "unsupported identity format {format}"
            )));
        }

        Ok(Self {
            id: reader.ulid("identity id")?,
            server: reader.string("server")?,
            name: reader.string("database name")?,
            created: reader.timestamp("created")?,
            restored: reader.timestamp("restored")?,
            last_updated: reader.timestamp("last_updated")?,
            code_watermark: reader.timestamp("code_watermark")?,
        })
    }

    /// # Errors
    /// Returns [`CounterError::Format`] when encoding or sealing fails.
    pub fn serialize_encrypted(&self, secret: &SharedSecret) -> Result<Vec<u8>, CounterError> {
        secret.seal(SealPurpose::Identity, &self.to_record_bytes()?)
    }

    /// # Errors
    /// Returns [`CounterError::Format`] when decryption fails or the record
    /// is malformed.
    pub fn deserialize_encrypted(bytes: &[u8], secret: &SharedSecret) -> Result<Self, CounterError> {
        let plain = secret.open(SealPurpose::Identity, bytes)?;
        Self::from_record_bytes(&plain)
    }

    /// Cross-checks this identity against the live database.
    ///
    /// # Errors
    /// Returns [`CounterError::Validation`] with reason `identity.mismatch`
    /// and the explanation from [`DatabaseIdentity::explain_invalid`].
    pub fn check_valid(&self, live: &DatabaseFacts) -> Result<(), CounterError> {
        let valid = self.server.eq_ignore_ascii_case(&live.server)
            && self.name.eq_ignore_ascii_case(&live.name)
            && self.last_updated > live.created
            && self.last_updated > live.restored;

        if valid {
            return Ok(());
        }

        Err(CounterError::validation(
            "identity.mismatch",
            self.explain_invalid(live).join("; "),
        ))
    }

    /// Human-readable reasons for support diagnostics. Never used to decide
    /// validity.
    #[must_use]
    pub fn explain_invalid(&self, live: &DatabaseFacts) -> Vec<String> {
        let mut reasons = Vec::new();

        if !self.server.eq_ignore_ascii_case(&live.server) {
            reasons.push(format!(
                "server changed: identity names '{}', database reports '{}'",
                self.server, live.server
            ));
        }

        if !self.name.eq_ignore_ascii_case(&live.name) {
            reasons.push(format!(
                "database changed: identity names '{}', database reports '{}'",
                self.name, live.name
            ));
        }

        if self.last_updated <= live.created {
            reasons.push(format!(
                "unexpected creation date: database created {} but identity last updated {}",
                live.created, self.last_updated
            ));
        }

        if self.last_updated <= live.restored {
            reasons.push(format!(
                "unexpected restore date: database restored {} but identity last updated {}",
                live.restored, self.last_updated
            ));
        }

        reasons
    }
}
