//! Little-endian binary record encoding used inside sealed blobs.

use time::OffsetDateTime;
use ulid::Ulid;

use crate::CounterError;

#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ulid(&mut self, value: Ulid) -> &mut Self {
        self.buf.extend_from_slice(&u128::from(value).to_le_bytes());
        self
    }

    pub fn timestamp(&mut self, value: OffsetDateTime) -> &mut Self {
        self.buf
            .extend_from_slice(&value.unix_timestamp_nanos().to_le_bytes());
        self
    }

    /// Appends bytes that carry their own framing.
    pub fn raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Writes a `u16` length prefix followed by UTF-8 bytes.
    ///
    /// # Errors
    /// Returns [`CounterError::Format`] when the string exceeds 65535 bytes.
    pub fn string(&mut self, value: &str) -> Result<&mut Self, CounterError> {
        let len = u16::try_from(value.len()).map_err(|_| {
            CounterError::Format(format!("string field too long: {} bytes", value.len()))
        })?;
        self.u16(len);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a decrypted record. Every read is bounds-checked.
#[derive(Debug)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], CounterError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CounterError::Format(format!(
                    "record truncated reading {what}: need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], CounterError> {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn u8(&mut self, what: &str) -> Result<u8, CounterError> {
        Ok(self.array::<1>(what)?[0])
    }

    pub fn u16(&mut self, what: &str) -> Result<u16, CounterError> {
        Ok(u16::from_le_bytes(self.array(what)?))
    }

    pub fn i32(&mut self, what: &str) -> Result<i32, CounterError> {
        Ok(i32::from_le_bytes(self.array(what)?))
    }

    pub fn i64(&mut self, what: &str) -> Result<i64, CounterError> {
        Ok(i64::from_le_bytes(self.array(what)?))
    }

    pub fn u64(&mut self, what: &str) -> Result<u64, CounterError> {
        Ok(u64::from_le_bytes(self.array(what)?))
    }

    pub fn ulid(&mut self, what: &str) -> Result<Ulid, CounterError> {
        Ok(Ulid::from(u128::from_le_bytes(self.array(what)?)))
    }

    pub fn timestamp(&mut self, what: &str) -> Result<OffsetDateTime, CounterError> {
        let nanos = i128::from_le_bytes(self.array(what)?);
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|err| CounterError::Format(format!("invalid {what} timestamp: {err}")))
    }

    pub fn string(&mut self, what: &str) -> Result<String, CounterError> {
        let len = usize::from(self.u16(what)?);
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|err| CounterError::Format(format!("invalid UTF-8 in {what}: {err}")))
    }

    /// Fails when unread bytes remain.
    pub fn finish(self) -> Result<(), CounterError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CounterError::Format(format!(
                "{} trailing bytes after record",
                self.buf.len() - self.pos
            )))
        }
    }
}
