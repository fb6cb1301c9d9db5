#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;
use usage_counter_core::crypto::{from_transport, to_transport};
use usage_counter_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CounterAction, CounterChangeRecord, CounterConfig,
    CounterError, CounterId, CounterOperation, DatabaseFacts, DatabaseIdentity, LedgerCheck, LedgerRow,
    SecureCounter, SecurityContext, SqlParam, UpdateCode, UpdateCodeSummary,
};

const COUNTER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_COUNTERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS database_catalog (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  server_name TEXT NOT NULL,
  database_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  restored_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS database_identity (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  identity_blob BLOB NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_database_identity_no_delete
BEFORE DELETE ON database_identity
BEGIN
  SELECT RAISE(FAIL, 'database_identity is never deleted');
END;

CREATE TABLE IF NOT EXISTS counters (
  counter_id INTEGER PRIMARY KEY CHECK (counter_id BETWEEN 0 AND 1023),
  name TEXT,
  alert_level INTEGER,
  alert_multiple INTEGER CHECK (alert_multiple > 0 OR alert_multiple IS NULL),
  value_blob BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS counter_changes (
  change_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  counter_id INTEGER NOT NULL CHECK (counter_id BETWEEN 0 AND 1023),
  to_value INTEGER NOT NULL,
  from_value INTEGER NOT NULL,
  updated_time TEXT NOT NULL,
  updated_by_session_id TEXT,
  min_document_count INTEGER NOT NULL,
  hash_value INTEGER NOT NULL,
  comment TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_counter_changes_no_update
BEFORE UPDATE ON counter_changes
BEGIN
  SELECT RAISE(FAIL, 'counter_changes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_counter_changes_no_delete
BEFORE DELETE ON counter_changes
BEGIN
  SELECT RAISE(FAIL, 'counter_changes is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_counter_changes_counter_seq
  ON counter_changes(counter_id, change_seq);

CREATE TABLE IF NOT EXISTS applied_update_codes (
  fingerprint TEXT PRIMARY KEY,
  target_database_id TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  issued_by_user TEXT NOT NULL,
  issued_from_machine TEXT NOT NULL,
  operation_count INTEGER NOT NULL,
  applied_at TEXT NOT NULL
);
";

pub struct SqliteCounterStore {
    conn: Connection,
    security: SecurityContext,
}

/// Caller-supplied facts about one pipeline increment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementContext {
    pub session_id: Option<Ulid>,
    /// Document count the caller has processed so far. Must never fall
    /// below the floor recorded by the previous change of the counter.
    pub min_document_count: i64,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterListing {
    pub counter_id: CounterId,
    pub name: String,
    pub value: Option<i64>,
    pub alert_level: Option<i64>,
    pub alert_multiple: Option<i64>,
    pub valid: bool,
    pub problem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredChange {
    pub change_seq: i64,
    pub record: CounterChangeRecord,
    pub hash_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub counter_id: Option<CounterId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub healthy: bool,
    pub identity_id: Option<Ulid>,
    pub counters_checked: usize,
    pub changes_checked: usize,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyReport {
    pub fingerprint: String,
    pub applied_at: String,
    pub identity_last_updated: String,
    pub summary: UpdateCodeSummary,
}

struct CounterRow {
    counter_id: CounterId,
    name: Option<String>,
    alert_level: Option<i64>,
    alert_multiple: Option<i64>,
    value_blob: Vec<u8>,
}

impl SqliteCounterStore {
    pub fn open(path: &Path, security: SecurityContext) -> Result<Self> {
        security
            .config
            .validate()
            .context("invalid counter configuration")?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(
            path = %path.display(),
            ledger_check = security.config.ledger_check.as_str(),
            validation_attempts = security.config.validation_attempts,
            "opened usage counter store"
        );
        Ok(Self { conn, security })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_COUNTERS_V1)
            .context("failed to apply usage counter schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COUNTER_MIGRATION_VERSION, format_rfc3339(now_utc())?],
            )
            .context("failed to register usage counter schema migration")?;

        Ok(())
    }

    /// Records the engine facts for a new database and seals its identity.
    pub fn provision(&mut self, server: &str, database: &str) -> Result<DatabaseIdentity> {
        if server.trim().is_empty() || database.trim().is_empty() {
            return Err(anyhow!("server and database names must be non-empty"));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start provisioning transaction")?;

        if read_catalog(&tx)?.is_some() {
            return Err(anyhow!("database is already provisioned"));
        }

        let now = now_utc();
        let facts = DatabaseFacts {
            server: server.to_string(),
            name: database.to_string(),
            created: now,
            restored: now,
        };
        tx.execute(
            "INSERT INTO database_catalog(singleton, server_name, database_name, created_at, restored_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                facts.server,
                facts.name,
                format_rfc3339(facts.created)?,
                format_rfc3339(facts.restored)?,
            ],
        )
        .context("failed to record database catalog facts")?;

        let identity = DatabaseIdentity::provision(&facts, now)?;
        write_identity(&tx, &identity, &self.security)?;
        tx.commit()
            .context("failed to commit provisioning transaction")?;

        info!(
            identity_id = %identity.id,
            server = %identity.server,
            database = %identity.name,
            "provisioned usage counter database"
        );
        Ok(identity)
    }

    pub fn live_facts(&self) -> Result<DatabaseFacts> {
        read_catalog(&self.conn)?.ok_or_else(|| anyhow!("database is not provisioned"))
    }

    /// Marks the database as restored from a backup at `at`, as the engine
    /// would after a restore.
    pub fn record_restore(&self, at: OffsetDateTime) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE database_catalog SET restored_at = ?1 WHERE singleton = 1",
                params![format_rfc3339(at)?],
            )
            .context("failed to record restore date")?;
        if updated == 0 {
            return Err(anyhow!("database is not provisioned"));
        }

        warn!(restored_at = %format_rfc3339(at)?, "database restore recorded");
        Ok(())
    }

    /// Stored identity without checking it against the live facts.
    pub fn load_identity(&self) -> Result<DatabaseIdentity> {
        load_identity(&self.conn, &self.security)
    }

    pub fn check_identity(&self) -> Result<DatabaseIdentity> {
        checked_identity(&self.conn, &self.security)
    }

    /// Base64 of the sealed identity, as sent to the vendor when
    /// requesting an update code.
    pub fn export_identity(&self) -> Result<String> {
        let blob = read_identity_blob(&self.conn)?
            .ok_or_else(|| anyhow!("database identity is missing"))?;
        Ok(to_transport(&blob))
    }

    pub fn list_counters(&self) -> Result<Vec<CounterListing>> {
        let identity = load_identity(&self.conn, &self.security)?;
        let mut listings = Vec::new();

        for row in read_counter_rows(&self.conn)? {
            let counter_id = row.counter_id;
            let stored_name = row.name.clone();
            let alert_level = row.alert_level;
            let alert_multiple = row.alert_multiple;

            let listing = match checked_counter(&self.conn, row, &identity, &self.security) {
                Ok((counter, _)) => CounterListing {
                    counter_id,
                    name: counter.display_name(),
                    value: Some(counter.value),
                    alert_level,
                    alert_multiple,
                    valid: true,
                    problem: None,
                },
                Err(err) => CounterListing {
                    counter_id,
                    name: stored_name.unwrap_or_else(|| format!("Counter {counter_id}")),
                    value: None,
                    alert_level,
                    alert_multiple,
                    valid: false,
                    problem: Some(err.to_string()),
                },
            };
            listings.push(listing);
        }

        Ok(listings)
    }

    /// Validated read of one counter.
    pub fn get_counter(&self, counter_id: CounterId) -> Result<Option<SecureCounter>> {
        let identity = checked_identity(&self.conn, &self.security)?;
        let Some(row) = read_counter_row(&self.conn, counter_id)? else {
            return Ok(None);
        };
        let (counter, _) = checked_counter(&self.conn, row, &identity, &self.security)?;
        Ok(Some(counter))
    }

    /// Alert thresholds are stored beside the sealed value and never gate
    /// validation. Like every counter write, this refreshes the identity.
    pub fn set_alerts(
        &mut self,
        counter_id: CounterId,
        alert_level: Option<i64>,
        alert_multiple: Option<i64>,
    ) -> Result<()> {
        if alert_multiple.is_some_and(|multiple| multiple <= 0) {
            return Err(anyhow!("alert_multiple must be positive"));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start alert update transaction")?;

        let identity = checked_identity(&tx, &self.security)?;
        let row = read_counter_row(&tx, counter_id)?
            .ok_or_else(|| anyhow!("counter {counter_id} does not exist"))?;
        let (counter, _) = checked_counter(&tx, row, &identity, &self.security)?;
        write_counter(
            &tx,
            &counter.with_alerts(alert_level, alert_multiple),
            &identity,
            &self.security,
        )?;

        let refreshed = identity.touched(now_utc())?;
        reseal_under(&tx, &identity, &refreshed, &self.security)?;
        tx.commit()
            .context("failed to commit alert update transaction")?;

        debug!(counter_id = %counter_id, ?alert_level, ?alert_multiple, "counter alerts updated");
        Ok(())
    }

    /// Adds `by` to a counter in one immediate transaction: validate, write,
    /// append the change record, refresh the identity and reseal every
    /// counter. Standard counters are created on first use.
    pub fn increment_counter(
        &mut self,
        counter_id: CounterId,
        by: i64,
        context: &IncrementContext,
    ) -> Result<CounterChangeRecord> {
        if by <= 0 {
            return Err(CounterError::Validation {
                reason: "counter.invalid_increment".to_string(),
                detail: format!("increment for counter {counter_id} must be positive, got {by}"),
            }
            .into());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start increment transaction")?;

        let identity = checked_identity(&tx, &self.security)?;
        let current = match read_counter_row(&tx, counter_id)? {
            Some(row) => checked_counter(&tx, row, &identity, &self.security)?.0,
            None if counter_id.is_custom() => {
                return Err(CounterError::Validation {
                    reason: "counter.not_found".to_string(),
                    detail: format!("custom counter {counter_id} must be created by an update code"),
                }
                .into());
            }
            None => SecureCounter::new(counter_id, None, 0)?,
        };

        // Ledger rows outlive a deleted counter, so the floor does too.
        if let Some(latest) = latest_change(&tx, counter_id)? {
            if context.min_document_count < latest.min_document_count {
                return Err(CounterError::Replay(format!(
                    "counter {counter_id} document count {} is below recorded floor {}",
                    context.min_document_count, latest.min_document_count
                ))
                .into());
            }
        }

        let next_value = current.value.checked_add(by).ok_or_else(|| CounterError::Validation {
            reason: "counter.overflow".to_string(),
            detail: format!("counter {counter_id} cannot grow past {}", current.value),
        })?;
        let next = SecureCounter::new(counter_id, current.name.clone(), next_value)?
            .with_alerts(current.alert_level, current.alert_multiple);

        let now = now_utc();
        write_counter(&tx, &next, &identity, &self.security)?;
        let record = CounterChangeRecord::new(
            counter_id,
            current.value,
            next_value,
            now,
            context.session_id,
            context.min_document_count,
            context.comment.clone(),
        );
        insert_change(&tx, &record)?;

        let refreshed = identity.touched(now)?;
        reseal_under(&tx, &identity, &refreshed, &self.security)?;
        tx.commit()
            .context("failed to commit increment transaction")?;

        if alert_crossed(current.value, next_value, next.alert_level, next.alert_multiple) {
            warn!(
                counter_id = %counter_id,
                value = next_value,
                "usage counter reached its alert threshold"
            );
        }
        debug!(counter_id = %counter_id, from = current.value, to = next_value, "counter incremented");
        Ok(record)
    }

    pub fn latest_change(&self, counter_id: CounterId) -> Result<Option<CounterChangeRecord>> {
        latest_change(&self.conn, counter_id)
    }

    /// Newest first. Rows that fail their hash are returned and flagged.
    pub fn list_changes(
        &self,
        counter_id: Option<CounterId>,
        limit: usize,
    ) -> Result<Vec<StoredChange>> {
        let limit = i64::try_from(limit).context("change limit is too large")?;
        let mut stmt = self.conn.prepare(
            "SELECT change_seq, counter_id, to_value, from_value, updated_time,
                    updated_by_session_id, min_document_count, hash_value, comment
             FROM counter_changes
             WHERE ?1 IS NULL OR counter_id = ?1
             ORDER BY change_seq DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![counter_id.map(|id| i64::from(id.get())), limit],
            parse_change_row,
        )?;

        let mut changes = Vec::new();
        for (change_seq, row) in collect_rows(rows)? {
            let record = CounterChangeRecord::load(row, false)
                .with_context(|| format!("failed to decode change record {change_seq}"))?;
            changes.push(StoredChange {
                change_seq,
                hash_valid: record.compute_hash() == record.record_hash,
                record,
            });
        }
        Ok(changes)
    }

    /// Read-only pass over identity, counters and ledger. A failing counter
    /// is re-read up to `validation_attempts` times before it is reported.
    pub fn validate_all(&self) -> Result<ValidationReport> {
        let mut issues = Vec::new();
        let facts = self.live_facts()?;

        let identity = match load_identity(&self.conn, &self.security) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "database identity could not be read");
                issues.push(ValidationIssue {
                    code: "identity.unreadable".to_string(),
                    severity: IssueSeverity::Error,
                    counter_id: None,
                    message: err.to_string(),
                });
                return Ok(ValidationReport {
                    healthy: false,
                    identity_id: None,
                    counters_checked: 0,
                    changes_checked: 0,
                    issues,
                });
            }
        };

        if identity.check_valid(&facts).is_err() {
            for reason in identity.explain_invalid(&facts) {
                warn!(identity_id = %identity.id, %reason, "database identity mismatch");
                issues.push(ValidationIssue {
                    code: "identity.mismatch".to_string(),
                    severity: IssueSeverity::Error,
                    counter_id: None,
                    message: reason,
                });
            }
        }

        let counter_ids: Vec<CounterId> = read_counter_rows(&self.conn)?
            .into_iter()
            .map(|row| row.counter_id)
            .collect();
        for counter_id in &counter_ids {
            if let Some(issue) = self.check_counter_with_retries(*counter_id) {
                issues.push(issue);
            } else if self.security.config.ledger_check == LedgerCheck::WhenPresent
                && latest_change(&self.conn, *counter_id)?.is_none()
            {
                issues.push(ValidationIssue {
                    code: "counter.ledger_missing".to_string(),
                    severity: IssueSeverity::Warning,
                    counter_id: Some(*counter_id),
                    message: format!("counter {counter_id} has no change record"),
                });
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT change_seq, counter_id, to_value, from_value, updated_time,
                    updated_by_session_id, min_document_count, hash_value, comment
             FROM counter_changes
             ORDER BY change_seq ASC",
        )?;
        let rows = collect_rows(stmt.query_map([], parse_change_row)?)?;
        let changes_checked = rows.len();
        for (change_seq, row) in rows {
            let counter_id = CounterId::try_from(row.counter_id).ok();
            if let Err(err) = CounterChangeRecord::load(row, true) {
                warn!(change_seq, error = %err, "change record failed validation");
                issues.push(ValidationIssue {
                    code: format!("ledger.{}", err.reason_code()),
                    severity: IssueSeverity::Error,
                    counter_id,
                    message: format!("change {change_seq}: {err}"),
                });
            }
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Error);
        Ok(ValidationReport {
            healthy,
            identity_id: Some(identity.id),
            counters_checked: counter_ids.len(),
            changes_checked,
            issues,
        })
    }

    /// Decodes, checks and applies a base64 update code as one transaction.
    pub fn apply_update_code(
        &mut self,
        code_text: &str,
        session_id: Option<Ulid>,
    ) -> Result<ApplyReport> {
        let raw = from_transport(code_text)?;
        let code = UpdateCode::decode(&raw, &self.security.secret)?;
        let fingerprint = hex::encode(Sha256::digest(&raw));

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update code transaction")?;

        let previously_applied: Option<String> = tx
            .query_row(
                "SELECT applied_at FROM applied_update_codes WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query applied update codes")?;
        if let Some(applied_at) = previously_applied {
            return Err(CounterError::Replay(format!(
                "update code {} was already applied at {applied_at}",
                short_fingerprint(&fingerprint)
            ))
            .into());
        }

        let facts = read_catalog(&tx)?.ok_or_else(|| anyhow!("database is not provisioned"))?;
        let stored = load_identity(&tx, &self.security)?;
        if let Err(err) = code.target_identity.check_valid(&facts) {
            return Err(CounterError::Replay(format!(
                "update code does not target this database: {err}"
            ))
            .into());
        }
        if code.target_identity.id != stored.id {
            return Err(CounterError::Replay(format!(
                "update code targets database {} but this database is {}",
                code.target_identity.id, stored.id
            ))
            .into());
        }
        stored.check_code_unspent(code.generated_at)?;

        let now = now_utc();
        let comment = format!(
            "applied from update code {} issued by {} on {}",
            short_fingerprint(&fingerprint),
            code.issued_by_user,
            code.issued_from_machine
        );
        for (index, operation) in code.operations.iter().enumerate() {
            apply_operation(&tx, operation, &stored, &self.security, now, session_id, &comment)
                .map_err(|err| CounterError::Operation {
                    index,
                    counter_id: operation.counter_id.get(),
                    detail: format!("{err:#}"),
                })?;
        }

        let applied_at = format_rfc3339(now)?;
        tx.execute(
            "INSERT INTO applied_update_codes(
                fingerprint, target_database_id, generated_at, issued_by_user,
                issued_from_machine, operation_count, applied_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fingerprint,
                code.target_identity.id.to_string(),
                format_rfc3339(code.generated_at)?,
                code.issued_by_user,
                code.issued_from_machine,
                code.operation_count()?,
                applied_at,
            ],
        )
        .context("failed to record applied update code")?;

        // Re-certify against the live facts; this is how a restored
        // database becomes writable again.
        let recertified = DatabaseIdentity {
            created: facts.created,
            restored: facts.restored,
            code_watermark: code.generated_at,
            ..stored.clone()
        }
        .touched(now)?;
        reseal_under(&tx, &stored, &recertified, &self.security)?;
        tx.commit()
            .context("failed to commit update code transaction")?;

        info!(
            fingerprint = %short_fingerprint(&fingerprint),
            format = code.format.as_str(),
            operations = code.operations.len(),
            issued_by = %code.issued_by_user,
            "applied update code"
        );
        Ok(ApplyReport {
            fingerprint,
            applied_at,
            identity_last_updated: format_rfc3339(recertified.last_updated)?,
            summary: code.summary()?,
        })
    }

    fn check_counter_with_retries(&self, counter_id: CounterId) -> Option<ValidationIssue> {
        retry_counter_check(counter_id, &self.security.config, || {
            self.check_counter_once(counter_id)
        })
    }

    fn check_counter_once(&self, counter_id: CounterId) -> Result<()> {
        let identity = load_identity(&self.conn, &self.security)?;
        match read_counter_row(&self.conn, counter_id)? {
            Some(row) => checked_counter(&self.conn, row, &identity, &self.security).map(|_| ()),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Runs `check` until it passes or the configured attempts are used up.
/// Only the final failure becomes an issue.
fn retry_counter_check(
    counter_id: CounterId,
    config: &CounterConfig,
    mut check: impl FnMut() -> Result<()>,
) -> Option<ValidationIssue> {
    let attempts = config.validation_attempts.max(1);
    let delay = Duration::from_millis(config.retry_delay_ms);

    let mut attempt = 1;
    loop {
        let Err(err) = check() else {
            if attempt > 1 {
                debug!(counter_id = %counter_id, attempt, "counter passed on retry");
            }
            return None;
        };

        if attempt < attempts {
            warn!(counter_id = %counter_id, attempt, error = %err, "counter check failed, retrying");
            thread::sleep(delay);
            attempt += 1;
            continue;
        }

        warn!(counter_id = %counter_id, error = %err, "counter failed validation");
        let code = err
            .downcast_ref::<CounterError>()
            .map_or("counter.unreadable", CounterError::reason_code)
            .to_string();
        return Some(ValidationIssue {
            code,
            severity: IssueSeverity::Error,
            counter_id: Some(counter_id),
            message: err.to_string(),
        });
    }
}

fn apply_operation(
    conn: &Connection,
    operation: &CounterOperation,
    identity: &DatabaseIdentity,
    security: &SecurityContext,
    now: OffsetDateTime,
    session_id: Option<Ulid>,
    comment: &str,
) -> Result<()> {
    let counter_id = operation.counter_id;
    let existing = read_counter_row(conn, counter_id)?;

    match (operation.action, existing) {
        (CounterAction::Create { .. }, Some(_)) => {
            Err(anyhow!("counter {counter_id} already exists"))
        }
        (CounterAction::Set { .. } | CounterAction::Delete, None) => {
            Err(anyhow!("counter {counter_id} does not exist"))
        }
        (CounterAction::Create { value }, None) => {
            let counter = SecureCounter::new(counter_id, operation.counter_name.clone(), value)?;
            write_counter(conn, &counter, identity, security)?;
            let floor = latest_change(conn, counter_id)?.map_or(0, |latest| latest.min_document_count);
            let record =
                CounterChangeRecord::new(counter_id, 0, value, now, session_id, floor, comment);
            insert_change(conn, &record)
        }
        (CounterAction::Set { value }, Some(row)) => {
            let alert_level = row.alert_level;
            let alert_multiple = row.alert_multiple;
            let current = SecureCounter::load_from(
                counter_id,
                row.name,
                &row.value_blob,
                &security.secret,
            )?;
            let name = operation.counter_name.clone().or(current.name);
            let counter = SecureCounter::new(counter_id, name, value)?
                .with_alerts(alert_level, alert_multiple);
            write_counter(conn, &counter, identity, security)?;
            let floor = latest_change(conn, counter_id)?.map_or(0, |latest| latest.min_document_count);
            let record = CounterChangeRecord::new(
                counter_id,
                current.value,
                value,
                now,
                session_id,
                floor,
                comment,
            );
            insert_change(conn, &record)
        }
        (CounterAction::Delete, Some(_)) => {
            conn.execute(
                "DELETE FROM counters WHERE counter_id = ?1",
                params![i64::from(counter_id.get())],
            )
            .with_context(|| format!("failed to delete counter {counter_id}"))?;
            Ok(())
        }
    }
}

fn read_catalog(conn: &Connection) -> Result<Option<DatabaseFacts>> {
    let row = conn
        .query_row(
            "SELECT server_name, database_name, created_at, restored_at
             FROM database_catalog
             WHERE singleton = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to read database catalog")?;

    let Some((server, name, created, restored)) = row else {
        return Ok(None);
    };
    Ok(Some(DatabaseFacts {
        server,
        name,
        created: parse_rfc3339_utc(&created).context("invalid catalog created_at")?,
        restored: parse_rfc3339_utc(&restored).context("invalid catalog restored_at")?,
    }))
}

fn read_identity_blob(conn: &Connection) -> Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT identity_blob FROM database_identity WHERE singleton = 1",
        [],
        |row| row.get(0),
    )
    .optional()
    .context("failed to read database identity")
}

fn load_identity(conn: &Connection, security: &SecurityContext) -> Result<DatabaseIdentity> {
    let blob = read_identity_blob(conn)?.ok_or_else(|| anyhow!("database identity is missing"))?;
    Ok(DatabaseIdentity::deserialize_encrypted(&blob, &security.secret)?)
}

fn checked_identity(conn: &Connection, security: &SecurityContext) -> Result<DatabaseIdentity> {
    let facts = read_catalog(conn)?.ok_or_else(|| anyhow!("database is not provisioned"))?;
    let identity = load_identity(conn, security)?;
    identity.check_valid(&facts)?;
    Ok(identity)
}

fn write_identity(
    conn: &Connection,
    identity: &DatabaseIdentity,
    security: &SecurityContext,
) -> Result<()> {
    conn.execute(
        "INSERT INTO database_identity(singleton, identity_blob) VALUES (1, ?1)
         ON CONFLICT(singleton) DO UPDATE SET identity_blob = excluded.identity_blob",
        params![identity.serialize_encrypted(&security.secret)?],
    )
    .context("failed to write database identity")?;
    Ok(())
}

fn read_counter_rows(conn: &Connection) -> Result<Vec<CounterRow>> {
    let mut stmt = conn.prepare(
        "SELECT counter_id, name, alert_level, alert_multiple, value_blob
         FROM counters
         ORDER BY counter_id ASC",
    )?;
    let rows = collect_rows(stmt.query_map([], parse_counter_row)?)?;
    rows.into_iter().map(into_counter_row).collect()
}

fn read_counter_row(conn: &Connection, counter_id: CounterId) -> Result<Option<CounterRow>> {
    conn.query_row(
        "SELECT counter_id, name, alert_level, alert_multiple, value_blob
         FROM counters
         WHERE counter_id = ?1",
        params![i64::from(counter_id.get())],
        parse_counter_row,
    )
    .optional()
    .with_context(|| format!("failed to read counter {counter_id}"))?
    .map(into_counter_row)
    .transpose()
}

type RawCounterRow = (i64, Option<String>, Option<i64>, Option<i64>, Vec<u8>);

fn parse_counter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCounterRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_counter_row(raw: RawCounterRow) -> Result<CounterRow> {
    let (counter_id, name, alert_level, alert_multiple, value_blob) = raw;
    Ok(CounterRow {
        counter_id: CounterId::try_from(counter_id)?,
        name,
        alert_level,
        alert_multiple,
        value_blob,
    })
}

/// Loads a counter row and validates it against `identity` and its latest
/// change record.
fn checked_counter(
    conn: &Connection,
    row: CounterRow,
    identity: &DatabaseIdentity,
    security: &SecurityContext,
) -> Result<(SecureCounter, Option<CounterChangeRecord>)> {
    let counter_id = row.counter_id;
    let counter = SecureCounter::load_from(counter_id, row.name, &row.value_blob, &security.secret)?
        .with_alerts(row.alert_level, row.alert_multiple);
    let latest = latest_change(conn, counter_id)?;

    if latest.is_none() && security.config.ledger_check == LedgerCheck::Required {
        return Err(CounterError::Validation {
            reason: "counter.ledger_missing".to_string(),
            detail: format!("counter {counter_id} has no change record"),
        }
        .into());
    }

    counter.validate(identity, latest.as_ref())?;
    Ok((counter, latest))
}

fn write_counter(
    conn: &Connection,
    counter: &SecureCounter,
    identity: &DatabaseIdentity,
    security: &SecurityContext,
) -> Result<()> {
    conn.execute(
        "INSERT INTO counters(counter_id, name, alert_level, alert_multiple, value_blob)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(counter_id) DO UPDATE SET
           name = excluded.name,
           alert_level = excluded.alert_level,
           alert_multiple = excluded.alert_multiple,
           value_blob = excluded.value_blob",
        params![
            i64::from(counter.counter_id.get()),
            counter.name,
            counter.alert_level,
            counter.alert_multiple,
            counter.encrypted_value(identity, &security.secret)?,
        ],
    )
    .with_context(|| format!("failed to write counter {}", counter.counter_id))?;
    Ok(())
}

/// Stores `next` as the identity and reseals every counter under it. Each
/// counter must validate against `previous` first.
fn reseal_under(
    conn: &Connection,
    previous: &DatabaseIdentity,
    next: &DatabaseIdentity,
    security: &SecurityContext,
) -> Result<()> {
    let rows = read_counter_rows(conn)?;
    let resealed = rows.len();
    for row in rows {
        let (counter, _) = checked_counter(conn, row, previous, security)?;
        write_counter(conn, &counter, next, security)?;
    }
    write_identity(conn, next, security)?;

    debug!(identity_id = %next.id, resealed, "counters resealed under refreshed identity");
    Ok(())
}

fn latest_change(conn: &Connection, counter_id: CounterId) -> Result<Option<CounterChangeRecord>> {
    let row = conn
        .query_row(
            "SELECT change_seq, counter_id, to_value, from_value, updated_time,
                    updated_by_session_id, min_document_count, hash_value, comment
             FROM counter_changes
             WHERE counter_id = ?1
             ORDER BY change_seq DESC
             LIMIT 1",
            params![i64::from(counter_id.get())],
            parse_change_row,
        )
        .optional()
        .with_context(|| format!("failed to read latest change of counter {counter_id}"))?;

    row.map(|(_, row)| CounterChangeRecord::load(row, true).map_err(anyhow::Error::from))
        .transpose()
}

fn insert_change(conn: &Connection, record: &CounterChangeRecord) -> Result<()> {
    let statement = record.to_insert_statement()?;
    let values: Vec<SqlValue> = statement.params.into_iter().map(sql_value).collect();
    conn.execute(statement.sql, params_from_iter(values))
        .with_context(|| format!("failed to append change record for counter {}", record.counter_id))?;
    Ok(())
}

fn sql_value(param: SqlParam) -> SqlValue {
    match param {
        SqlParam::Integer(value) => SqlValue::Integer(value),
        SqlParam::Text(value) => SqlValue::Text(value),
        SqlParam::Null => SqlValue::Null,
    }
}

fn parse_change_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, LedgerRow)> {
    Ok((
        row.get(0)?,
        LedgerRow {
            counter_id: row.get(1)?,
            to_value: row.get(2)?,
            from_value: row.get(3)?,
            updated_time: row.get(4)?,
            updated_by_session_id: row.get(5)?,
            min_document_count: row.get(6)?,
            hash_value: row.get(7)?,
            comment: row.get(8)?,
        },
    ))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn alert_crossed(from: i64, to: i64, level: Option<i64>, multiple: Option<i64>) -> bool {
    let level_crossed = level.is_some_and(|level| from < level && to >= level);
    let multiple_crossed = multiple
        .filter(|multiple| *multiple > 0)
        .is_some_and(|multiple| from / multiple != to / multiple);
    level_crossed || multiple_crossed
}

fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;
    use usage_counter_core::{CodeFormat, SharedSecret};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_core<T>(result: std::result::Result<T, CounterError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_secret() -> SharedSecret {
        must_core(SharedSecret::from_material(b"fixture shared secret material"))
    }

    fn fixture_security(config: CounterConfig) -> SecurityContext {
        SecurityContext::new(fixture_secret(), config)
    }

    fn fast_config() -> CounterConfig {
        CounterConfig {
            retry_delay_ms: 1,
            ..CounterConfig::default()
        }
    }

    fn open_store(path: &Path) -> SqliteCounterStore {
        let store = must(SqliteCounterStore::open(path, fixture_security(fast_config())));
        must(store.migrate());
        store
    }

    fn fixture_store() -> SqliteCounterStore {
        let mut store = open_store(Path::new(":memory:"));
        must(store.provision("SQLHOST", "CustomerDB"));
        store
    }

    fn id(raw: u16) -> CounterId {
        must_core(CounterId::new(raw))
    }

    fn context(min_document_count: i64) -> IncrementContext {
        IncrementContext {
            session_id: Some(Ulid::new()),
            min_document_count,
            comment: String::new(),
        }
    }

    fn counter_error(err: &anyhow::Error) -> &CounterError {
        match err.downcast_ref::<CounterError>() {
            Some(value) => value,
            None => panic!("expected a CounterError, got {err:#}"),
        }
    }

    fn value_of(store: &SqliteCounterStore, counter_id: CounterId) -> i64 {
        match must(store.get_counter(counter_id)) {
            Some(counter) => counter.value,
            None => panic!("counter {counter_id} missing"),
        }
    }

    fn issue_code(
        store: &SqliteCounterStore,
        generated_at: OffsetDateTime,
        operations: Vec<CounterOperation>,
    ) -> String {
        let target = must(store.load_identity());
        let code = must_core(UpdateCode::issue(
            &target,
            generated_at,
            "support.agent",
            "VENDOR-WS-07",
            CodeFormat::Current,
            operations,
        ));
        must_core(code.to_transport(&fixture_secret()))
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("usage-counter-{label}-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "database_catalog",
            "database_identity",
            "counters",
            "counter_changes",
            "applied_update_codes",
            "schema_migrations",
        ] {
            let exists = must(
                store
                    .connection()
                    .query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        params![table],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(anyhow::Error::from),
            );
            assert_eq!(exists, 1, "missing table {table}");
        }

        let trigger_count = must(
            store
                .connection()
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master
                     WHERE type = 'trigger'
                       AND name IN ('trg_counter_changes_no_update', 'trg_counter_changes_no_delete')",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(anyhow::Error::from),
        );
        assert_eq!(trigger_count, 2);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_counters() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 5, &context(5)));
        must(store.migrate());
        assert_eq!(value_of(&store, id(3)), 5);
    }

    #[test]
    fn provisioning_twice_is_rejected() {
        let mut store = fixture_store();
        assert!(store.provision("SQLHOST", "CustomerDB").is_err());
        assert_eq!(must(store.check_identity()).server, "SQLHOST");
    }

    #[test]
    fn increment_creates_standard_counter_and_appends_ledger() {
        let mut store = fixture_store();
        let first = must(store.increment_counter(id(3), 100, &context(10)));
        assert_eq!(first.from_value, 0);
        assert_eq!(first.to_value, 100);

        let second = must(store.increment_counter(id(3), 1, &context(11)));
        assert_eq!(second.from_value, 100);
        assert_eq!(value_of(&store, id(3)), 101);

        let changes = must(store.list_changes(Some(id(3)), 10));
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|change| change.hash_valid));
        assert_eq!(changes[0].record.to_value, 101);

        let latest = must(store.latest_change(id(3)));
        assert_eq!(latest.map(|record| record.to_value), Some(101));
    }

    #[test]
    fn increment_refreshes_identity_and_keeps_other_counters_valid() {
        let mut store = fixture_store();
        must(store.increment_counter(id(1), 7, &context(1)));
        let before = must(store.load_identity());

        must(store.increment_counter(id(2), 3, &context(1)));
        let after = must(store.load_identity());
        assert!(after.last_updated > before.last_updated);
        assert_eq!(after.id, before.id);

        assert_eq!(value_of(&store, id(1)), 7);
        assert!(must(store.validate_all()).healthy);
    }

    #[test]
    fn custom_counters_are_not_created_by_increments() {
        let mut store = fixture_store();
        let err = match store.increment_counter(id(150), 1, &context(1)) {
            Ok(_) => panic!("custom counter increment should fail"),
            Err(err) => err,
        };
        assert_eq!(counter_error(&err).reason_code(), "counter.not_found");
    }

    #[test]
    fn non_positive_increments_are_rejected() {
        let mut store = fixture_store();
        assert!(store.increment_counter(id(3), 0, &context(1)).is_err());
        assert!(store.increment_counter(id(3), -4, &context(1)).is_err());
        assert!(must(store.latest_change(id(3))).is_none());
    }

    #[test]
    fn regressed_document_count_is_a_replay() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(50)));
        let err = match store.increment_counter(id(3), 1, &context(49)) {
            Ok(_) => panic!("regressed floor should fail"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Replay(_)));
        assert_eq!(value_of(&store, id(3)), 1);
    }

    #[test]
    fn deleted_counter_keeps_its_document_count_floor() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 5, &context(1_000)));
        let code = issue_code(
            &store,
            now_utc(),
            vec![CounterOperation::new(id(3), None, CounterAction::Delete)],
        );
        must(store.apply_update_code(&code, None));
        assert!(must(store.get_counter(id(3))).is_none());

        let err = match store.increment_counter(id(3), 1, &context(1)) {
            Ok(_) => panic!("regressed floor after delete should fail"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Replay(_)));
        assert!(must(store.get_counter(id(3))).is_none());

        let record = must(store.increment_counter(id(3), 1, &context(1_000)));
        assert_eq!((record.from_value, record.to_value), (0, 1));
        assert!(must(store.validate_all()).healthy);
    }

    #[test]
    fn ledger_rows_are_append_only() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(1)));
        let update = store
            .connection()
            .execute("UPDATE counter_changes SET to_value = 999", []);
        assert!(update.is_err());
        let delete = store.connection().execute("DELETE FROM counter_changes", []);
        assert!(delete.is_err());
    }

    #[test]
    fn swapped_counter_blobs_are_reported_as_corruption() {
        let mut store = fixture_store();
        must(store.increment_counter(id(1), 5, &context(1)));
        must(store.increment_counter(id(2), 500, &context(1)));

        let swap = store.connection().execute_batch(
            "UPDATE counters SET value_blob = (SELECT value_blob FROM counters WHERE counter_id = 2)
             WHERE counter_id = 1;",
        );
        if let Err(err) = swap {
            panic!("failed to tamper: {err}");
        }

        let report = must(store.validate_all());
        assert!(!report.healthy);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.code == "corruption" && issue.counter_id == Some(id(1))));

        let listings = must(store.list_counters());
        assert!(!listings[0].valid);
        assert!(listings[1].valid);
        assert!(store.increment_counter(id(2), 1, &context(1)).is_err());
    }

    #[test]
    fn counter_copied_from_another_database_fails_composite_check() {
        let mut source = fixture_store();
        must(source.increment_counter(id(3), 9_999, &context(1)));
        let mut target = fixture_store();
        must(target.increment_counter(id(3), 1, &context(1)));

        let blob: Vec<u8> = must(
            source
                .connection()
                .query_row("SELECT value_blob FROM counters WHERE counter_id = 3", [], |row| {
                    row.get(0)
                })
                .map_err(anyhow::Error::from),
        );
        if let Err(err) = target.connection().execute(
            "UPDATE counters SET value_blob = ?1 WHERE counter_id = 3",
            params![blob],
        ) {
            panic!("failed to paste blob: {err}");
        }

        let report = must(target.validate_all());
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.code == "counter.composite_mismatch"));
    }

    #[test]
    fn edited_ledger_row_is_reported() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 10, &context(1)));
        if let Err(err) = store.connection().execute_batch(
            "DROP TRIGGER trg_counter_changes_no_update;
             UPDATE counter_changes SET min_document_count = 0;",
        ) {
            panic!("failed to tamper: {err}");
        }

        let report = must(store.validate_all());
        assert!(!report.healthy);
        assert!(report.issues.iter().any(|issue| issue.code == "ledger.corruption"));
        assert!(!must(store.list_changes(None, 5))[0].hash_valid);
    }

    #[test]
    fn when_present_mode_downgrades_missing_ledger_to_warning() {
        let path = temp_db_path("when-present");
        {
            let mut store = open_store(&path);
            must(store.provision("SQLHOST", "CustomerDB"));
            must(store.increment_counter(id(3), 4, &context(1)));
            if let Err(err) = store.connection().execute_batch(
                "DROP TRIGGER trg_counter_changes_no_delete;
                 DELETE FROM counter_changes;",
            ) {
                panic!("failed to clear ledger: {err}");
            }
            let report = must(store.validate_all());
            assert!(report
                .issues
                .iter()
                .any(|issue| issue.code == "counter.ledger_missing"
                    && issue.severity == IssueSeverity::Error));
        }

        let config = CounterConfig {
            ledger_check: LedgerCheck::WhenPresent,
            ..fast_config()
        };
        let store = must(SqliteCounterStore::open(&path, fixture_security(config)));
        let report = must(store.validate_all());
        assert!(report.healthy);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
        drop(store);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn restore_is_detected_and_blocks_writes_until_recertified() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 100, &context(1)));

        let restored_at = now_utc() + time::Duration::seconds(1);
        must(store.record_restore(restored_at));

        let err = match store.increment_counter(id(3), 1, &context(2)) {
            Ok(_) => panic!("increment after restore should fail"),
            Err(err) => err,
        };
        assert_eq!(counter_error(&err).reason_code(), "identity.mismatch");
        let report = must(store.validate_all());
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.message.starts_with("unexpected restore date")));

        let code = issue_code(
            &store,
            restored_at + time::Duration::seconds(1),
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 100 })],
        );
        must(store.apply_update_code(&code, None));

        must(store.increment_counter(id(3), 1, &context(2)));
        assert_eq!(value_of(&store, id(3)), 101);
        assert!(must(store.validate_all()).healthy);
    }

    #[test]
    fn update_code_operations_apply_in_order() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 10, &context(1)));
        must(store.increment_counter(id(4), 10, &context(1)));

        let code = issue_code(
            &store,
            now_utc(),
            vec![
                CounterOperation::new(
                    id(150),
                    Some("Scanned pages".to_string()),
                    CounterAction::Create { value: 5 },
                ),
                CounterOperation::new(id(3), None, CounterAction::Set { value: 0 }),
                CounterOperation::new(id(4), None, CounterAction::Delete),
            ],
        );
        let report = must(store.apply_update_code(&code, Some(Ulid::new())));
        assert_eq!(report.summary.operation_count, 3);
        assert_eq!(report.fingerprint.len(), 64);

        assert_eq!(value_of(&store, id(150)), 5);
        assert_eq!(value_of(&store, id(3)), 0);
        assert!(must(store.get_counter(id(4))).is_none());

        let latest = must(store.latest_change(id(3)));
        assert!(latest.is_some_and(|record| record.comment.starts_with("applied from update code")
            && record.from_value == 10
            && record.min_document_count == 1));
        assert!(must(store.validate_all()).healthy);

        must(store.increment_counter(id(150), 2, &context(0)));
        assert_eq!(value_of(&store, id(150)), 7);
    }

    #[test]
    fn failing_operation_rolls_back_the_whole_code() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 10, &context(1)));
        let identity_before = must(store.load_identity());

        let code = issue_code(
            &store,
            now_utc(),
            vec![
                CounterOperation::new(id(3), None, CounterAction::Set { value: 77 }),
                CounterOperation::new(id(151), Some("Missing".to_string()), CounterAction::Set { value: 1 }),
            ],
        );
        let err = match store.apply_update_code(&code, None) {
            Ok(_) => panic!("code with a missing counter should fail"),
            Err(err) => err,
        };
        assert!(matches!(
            counter_error(&err),
            CounterError::Operation { index: 1, counter_id: 151, .. }
        ));

        assert_eq!(value_of(&store, id(3)), 10);
        assert_eq!(must(store.load_identity()), identity_before);
        assert_eq!(must(store.list_changes(Some(id(3)), 10)).len(), 1);

        // The code was not consumed; a corrected one applies cleanly.
        let retry = issue_code(
            &store,
            now_utc(),
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 77 })],
        );
        must(store.apply_update_code(&retry, None));
        assert_eq!(value_of(&store, id(3)), 77);
    }

    #[test]
    fn create_of_existing_counter_fails() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(1)));
        let code = issue_code(
            &store,
            now_utc(),
            vec![CounterOperation::new(id(3), None, CounterAction::Create { value: 1 })],
        );
        let err = match store.apply_update_code(&code, None) {
            Ok(_) => panic!("duplicate create should fail"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Operation { index: 0, counter_id: 3, .. }));
    }

    #[test]
    fn reapplying_a_code_is_a_replay() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(1)));
        let code = issue_code(
            &store,
            now_utc(),
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 50 })],
        );
        must(store.apply_update_code(&code, None));
        must(store.increment_counter(id(3), 1, &context(1)));

        let err = match store.apply_update_code(&code, None) {
            Ok(_) => panic!("second application should fail"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Replay(_)));
        assert_eq!(value_of(&store, id(3)), 51);
    }

    #[test]
    fn code_stays_spent_after_its_fingerprint_row_is_deleted() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 10, &context(1)));
        let code = issue_code(
            &store,
            now_utc(),
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 0 })],
        );
        must(store.apply_update_code(&code, None));
        must(store.increment_counter(id(3), 500, &context(1)));

        must(
            store
                .connection()
                .execute("DELETE FROM applied_update_codes", [])
                .map_err(anyhow::Error::from),
        );
        let err = match store.apply_update_code(&code, None) {
            Ok(_) => panic!("spent code should stay spent"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Replay(_)));
        assert_eq!(value_of(&store, id(3)), 500);
        assert!(must(store.validate_all()).healthy);
    }

    #[test]
    fn older_code_is_spent_once_a_newer_one_applies() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 10, &context(1)));
        let issued_at = now_utc();
        let older = issue_code(
            &store,
            issued_at,
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 1 })],
        );
        let newer = issue_code(
            &store,
            issued_at + time::Duration::seconds(1),
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 2 })],
        );

        must(store.apply_update_code(&newer, None));
        assert_eq!(must(store.load_identity()).code_watermark, issued_at + time::Duration::seconds(1));
        let err = match store.apply_update_code(&older, None) {
            Ok(_) => panic!("older code should be spent"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Replay(_)));
        assert_eq!(value_of(&store, id(3)), 2);
    }

    #[test]
    fn code_for_another_database_is_rejected() {
        let other = fixture_store();
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(1)));

        let code = issue_code(
            &other,
            now_utc(),
            vec![CounterOperation::new(id(3), None, CounterAction::Set { value: 9 })],
        );
        let err = match store.apply_update_code(&code, None) {
            Ok(_) => panic!("foreign code should fail"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Replay(_)));
    }

    #[test]
    fn garbled_code_is_a_format_error() {
        let mut store = fixture_store();
        let err = match store.apply_update_code("bm90IGEgY29kZQ==", None) {
            Ok(_) => panic!("garbage should fail"),
            Err(err) => err,
        };
        assert!(matches!(counter_error(&err), CounterError::Format(_)));
    }

    #[test]
    fn exported_identity_decodes_with_the_shared_secret() {
        let store = fixture_store();
        let exported = must(store.export_identity());
        let blob = must_core(from_transport(&exported));
        let identity = must_core(DatabaseIdentity::deserialize_encrypted(&blob, &fixture_secret()));
        assert_eq!(identity, must(store.load_identity()));
    }

    #[test]
    fn alerts_are_stored_and_reported() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(1)));
        must(store.set_alerts(id(3), Some(10), Some(5)));
        assert!(store.set_alerts(id(4), Some(10), None).is_err());
        assert!(store.set_alerts(id(3), None, Some(0)).is_err());

        must(store.increment_counter(id(3), 20, &context(1)));
        let counter = match must(store.get_counter(id(3))) {
            Some(value) => value,
            None => panic!("counter missing"),
        };
        assert_eq!(counter.alert_level, Some(10));
        assert_eq!(counter.alert_multiple, Some(5));
        assert!(alert_crossed(1, 21, Some(10), None));
        assert!(!alert_crossed(11, 12, Some(10), Some(5)));
    }

    #[test]
    fn alert_update_refreshes_identity_and_reseals_counters() {
        let mut store = fixture_store();
        must(store.increment_counter(id(3), 1, &context(1)));
        must(store.increment_counter(id(4), 1, &context(1)));
        let before = must(store.load_identity());

        must(store.set_alerts(id(3), Some(10), None));

        let after = must(store.load_identity());
        assert!(after.last_updated > before.last_updated);
        assert_ne!(after.compute_hash(), before.compute_hash());
        assert!(must(store.validate_all()).healthy);
        assert_eq!(value_of(&store, id(4)), 1);
    }

    #[test]
    fn transient_counter_failure_is_retried_and_not_reported() {
        let mut store = fixture_store();
        must(store.increment_counter(id(1), 5, &context(1)));
        must(store.increment_counter(id(2), 500, &context(1)));

        let original: Vec<u8> = must(
            store
                .connection()
                .query_row("SELECT value_blob FROM counters WHERE counter_id = 1", [], |row| {
                    row.get(0)
                })
                .map_err(anyhow::Error::from),
        );
        must(
            store
                .connection()
                .execute_batch(
                    "UPDATE counters SET value_blob = (SELECT value_blob FROM counters WHERE counter_id = 2)
                     WHERE counter_id = 1;",
                )
                .map_err(anyhow::Error::from),
        );

        // A concurrent writer finishes between the first and second read.
        let calls = Cell::new(0_u32);
        let issue = retry_counter_check(id(1), &fast_config(), || {
            calls.set(calls.get() + 1);
            let outcome = store.check_counter_once(id(1));
            if calls.get() == 1 {
                must(
                    store
                        .connection()
                        .execute(
                            "UPDATE counters SET value_blob = ?1 WHERE counter_id = 1",
                            params![original],
                        )
                        .map_err(anyhow::Error::from),
                );
            }
            outcome
        });

        assert!(issue.is_none(), "transient failure was reported: {issue:?}");
        assert_eq!(calls.get(), 2);
        let report = must(store.validate_all());
        assert!(report.healthy);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn persistent_counter_failure_is_reported_after_every_attempt() {
        let calls = Cell::new(0_u32);
        let config = CounterConfig {
            validation_attempts: 4,
            ..fast_config()
        };
        let issue = retry_counter_check(id(3), &config, || {
            calls.set(calls.get() + 1);
            Err(CounterError::Validation {
                reason: "counter.ledger_mismatch".to_string(),
                detail: "41 != 42".to_string(),
            }
            .into())
        });

        assert_eq!(calls.get(), 4);
        let issue = match issue {
            Some(value) => value,
            None => panic!("persistent failure should be reported"),
        };
        assert_eq!(issue.code, "counter.ledger_mismatch");
        assert_eq!(issue.counter_id, Some(id(3)));
    }

    #[test]
    fn concurrent_increments_serialize() {
        let path = temp_db_path("concurrent");
        {
            let mut store = open_store(&path);
            must(store.provision("SQLHOST", "CustomerDB"));
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || -> Result<()> {
                    let mut store = SqliteCounterStore::open(&path, fixture_security(fast_config()))?;
                    for _ in 0..10 {
                        store.increment_counter(id(3), 1, &IncrementContext::default())?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            match worker.join() {
                Ok(result) => must(result),
                Err(err) => panic!("worker panicked: {err:?}"),
            }
        }

        let store = open_store(&path);
        assert_eq!(value_of(&store, id(3)), 40);
        assert_eq!(must(store.list_changes(Some(id(3)), 100)).len(), 40);
        assert!(must(store.validate_all()).healthy);
        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_ledger_tracks_every_increment(steps in prop::collection::vec((1u16..6, 1i64..1_000), 1..12)) {
            let mut store = fixture_store();
            let mut expected = std::collections::BTreeMap::new();
            for (raw_id, by) in &steps {
                must(store.increment_counter(id(*raw_id), *by, &context(0)));
                *expected.entry(*raw_id).or_insert(0_i64) += by;
            }

            for (raw_id, total) in &expected {
                prop_assert_eq!(value_of(&store, id(*raw_id)), *total);
            }
            prop_assert_eq!(must(store.list_changes(None, 100)).len(), steps.len());
            prop_assert!(must(store.validate_all()).healthy);
        }
    }
}
