//! Administrator and vendor command surface for usage counters.
//!
//! Embedders call [`run_cli`] with a parsed [`Cli`]. Every command prints
//! JSON (or plain base64 for exported blobs and generated codes) on stdout;
//! diagnostics go through `tracing` on stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use ulid::Ulid;
use usage_counter_core::crypto::from_transport;
use usage_counter_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CodeFormat, CounterAction, CounterChangeRecord,
    CounterConfig, CounterId, CounterOperation, DatabaseIdentity, LedgerCheck, SecurityContext,
    SharedSecret, UpdateCode,
};
use usage_counter_store_sqlite::{IncrementContext, IssueSeverity, SqliteCounterStore, ValidationReport};

#[derive(Debug, Parser)]
#[command(name = "uc")]
#[command(about = "Usage counter administration CLI")]
pub struct Cli {
    #[arg(long, default_value = "./usage_counters.sqlite3")]
    db: PathBuf,

    /// File holding the installation's shared secret material.
    #[arg(long, env = "USAGE_COUNTER_SECRET_FILE")]
    secret_file: Option<PathBuf>,

    /// JSON file with counter validation settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `ledger_check` from the config file: required | when_present.
    #[arg(long, value_parser = parse_ledger_check)]
    ledger_check: Option<LedgerCheck>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision the database identity.
    Init(InitArgs),
    Identity {
        #[command(subcommand)]
        command: Box<IdentityCommand>,
    },
    Counter {
        #[command(subcommand)]
        command: Box<CounterCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
    /// Check identity, counters and change records; exits non-zero when unhealthy.
    Validate(ValidateArgs),
    Code {
        #[command(subcommand)]
        command: Box<CodeCommand>,
    },
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[arg(long)]
    server: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
pub enum IdentityCommand {
    Show,
    Check,
    /// Print the sealed identity as base64 for an update code request.
    Export,
    RecordRestore(RecordRestoreArgs),
}

#[derive(Debug, Args)]
pub struct RecordRestoreArgs {
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CounterCommand {
    List,
    Show(CounterShowArgs),
    Increment(IncrementArgs),
    SetAlerts(SetAlertsArgs),
}

#[derive(Debug, Args)]
pub struct CounterShowArgs {
    #[arg(long)]
    counter_id: u16,
}

#[derive(Debug, Args)]
pub struct IncrementArgs {
    #[arg(long)]
    counter_id: u16,
    #[arg(long, default_value_t = 1)]
    by: i64,
    #[arg(long, default_value_t = 0)]
    min_document_count: i64,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long, default_value = "")]
    comment: String,
}

#[derive(Debug, Args)]
pub struct SetAlertsArgs {
    #[arg(long)]
    counter_id: u16,
    #[arg(long)]
    level: Option<i64>,
    #[arg(long)]
    multiple: Option<i64>,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    List(LedgerListArgs),
}

#[derive(Debug, Args)]
pub struct LedgerListArgs {
    #[arg(long)]
    counter_id: Option<u16>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum CodeCommand {
    /// Vendor side: build an update code for an exported identity.
    Generate(GenerateArgs),
    /// Decode a code and print what it would do.
    Describe(CodeArgs),
    Apply(ApplyArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Base64 identity from `uc identity export`.
    #[arg(long)]
    target: String,
    #[arg(long)]
    issued_by: String,
    #[arg(long)]
    issued_from: String,
    /// `create:ID[:NAME]=VALUE`, `set:ID=VALUE` or `delete:ID`; repeatable.
    #[arg(long = "op")]
    operations: Vec<String>,
    /// Emit the legacy unlock format (set operations only).
    #[arg(long)]
    legacy: bool,
    #[arg(long)]
    generated_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct CodeArgs {
    #[arg(long)]
    code: String,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    #[arg(long)]
    code: String,
    #[arg(long)]
    session_id: Option<String>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the secret or config cannot be loaded, store
/// open/migrate fails, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let security = load_security(
        cli.secret_file.as_deref(),
        cli.config.as_deref(),
        cli.ledger_check,
    )?;

    match cli.command {
        Command::Code { command } => match *command {
            CodeCommand::Apply(args) => {
                let mut store = open_store(&cli.db, security)?;
                let session_id = parse_session_id(args.session_id.as_deref())?;
                let report = store.apply_update_code(&args.code, session_id)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            offline => run_code_offline(offline, &security.secret),
        },
        command => {
            let mut store = open_store(&cli.db, security)?;
            run_with_store(command, &mut store)
        }
    }
}

/// Executes a store-backed command against an existing store handle.
///
/// # Errors
/// Returns an error when the command fails or validation reports problems.
pub fn run_with_store(command: Command, store: &mut SqliteCounterStore) -> Result<()> {
    match command {
        Command::Init(args) => {
            let identity = store.provision(&args.server, &args.name)?;
            println!("{}", serde_json::to_string_pretty(&identity_json(&identity, None)?)?);
            Ok(())
        }
        Command::Identity { command } => run_identity(*command, store),
        Command::Counter { command } => run_counter(*command, store),
        Command::Ledger { command } => match *command {
            LedgerCommand::List(args) => {
                let counter_id = args.counter_id.map(CounterId::new).transpose()?;
                let changes = store.list_changes(counter_id, args.limit)?;
                let payload = changes
                    .iter()
                    .map(|change| -> Result<Value> {
                        let mut value = change_json(&change.record)?;
                        value["change_seq"] = json!(change.change_seq);
                        value["hash_valid"] = json!(change.hash_valid);
                        Ok(value)
                    })
                    .collect::<Result<Vec<_>>>()?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
                Ok(())
            }
        },
        Command::Validate(args) => {
            let report = store.validate_all()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_validation_report(&report);
            }

            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!(
                    "validation failed with {} issue(s)",
                    report.issues.len()
                ))
            }
        }
        Command::Code { .. } => Err(anyhow!(
            "internal dispatch error: code commands are handled before store initialization"
        )),
    }
}

fn run_identity(command: IdentityCommand, store: &SqliteCounterStore) -> Result<()> {
    match command {
        IdentityCommand::Show => {
            let identity = store.load_identity()?;
            let facts = store.live_facts()?;
            let reasons = identity.explain_invalid(&facts);
            println!(
                "{}",
                serde_json::to_string_pretty(&identity_json(&identity, Some(reasons.as_slice()))?)?
            );
            Ok(())
        }
        IdentityCommand::Check => {
            let identity = store.check_identity()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "valid": true,
                    "id": identity.id.to_string(),
                }))?
            );
            Ok(())
        }
        IdentityCommand::Export => {
            println!("{}", store.export_identity()?);
            Ok(())
        }
        IdentityCommand::RecordRestore(args) => {
            let at = parse_optional_utc(args.at.as_deref())?;
            store.record_restore(at)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "restored_at": format_rfc3339(at)? }))?
            );
            Ok(())
        }
    }
}

fn run_counter(command: CounterCommand, store: &mut SqliteCounterStore) -> Result<()> {
    match command {
        CounterCommand::List => {
            let listings = store.list_counters()?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
            Ok(())
        }
        CounterCommand::Show(args) => {
            let counter_id = CounterId::new(args.counter_id)?;
            let counter = store
                .get_counter(counter_id)?
                .ok_or_else(|| anyhow!("counter {counter_id} not found"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "counter_id": counter.counter_id,
                    "name": counter.display_name(),
                    "value": counter.value,
                    "alert_level": counter.alert_level,
                    "alert_multiple": counter.alert_multiple,
                }))?
            );
            Ok(())
        }
        CounterCommand::Increment(args) => {
            let context = IncrementContext {
                session_id: parse_session_id(args.session_id.as_deref())?,
                min_document_count: args.min_document_count,
                comment: args.comment,
            };
            let record = store.increment_counter(CounterId::new(args.counter_id)?, args.by, &context)?;
            println!("{}", serde_json::to_string_pretty(&change_json(&record)?)?);
            Ok(())
        }
        CounterCommand::SetAlerts(args) => {
            let counter_id = CounterId::new(args.counter_id)?;
            store.set_alerts(counter_id, args.level, args.multiple)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "counter_id": counter_id,
                    "alert_level": args.level,
                    "alert_multiple": args.multiple,
                }))?
            );
            Ok(())
        }
    }
}

fn run_code_offline(command: CodeCommand, secret: &SharedSecret) -> Result<()> {
    match command {
        CodeCommand::Generate(args) => {
            let target_blob = from_transport(&args.target)?;
            let target = DatabaseIdentity::deserialize_encrypted(&target_blob, secret)
                .context("target is not an identity sealed with this secret")?;
            let operations = args
                .operations
                .iter()
                .map(|raw| parse_operation(raw))
                .collect::<Result<Vec<_>>>()?;
            if operations.is_empty() {
                return Err(anyhow!("at least one --op is required"));
            }

            let format = if args.legacy {
                CodeFormat::LegacyUnlock
            } else {
                CodeFormat::Current
            };
            let code = UpdateCode::issue(
                &target,
                parse_optional_utc(args.generated_at.as_deref())?,
                args.issued_by,
                args.issued_from,
                format,
                operations,
            )?;
            println!("{}", code.to_transport(secret)?);
            Ok(())
        }
        CodeCommand::Describe(args) => {
            let code = UpdateCode::from_transport(&args.code, secret)?;
            println!("{}", serde_json::to_string_pretty(&code.summary()?)?);
            Ok(())
        }
        CodeCommand::Apply(_) => Err(anyhow!(
            "internal dispatch error: apply requires a store"
        )),
    }
}

fn open_store(db_path: &Path, security: SecurityContext) -> Result<SqliteCounterStore> {
    let store = SqliteCounterStore::open(db_path, security)?;
    store.migrate()?;
    Ok(store)
}

fn load_security(
    secret_file: Option<&Path>,
    config_file: Option<&Path>,
    ledger_check: Option<LedgerCheck>,
) -> Result<SecurityContext> {
    let secret_file = secret_file.ok_or_else(|| {
        anyhow!("a shared secret file is required (--secret-file or USAGE_COUNTER_SECRET_FILE)")
    })?;
    let material = std::fs::read(secret_file)
        .with_context(|| format!("failed to read shared secret file {}", secret_file.display()))?;
    let secret = SharedSecret::from_material(&material)?;

    let mut config = match config_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("config file {} must be valid JSON", path.display()))?;
            CounterConfig::from_json(&value)?
        }
        None => CounterConfig::default(),
    };
    if let Some(mode) = ledger_check {
        config.ledger_check = mode;
    }

    Ok(SecurityContext::new(secret, config))
}

fn parse_ledger_check(raw: &str) -> Result<LedgerCheck, String> {
    LedgerCheck::parse(raw)
        .ok_or_else(|| format!("expected 'required' or 'when_present', got '{raw}'"))
}

fn parse_operation(raw: &str) -> Result<CounterOperation> {
    let (kind, rest) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("operation must look like KIND:ID[...]: {raw}"))?;

    match kind {
        "delete" => Ok(CounterOperation::new(
            parse_counter_id(rest)?,
            None,
            CounterAction::Delete,
        )),
        "create" | "set" => {
            let (target, value) = rest
                .split_once('=')
                .ok_or_else(|| anyhow!("{kind} operation needs =VALUE: {raw}"))?;
            let value: i64 = value
                .parse()
                .with_context(|| format!("invalid counter value in {raw}"))?;
            let (counter_id, name) = match target.split_once(':') {
                Some((counter_id, name)) => (parse_counter_id(counter_id)?, Some(name.to_string())),
                None => (parse_counter_id(target)?, None),
            };
            let action = if kind == "create" {
                CounterAction::Create { value }
            } else {
                CounterAction::Set { value }
            };
            Ok(CounterOperation::new(counter_id, name, action))
        }
        other => Err(anyhow!("unknown operation kind '{other}' in {raw}")),
    }
}

fn parse_counter_id(raw: &str) -> Result<CounterId> {
    let parsed: u16 = raw
        .parse()
        .with_context(|| format!("invalid counter id: {raw}"))?;
    Ok(CounterId::new(parsed)?)
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_session_id(raw: Option<&str>) -> Result<Option<Ulid>> {
    raw.map(|value| Ulid::from_string(value).with_context(|| format!("invalid session ULID: {value}")))
        .transpose()
}

fn identity_json(identity: &DatabaseIdentity, reasons: Option<&[String]>) -> Result<Value> {
    let mut value = json!({
        "id": identity.id.to_string(),
        "server": identity.server,
        "name": identity.name,
        "created": format_rfc3339(identity.created)?,
        "restored": format_rfc3339(identity.restored)?,
        "last_updated": format_rfc3339(identity.last_updated)?,
        "code_watermark": format_rfc3339(identity.code_watermark)?,
        "integrity_hash": format!("{:#018x}", identity.compute_hash()),
    });
    if let Some(reasons) = reasons {
        value["valid"] = json!(reasons.is_empty());
        value["reasons"] = json!(reasons);
    }
    Ok(value)
}

fn change_json(record: &CounterChangeRecord) -> Result<Value> {
    Ok(json!({
        "counter_id": record.counter_id,
        "from_value": record.from_value,
        "to_value": record.to_value,
        "updated_time": format_rfc3339(record.updated_time)?,
        "updated_by_session_id": record.updated_by_session_id.map(|id| id.to_string()),
        "min_document_count": record.min_document_count,
        "comment": record.comment,
        "record_hash": format!("{:#018x}", record.record_hash),
    }))
}

fn print_validation_report(report: &ValidationReport) {
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    println!(
        "counters_checked={} changes_checked={}",
        report.counters_checked, report.changes_checked
    );
    for issue in &report.issues {
        let severity = match issue.severity {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        let counter = issue
            .counter_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!("{severity:<7} {:<28} counter={counter:<5} {}", issue.code, issue.message);
    }
}
