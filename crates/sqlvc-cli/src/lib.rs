//! Embeddable `sqlvc` command surface.
//!
//! Hosts embed the CLI through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for executing one [`Command`] against a prepared
//!   [`CliContext`].

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use sqlvc_core::{
    HeuristicClassifier, HistoryQuery, HistoryRecord, OperationType, Permissions, PurgeScope,
    RollbackResult, RollbackStatus, SessionContext, SessionId, SqlExecutor, StatementClassifier,
    StatementKind, VersionControl, WriteReport,
};
use sqlvc_store_sqlite::{SqliteExecutor, SqliteHistoryLedger};
use tracing::debug;

const WRITE_REPORT_CONTRACT: &str = "write_report.v1";
const QUERY_RESULT_CONTRACT: &str = "query_result.v1";
const HISTORY_LIST_CONTRACT: &str = "history_list.v1";
const HISTORY_RECORD_CONTRACT: &str = "history_record.v1";
const HISTORY_CLEAR_CONTRACT: &str = "history_clear.v1";
const ROLLBACK_RESULT_CONTRACT: &str = "rollback_result.v1";

const MAX_CELL_WIDTH: usize = 40;

#[derive(Debug, Parser)]
#[command(name = "sqlvc")]
#[command(about = "Version-controlled SQL writes with per-operation rollback")]
pub struct Cli {
    /// Target database the statements run against.
    #[arg(long, env = "SQLVC_DB", default_value = "./sqlvc.sqlite3")]
    db: PathBuf,

    /// Database holding the operation history.
    #[arg(long, env = "SQLVC_HISTORY_DB", default_value = "./sqlvc_history.sqlite3")]
    history_db: PathBuf,

    /// Session id (ULID); a fresh session is generated when absent.
    #[arg(long, env = "SQLVC_SESSION")]
    session: Option<String>,

    #[command(flatten)]
    permissions: PermissionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Args)]
pub struct PermissionArgs {
    /// Permit INSERT and CREATE TABLE statements.
    #[arg(long, env = "SQLVC_ALLOW_INSERT")]
    allow_insert: bool,

    /// Permit UPDATE and ALTER TABLE statements.
    #[arg(long, env = "SQLVC_ALLOW_UPDATE")]
    allow_update: bool,

    /// Permit DELETE, TRUNCATE and DROP TABLE statements.
    #[arg(long, env = "SQLVC_ALLOW_DELETE")]
    allow_delete: bool,
}

impl From<PermissionArgs> for Permissions {
    fn from(args: PermissionArgs) -> Self {
        Self {
            allow_insert: args.allow_insert,
            allow_update: args.allow_update,
            allow_delete: args.allow_delete,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a write statement and record it in history.
    Exec(ExecArgs),
    /// Run a read-only statement.
    Query(QueryArgs),
    /// List tables in the target database.
    Tables,
    /// Print the CREATE statement of a table.
    Describe(DescribeArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    /// Reverse a recorded operation.
    Restore(RestoreArgs),
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    #[arg(long)]
    sql: String,
    /// Positional parameter as JSON; text that is not JSON binds as a string.
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[arg(long)]
    sql: String,
    #[arg(long = "param")]
    params: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DescribeArgs {
    #[arg(long)]
    table: String,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List(HistoryListArgs),
    Show(HistoryShowArgs),
    Clear(HistoryClearArgs),
}

#[derive(Debug, Args)]
pub struct HistoryListArgs {
    #[arg(long)]
    all_sessions: bool,
    #[arg(long, value_enum)]
    operation: Option<OperationArg>,
    #[arg(long)]
    table: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct HistoryClearArgs {
    #[arg(long)]
    all_sessions: bool,
    /// Required together with `--all-sessions`.
    #[arg(long)]
    confirm: bool,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OperationArg {
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    Rollback,
}

impl From<OperationArg> for OperationType {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Insert => Self::Insert,
            OperationArg::Update => Self::Update,
            OperationArg::Delete => Self::Delete,
            OperationArg::CreateTable => Self::CreateTable,
            OperationArg::DropTable => Self::DropTable,
            OperationArg::Rollback => Self::Rollback,
        }
    }
}

/// Resolved global options shared by every command.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub db: PathBuf,
    pub history_db: PathBuf,
    pub session: SessionContext,
    pub permissions: Permissions,
}

impl CliContext {
    fn open_executor(&self) -> Result<SqliteExecutor> {
        SqliteExecutor::open(&self.db)
    }

    fn open_engine(&self) -> Result<VersionControl<SqliteHistoryLedger>> {
        let ledger = SqliteHistoryLedger::open(&self.history_db)?;
        ledger.migrate()?;
        Ok(VersionControl::new(ledger, self.permissions))
    }
}

#[derive(Debug, Serialize)]
struct WriteReportOutput<'a> {
    contract_version: &'static str,
    session_id: String,
    #[serde(flatten)]
    report: &'a WriteReport,
}

#[derive(Debug, Serialize)]
struct QueryResultOutput<'a> {
    contract_version: &'static str,
    columns: &'a [String],
    rows: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct HistoryListOutput<'a> {
    contract_version: &'static str,
    session_id: String,
    scope: &'static str,
    records: &'a [HistoryRecord],
}

#[derive(Debug, Serialize)]
struct HistoryRecordOutput<'a> {
    contract_version: &'static str,
    record: &'a HistoryRecord,
}

#[derive(Debug, Serialize)]
struct HistoryClearOutput {
    contract_version: &'static str,
    scope: &'static str,
    removed: usize,
}

#[derive(Debug, Serialize)]
struct RollbackResultOutput<'a> {
    contract_version: &'static str,
    session_id: String,
    #[serde(flatten)]
    result: &'a RollbackResult,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the session id is invalid, a database cannot be
/// opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let session_id = match cli.session.as_deref() {
        Some(raw) => SessionId::parse(raw)?,
        None => SessionId::generate(),
    };
    let context = CliContext {
        db: cli.db,
        history_db: cli.history_db,
        session: SessionContext::new(session_id),
        permissions: cli.permissions.into(),
    };
    run_command(cli.command, &context)
}

/// Executes one command with already-resolved options.
///
/// # Errors
/// Returns an error when a database cannot be opened, a statement fails, a
/// write is not permitted or a restore does not fully succeed.
pub fn run_command(command: Command, context: &CliContext) -> Result<()> {
    debug!(session_id = %context.session.session_id, ?command, "running command");
    match command {
        Command::Exec(args) => run_exec(&args, context),
        Command::Query(args) => run_query(&args, context),
        Command::Tables => {
            for table in context.open_executor()?.list_tables()? {
                println!("{table}");
            }
            Ok(())
        }
        Command::Describe(args) => {
            let mut executor = context.open_executor()?;
            println!("{}", executor.describe_table(&args.table)?);
            Ok(())
        }
        Command::History { command } => run_history(command, context),
        Command::Restore(args) => run_restore(&args, context),
    }
}

fn run_exec(args: &ExecArgs, context: &CliContext) -> Result<()> {
    let params = parse_params(&args.params);
    let mut executor = context.open_executor()?;
    let engine = context.open_engine()?;

    let report = engine
        .execute_write(&context.session, &mut executor, &args.sql, &params)?;

    let output = WriteReportOutput {
        contract_version: WRITE_REPORT_CONTRACT,
        session_id: context.session.session_id.to_string(),
        report: &report,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    for warning in &report.warnings {
        eprintln!("warning: {}", warning.message);
    }
    Ok(())
}

fn run_query(args: &QueryArgs, context: &CliContext) -> Result<()> {
    let mut executor = context.open_executor()?;
    if !executor.is_read_only(&args.sql)? {
        let kind = HeuristicClassifier.classify(&args.sql).kind;
        if kind == StatementKind::Other {
            bail!("statement is not read-only; run it through `sqlvc exec`");
        }
        bail!("{kind:?} statements modify data; run them through `sqlvc exec`");
    }

    let params = parse_params(&args.params);
    let result = executor.execute(&args.sql, &params)?;

    if args.json {
        let output = QueryResultOutput {
            contract_version: QUERY_RESULT_CONTRACT,
            columns: &result.columns,
            rows: result.rows.iter().cloned().map(Value::Object).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if result.columns.is_empty() {
        println!("{} row(s) affected", result.affected_rows);
    } else {
        let rows = result
            .rows
            .iter()
            .map(|row| {
                result
                    .columns
                    .iter()
                    .map(|column| render_cell(row.get(column).unwrap_or(&Value::Null)))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        print_table(&result.columns, &rows);
    }
    Ok(())
}

fn run_history(command: HistoryCommand, context: &CliContext) -> Result<()> {
    let engine = context.open_engine()?;
    match command {
        HistoryCommand::List(args) => {
            let query = HistoryQuery {
                session_only: !args.all_sessions,
                operation_type: args.operation.map(OperationType::from),
                target_table: args.table,
            };
            let records = engine
                .list_history(&context.session, &query, args.limit)?;

            if args.json {
                let output = HistoryListOutput {
                    contract_version: HISTORY_LIST_CONTRACT,
                    session_id: context.session.session_id.to_string(),
                    scope: if args.all_sessions { "all_sessions" } else { "session" },
                    records: &records,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_history_table(&records);
            }
            Ok(())
        }
        HistoryCommand::Show(args) => {
            let record = engine
                .get_version(args.id)?;
            let output = HistoryRecordOutput {
                contract_version: HISTORY_RECORD_CONTRACT,
                record: &record,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        HistoryCommand::Clear(args) => {
            let (scope, label) = if args.all_sessions {
                if !args.confirm {
                    bail!("clearing history for all sessions requires --confirm");
                }
                (PurgeScope::AllSessions, "all_sessions")
            } else {
                (PurgeScope::Session(context.session.session_id), "session")
            };

            let removed = engine
                .purge_history(scope)?;
            let output = HistoryClearOutput {
                contract_version: HISTORY_CLEAR_CONTRACT,
                scope: label,
                removed,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

fn run_restore(args: &RestoreArgs, context: &CliContext) -> Result<()> {
    let mut executor = context.open_executor()?;
    let engine = context.open_engine()?;

    let result = engine
        .restore(&context.session, args.id, &mut executor)?;

    let output = RollbackResultOutput {
        contract_version: ROLLBACK_RESULT_CONTRACT,
        session_id: context.session.session_id.to_string(),
        result: &result,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    if result.status != RollbackStatus::Success {
        bail!(
            "restore of version {} ended {}: {}",
            args.id,
            result.status.as_str(),
            result.message
        );
    }
    Ok(())
}

/// Parses `--param` values as JSON, binding anything that is not JSON as a
/// plain string.
fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|value| {
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()))
        })
        .collect()
}

fn render_cell(value: &Value) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    truncate(&text, MAX_CELL_WIDTH)
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut shortened = text.chars().take(width.saturating_sub(3)).collect::<String>();
    shortened.push_str("...");
    shortened
}

fn print_table(columns: &[String], rows: &[Vec<String>]) {
    let widths = columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            rows.iter()
                .filter_map(|row| row.get(index))
                .map(|cell| cell.chars().count())
                .chain(std::iter::once(column.chars().count()))
                .max()
                .unwrap_or(0)
                .min(MAX_CELL_WIDTH)
        })
        .collect::<Vec<_>>();

    let render = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", truncate(cell, *width), width = *width))
            .collect::<Vec<_>>()
            .join("  ")
    };

    println!("{}", render(columns).trim_end());
    println!("{}", "-".repeat(widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1)));
    for row in rows {
        println!("{}", render(row).trim_end());
    }
    println!("({} row(s))", rows.len());
}

fn print_history_table(records: &[HistoryRecord]) {
    println!(
        "{:<8} {:<26} {:<12} {:<24} {:<8} description",
        "version", "timestamp", "operation", "table", "rows"
    );
    println!("{}", "-".repeat(110));

    for record in records {
        println!(
            "{:<8} {:<26} {:<12} {:<24} {:<8} {}",
            record.id,
            record.timestamp,
            record.operation_type.as_str(),
            truncate(record.target_table.as_deref().unwrap_or("-"), 24),
            record.affected_rows,
            record.description
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;
    use std::path::Path;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    struct Fixture {
        db: PathBuf,
        history_db: PathBuf,
        session: String,
    }

    impl Fixture {
        fn new() -> Self {
            let run = Ulid::new();
            let fixture = Self {
                db: std::env::temp_dir().join(format!("sqlvc-cli-{run}.sqlite3")),
                history_db: std::env::temp_dir().join(format!("sqlvc-cli-history-{run}.sqlite3")),
                session: Ulid::new().to_string(),
            };
            let conn = match Connection::open(&fixture.db) {
                Ok(conn) => conn,
                Err(err) => panic!("failed to create fixture db: {err}"),
            };
            if let Err(err) = conn.execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);
                 INSERT INTO items (name) VALUES ('seed');",
            ) {
                panic!("failed to seed fixture db: {err}");
            }
            fixture
        }

        fn run(&self, args: &[&str]) -> Result<()> {
            let mut argv = vec![
                "sqlvc".to_string(),
                "--db".to_string(),
                self.db.display().to_string(),
                "--history-db".to_string(),
                self.history_db.display().to_string(),
                "--session".to_string(),
                self.session.clone(),
            ];
            argv.extend(args.iter().map(|arg| (*arg).to_string()));
            execute_cli(argv)
        }

        fn item_names(&self) -> Vec<String> {
            let conn = match Connection::open(&self.db) {
                Ok(conn) => conn,
                Err(err) => panic!("failed to open fixture db: {err}"),
            };
            let mut stmt = match conn.prepare("SELECT name FROM items ORDER BY id") {
                Ok(stmt) => stmt,
                Err(err) => panic!("failed to prepare: {err}"),
            };
            let rows = match stmt.query_map([], |row| row.get::<_, String>(0)) {
                Ok(rows) => rows,
                Err(err) => panic!("failed to query: {err}"),
            };
            rows.map(|row| match row {
                Ok(name) => name,
                Err(err) => panic!("failed to read row: {err}"),
            })
            .collect()
        }

        fn history_ids(&self) -> Vec<i64> {
            let ledger = must(SqliteHistoryLedger::open(&self.history_db));
            must(ledger.migrate());
            let engine = VersionControl::new(ledger, Permissions::default());
            let session = match SessionId::parse(&self.session) {
                Ok(session) => SessionContext::new(session),
                Err(err) => panic!("invalid fixture session: {err}"),
            };
            match engine.list_history(&session, &HistoryQuery::default(), 50) {
                Ok(records) => records.iter().map(|record| record.id).collect(),
                Err(err) => panic!("failed to list history: {err}"),
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for path in [&self.db, &self.history_db] {
                let _ = std::fs::remove_file(path);
                for suffix in ["-wal", "-shm"] {
                    let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
                }
            }
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn writes_are_refused_without_permission() {
        let fixture = Fixture::new();
        let result = fixture.run(&["exec", "--sql", "DELETE FROM items"]);
        let err = match result {
            Ok(()) => panic!("delete without --allow-delete should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(fixture.item_names(), vec!["seed"]);
        assert!(fixture.history_ids().is_empty());
    }

    #[test]
    fn exec_then_restore_round_trips_through_history() {
        let fixture = Fixture::new();
        must(fixture.run(&[
            "--allow-insert",
            "exec",
            "--sql",
            "INSERT INTO items (name) VALUES (?)",
            "--param",
            "fresh",
        ]));
        assert_eq!(fixture.item_names(), vec!["seed", "fresh"]);

        let ids = fixture.history_ids();
        assert_eq!(ids.len(), 1);

        must(fixture.run(&["restore", "--id", &ids[0].to_string()]));
        assert_eq!(fixture.item_names(), vec!["seed"]);
        assert_eq!(fixture.history_ids().len(), 2);
    }

    #[test]
    fn restore_of_unknown_version_fails() {
        let fixture = Fixture::new();
        let result = fixture.run(&["restore", "--id", "999"]);
        let err = match result {
            Ok(()) => panic!("unknown version should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("version 999 not found"));
    }

    #[test]
    fn global_clear_requires_confirmation() {
        let fixture = Fixture::new();
        must(fixture.run(&["--allow-update", "exec", "--sql", "UPDATE items SET name = 'x'"]));
        assert!(fixture.run(&["history", "clear", "--all-sessions"]).is_err());
        assert_eq!(fixture.history_ids().len(), 1);

        must(fixture.run(&["history", "clear", "--all-sessions", "--confirm"]));
        assert!(fixture.history_ids().is_empty());
    }

    #[test]
    fn query_refuses_write_statements() {
        let fixture = Fixture::new();
        assert!(fixture
            .run(&["query", "--sql", "DELETE FROM items"])
            .is_err());
        must(fixture.run(&["query", "--sql", "SELECT * FROM items", "--json"]));
        must(fixture.run(&["history", "list", "--all-sessions", "--operation", "create-table"]));
    }

    #[test]
    fn query_refuses_writes_the_classifier_does_not_name() {
        let fixture = Fixture::new();
        for sql in [
            "REPLACE INTO items (id, name) VALUES (1, 'swapped')",
            "WITH doomed AS (SELECT id FROM items) DELETE FROM items WHERE id IN doomed",
            "CREATE VIEW item_view AS SELECT * FROM items",
        ] {
            assert!(fixture.run(&["query", "--sql", sql]).is_err(), "{sql}");
        }
        assert_eq!(fixture.item_names(), vec!["seed".to_string()]);

        must(fixture.run(&[
            "query",
            "--sql",
            "WITH named AS (SELECT name FROM items) SELECT * FROM named",
        ]));
    }

    #[test]
    fn invalid_session_ids_are_rejected() {
        let result = execute_cli(vec![
            "sqlvc".to_string(),
            "--db".to_string(),
            ":memory:".to_string(),
            "--session".to_string(),
            "not-a-ulid".to_string(),
            "tables".to_string(),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn params_parse_as_json_with_string_fallback() {
        let params = parse_params(&[
            "5".to_string(),
            "\"quoted\"".to_string(),
            "plain text".to_string(),
            "null".to_string(),
            "[1,2]".to_string(),
        ]);
        assert_eq!(
            params,
            vec![json!(5), json!("quoted"), json!("plain text"), Value::Null, json!([1, 2])]
        );
    }

    #[test]
    fn cells_render_nulls_and_truncate() {
        assert_eq!(render_cell(&Value::Null), "NULL");
        assert_eq!(render_cell(&json!(1.5)), "1.5");
        assert_eq!(render_cell(&json!("abc")), "abc");
        let long = "x".repeat(60);
        let rendered = render_cell(&json!(long));
        assert_eq!(rendered.chars().count(), MAX_CELL_WIDTH);
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn permission_flags_map_to_policy() {
        let cli = match Cli::try_parse_from([
            "sqlvc",
            "--allow-insert",
            "--allow-delete",
            "tables",
        ]) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse: {err}"),
        };
        let permissions = Permissions::from(cli.permissions);
        assert!(permissions.allow_insert);
        assert!(!permissions.allow_update);
        assert!(permissions.allow_delete);
        assert_eq!(cli.db, Path::new("./sqlvc.sqlite3"));
    }
}
