#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use sqlvc_core::{
    format_ledger_timestamp, now_utc, HistoryFilter, HistoryLedger, HistoryRecord,
    NewHistoryRecord, OperationType, PurgeScope, SessionId,
};
use tracing::debug;

mod executor;

pub use executor::{json_to_sql, sql_to_json, SqliteExecutor};

const HISTORY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_HISTORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS operation_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  operation_type TEXT NOT NULL CHECK (
    operation_type IN (
      'INSERT',
      'UPDATE',
      'DELETE',
      'CREATE_TABLE',
      'DROP_TABLE',
      'ROLLBACK'
    )
  ),
  target_table TEXT,
  sql_query TEXT NOT NULL,
  backup_payload TEXT,
  affected_rows INTEGER NOT NULL DEFAULT 0 CHECK (affected_rows >= 0),
  description TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_operation_history_no_update
BEFORE UPDATE ON operation_history
BEGIN
  SELECT RAISE(FAIL, 'operation_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_operation_history_session_timestamp
  ON operation_history(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_operation_history_operation_type
  ON operation_history(operation_type);
CREATE INDEX IF NOT EXISTS idx_operation_history_target_table
  ON operation_history(target_table);
";

const HISTORY_COLUMNS: &str = "id, session_id, timestamp, operation_type, target_table, \
     sql_query, backup_payload, affected_rows, description";

/// Opens a SQLite database with the pragmas every sqlvc connection uses.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

/// Durable operation history in a SQLite file.
///
/// Rows are append-only (a trigger rejects updates); only [`HistoryLedger::clear`]
/// removes them. The connection sits behind a mutex so in-process appends
/// serialize; appends from other processes serialize on the write lock.
pub struct SqliteHistoryLedger {
    conn: Mutex<Connection>,
}

impl SqliteHistoryLedger {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_HISTORY_V1)
            .context("failed to apply history schema")?;

        let now = format_ledger_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![HISTORY_MIGRATION_VERSION, now],
        )
        .context("failed to register history schema migration")?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history ledger connection lock poisoned"))
    }
}

impl HistoryLedger for SqliteHistoryLedger {
    fn append(&self, record: &NewHistoryRecord) -> Result<HistoryRecord> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start history transaction")?;

        let session_id = record.session_id.to_string();
        let latest: Option<String> = tx
            .query_row(
                "SELECT MAX(timestamp) FROM operation_history WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("failed to read latest session timestamp")?;
        let now = format_ledger_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let timestamp = match latest {
            Some(latest) if latest > now => latest,
            _ => now,
        };

        let backup_payload = record
            .backup_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize backup payload")?;
        let affected_rows =
            i64::try_from(record.affected_rows).context("affected_rows exceeds sqlite range")?;

        tx.execute(
            "INSERT INTO operation_history(
                session_id, timestamp, operation_type, target_table,
                sql_query, backup_payload, affected_rows, description
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                timestamp,
                record.operation_type.as_str(),
                record.target_table,
                record.sql_query,
                backup_payload,
                affected_rows,
                record.description,
            ],
        )
        .context("failed to append history record")?;

        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit history transaction")?;
        debug!(id, operation = %record.operation_type, "history record appended");

        Ok(HistoryRecord {
            id,
            session_id: record.session_id,
            timestamp,
            operation_type: record.operation_type,
            target_table: record.target_table.clone(),
            sql_query: record.sql_query.clone(),
            backup_payload: record.backup_payload.clone(),
            affected_rows: record.affected_rows,
            description: record.description.clone(),
        })
    }

    fn list(&self, filter: &HistoryFilter, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(session_id) = filter.session_id {
            values.push(session_id.to_string());
            clauses.push(format!("session_id = ?{}", values.len()));
        }
        if let Some(operation_type) = filter.operation_type {
            values.push(operation_type.as_str().to_string());
            clauses.push(format!("operation_type = ?{}", values.len()));
        }
        if let Some(target_table) = &filter.target_table {
            values.push(target_table.clone());
            clauses.push(format!("target_table = ?{}", values.len()));
        }

        let mut query = format!("SELECT {HISTORY_COLUMNS} FROM operation_history");
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ");
        query.push_str(&i64::try_from(limit).unwrap_or(i64::MAX).to_string());

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_history_row)?;
        collect_rows(rows)
    }

    fn get(&self, id: i64) -> Result<Option<HistoryRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {HISTORY_COLUMNS} FROM operation_history WHERE id = ?1"),
            params![id],
            parse_history_row,
        )
        .optional()
        .with_context(|| format!("failed to read history record {id}"))
    }

    fn clear(&self, scope: PurgeScope) -> Result<usize> {
        let conn = self.lock()?;
        let removed = match scope {
            PurgeScope::Session(session_id) => conn.execute(
                "DELETE FROM operation_history WHERE session_id = ?1",
                params![session_id.to_string()],
            ),
            PurgeScope::AllSessions => conn.execute("DELETE FROM operation_history", []),
        }
        .context("failed to clear history")?;
        Ok(removed)
    }
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let session_raw: String = row.get(1)?;
    let operation_raw: String = row.get(3)?;
    let payload_raw: Option<String> = row.get(6)?;
    let affected_rows_i64: i64 = row.get(7)?;

    let session_id =
        SessionId::parse(&session_raw).map_err(|err| invalid_column(1, rusqlite::types::Type::Text, err.to_string()))?;

    let operation_type = OperationType::parse(&operation_raw).ok_or_else(|| {
        invalid_column(
            3,
            rusqlite::types::Type::Text,
            format!("invalid operation_type: {operation_raw}"),
        )
    })?;

    let backup_payload = payload_raw
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|err| {
            invalid_column(
                6,
                rusqlite::types::Type::Text,
                format!("invalid backup_payload: {err}"),
            )
        })?;

    let affected_rows = u64::try_from(affected_rows_i64).map_err(|_| {
        invalid_column(
            7,
            rusqlite::types::Type::Integer,
            format!("invalid affected_rows: {affected_rows_i64}"),
        )
    })?;

    Ok(HistoryRecord {
        id: row.get(0)?,
        session_id,
        timestamp: row.get(2)?,
        operation_type,
        target_table: row.get(4)?,
        sql_query: row.get(5)?,
        backup_payload,
        affected_rows,
        description: row.get(8)?,
    })
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
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

#[cfg(test)]
fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
