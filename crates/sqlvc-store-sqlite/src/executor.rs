use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Number, Value};
use sqlvc_core::{
    identifier_segments, quote_identifier, segment_name, ExecutionResult, HeuristicClassifier,
    RowImage, SqlExecutor, StatementClassifier, StatementKind, IDENTITY_COLUMN,
};
use tracing::debug;

use crate::open_connection;

/// [`SqlExecutor`] over one SQLite connection.
///
/// Each call runs a single statement. An INSERT reports the first rowid of
/// its batch as `insert_id`, assuming rowids were assigned contiguously, and
/// only when the target's `id` column is the table's rowid alias and the
/// statement actually assigned a new rowid.
pub struct SqliteExecutor {
    conn: Connection,
}

impl SqliteExecutor {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// User tables, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        crate::collect_rows(rows)
    }

    /// Whether `sql` is a SELECT, WITH, VALUES or EXPLAIN statement that
    /// SQLite reports as leaving the database untouched.
    pub fn is_read_only(&self, sql: &str) -> Result<bool> {
        let leading = sql
            .trim_start()
            .split(|ch: char| !ch.is_ascii_alphabetic())
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        // ATTACH, DETACH and transaction control also count as read-only.
        if !READ_KEYWORDS.contains(&leading.as_str()) {
            return Ok(false);
        }
        let stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare statement: {sql}"))?;
        Ok(stmt.readonly())
    }

    fn first_inserted_rowid(&self, sql: &str, rowid_before: i64, changed: u64) -> Option<i64> {
        let rowid_after = self.conn.last_insert_rowid();
        if changed == 0 || rowid_after == rowid_before {
            return None;
        }
        let classification = HeuristicClassifier.classify(sql);
        if classification.kind != StatementKind::Insert {
            return None;
        }
        // Rows updated by an upsert count as changes but take no new rowid.
        if changed > 1 && is_upsert(sql) {
            return None;
        }
        let table = classification.target_table?;
        match self.id_is_rowid_alias(&table) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                debug!(table = %table, error = %err, "could not inspect primary key");
                return None;
            }
        }
        let changed = i64::try_from(changed).ok()?;
        rowid_after.checked_sub(changed - 1)
    }

    /// True when `id` is the table's sole `INTEGER PRIMARY KEY` on a rowid
    /// table, so rowids and ids are the same values.
    fn id_is_rowid_alias(&self, table: &str) -> Result<bool> {
        let segments = identifier_segments(table);
        let (schema, name) = match segments.as_slice() {
            [name] => ("main", name.as_str()),
            [schema, name] => (schema.as_str(), name.as_str()),
            _ => return Ok(false),
        };

        let mut stmt = self
            .conn
            .prepare("SELECT name, type FROM pragma_table_info(?1, ?2) WHERE pk > 0")?;
        let keys = stmt.query_map(params![name, schema], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let keys = crate::collect_rows(keys)?;
        let [(column, declared)] = keys.as_slice() else {
            return Ok(false);
        };
        if !column.eq_ignore_ascii_case(IDENTITY_COLUMN) || !declared.eq_ignore_ascii_case("INTEGER")
        {
            return Ok(false);
        }

        // WITHOUT ROWID tables and `INTEGER PRIMARY KEY DESC` keep a separate
        // primary key index.
        let pk_indexes = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_index_list(?1, ?2) WHERE origin = 'pk'",
            params![name, schema],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(pk_indexes == 0)
    }
}

const READ_KEYWORDS: [&str; 4] = ["SELECT", "WITH", "VALUES", "EXPLAIN"];

fn is_upsert(sql: &str) -> bool {
    let normalized = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    normalized.contains("ON CONFLICT") || normalized.contains("ON DUPLICATE")
}

impl SqlExecutor for SqliteExecutor {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecutionResult> {
        let bound = params
            .iter()
            .map(json_to_sql)
            .collect::<Vec<_>>();
        let rowid_before = self.conn.last_insert_rowid();
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare statement: {sql}"))?;

        let (columns, images, affected_rows) = if stmt.column_count() > 0 {
            let columns = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            let mut images = Vec::new();
            let mut rows = stmt
                .query(params_from_iter(bound.iter()))
                .with_context(|| format!("failed to run query: {sql}"))?;
            while let Some(row) = rows.next()? {
                let mut image = RowImage::new();
                for (index, column) in columns.iter().enumerate() {
                    image.insert(column.clone(), sql_to_json(row.get_ref(index)?));
                }
                images.push(image);
            }
            drop(rows);

            // A write with RETURNING hands back rows and changes both.
            let affected_rows = if stmt.readonly() {
                0
            } else {
                self.conn.changes()
            };
            (columns, images, affected_rows)
        } else {
            let changed = stmt
                .execute(params_from_iter(bound.iter()))
                .with_context(|| format!("failed to execute statement: {sql}"))?;
            let affected_rows = u64::try_from(changed).context("change count out of range")?;
            (Vec::new(), Vec::new(), affected_rows)
        };
        drop(stmt);

        let insert_id = self.first_inserted_rowid(sql, rowid_before, affected_rows);
        debug!(rows = images.len(), affected_rows, ?insert_id, "statement applied");
        Ok(ExecutionResult {
            columns,
            rows: images,
            affected_rows,
            insert_id,
        })
    }

    fn describe_table(&mut self, table: &str) -> Result<String> {
        let segments = identifier_segments(table);
        let (schema, name) = match segments.as_slice() {
            [name] => ("main", name.as_str()),
            [schema, name] => (schema.as_str(), name.as_str()),
            _ => return Err(anyhow!("unsupported table name: {table}")),
        };
        let query = format!(
            "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            quote_identifier(&segment_name(schema))
        );
        self.conn
            .query_row(&query, params![name], |row| row.get::<_, Option<String>>(0))
            .optional()
            .with_context(|| format!("failed to read schema for {table}"))?
            .flatten()
            .ok_or_else(|| anyhow!("no such table: {table}"))
    }

    fn begin(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE;")
            .context("failed to begin transaction")
    }

    fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT;")
            .context("failed to commit transaction")
    }

    fn abort(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK;")
            .context("failed to roll back transaction")
    }

    /// SQLite hands stored text back verbatim, so captured values bind back
    /// unchanged.
    fn normalize_value(&self, value: &Value) -> Value {
        value.clone()
    }
}

/// Binds a JSON value: booleans as integers, byte arrays as BLOBs, other
/// arrays and objects as JSON text.
#[must_use]
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(items) => match byte_array(items) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

#[must_use]
pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn byte_array(items: &[Value]) -> Option<Vec<u8>> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| item.as_u64().and_then(|byte| u8::try_from(byte).ok()))
        .collect()
}
