use serde_json::Value;
use tracing::debug;

use crate::{
    BackupPayload, CreateTableBackup, DeleteBackup, DropTableBackup, ExecutionResult,
    HistoryError, IdRange, InsertBackup, RowImage, SqlExecutor, StatementClassifier,
    StatementKind, UpdateBackup,
};

/// When a statement's snapshot has to be taken relative to its execution.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CapturePhase {
    BeforeExecution,
    AfterExecution,
}

impl CapturePhase {
    /// `None` for statements that are never backed up.
    #[must_use]
    pub fn for_kind(kind: StatementKind) -> Option<Self> {
        match kind {
            StatementKind::Update | StatementKind::Delete | StatementKind::DropTable => {
                Some(Self::BeforeExecution)
            }
            StatementKind::Insert | StatementKind::CreateTable => Some(Self::AfterExecution),
            StatementKind::Other => None,
        }
    }
}

/// Captures the state needed to invert one write.
///
/// UPDATE/DELETE/DROP must be captured before the statement runs, INSERT and
/// CREATE TABLE after it (INSERT needs `execution`). `params` are the
/// statement's bound parameters by index; those referenced by its `WHERE`
/// condition, numbered or named, are rebound into the snapshot query, which
/// keeps the statement's table alias. Returns `Ok(None)` for
/// [`StatementKind::Other`].
///
/// # Errors
/// Returns [`HistoryError::ClassificationAmbiguous`] without a target table
/// and [`HistoryError::SnapshotCaptureFailed`] when the executor cannot
/// produce the snapshot data.
pub fn capture<E>(
    kind: StatementKind,
    target_table: Option<&str>,
    sql: &str,
    params: &[Value],
    execution: Option<&ExecutionResult>,
    executor: &mut E,
    classifier: &dyn StatementClassifier,
) -> Result<Option<BackupPayload>, HistoryError>
where
    E: SqlExecutor + ?Sized,
{
    let Some(phase) = CapturePhase::for_kind(kind) else {
        return Ok(None);
    };
    let Some(table) = target_table else {
        return Err(HistoryError::ClassificationAmbiguous(format!(
            "no single target table in statement: {sql}"
        )));
    };

    let payload = match kind {
        StatementKind::Delete => BackupPayload::Delete(DeleteBackup {
            deleted_rows: select_matching(executor, table, sql, params, classifier)?,
        }),
        StatementKind::Update => BackupPayload::Update(UpdateBackup {
            original_rows: select_matching(executor, table, sql, params, classifier)?,
        }),
        StatementKind::DropTable => {
            let create_statement = executor
                .describe_table(table)
                .map_err(|err| capture_failed(table, &err))?;
            let rows = select_rows(executor, table, None, None, &[])?;
            BackupPayload::DropTable(DropTableBackup {
                create_statement,
                rows,
            })
        }
        StatementKind::CreateTable => BackupPayload::CreateTable(CreateTableBackup {
            table_name: table.to_string(),
            create_statement: sql.to_string(),
        }),
        StatementKind::Insert => {
            let execution = execution.ok_or_else(|| {
                HistoryError::SnapshotCaptureFailed(format!(
                    "{table}: INSERT capture needs the execution result"
                ))
            })?;
            BackupPayload::Insert(InsertBackup {
                inserted_id_range: inserted_id_range(execution),
                inserted_count: execution.affected_rows,
            })
        }
        StatementKind::Other => return Ok(None),
    };

    debug!(
        table,
        ?phase,
        operation = %payload.operation_type(),
        rows = payload.row_count(),
        "captured backup payload"
    );
    Ok(Some(payload))
}

/// `[insert_id, insert_id + affected_rows - 1]`, assuming one contiguous
/// batch on a single auto-increment column. `None` when the executor did
/// not report a usable identity or nothing was inserted.
#[must_use]
pub fn inserted_id_range(execution: &ExecutionResult) -> Option<IdRange> {
    let start = execution.insert_id.filter(|id| *id > 0)?;
    if execution.affected_rows == 0 {
        return None;
    }
    let count = i64::try_from(execution.affected_rows).ok()?;
    let end = start.checked_add(count - 1)?;
    Some(IdRange { start, end })
}

fn select_matching<E>(
    executor: &mut E,
    table: &str,
    sql: &str,
    params: &[Value],
    classifier: &dyn StatementClassifier,
) -> Result<Vec<RowImage>, HistoryError>
where
    E: SqlExecutor + ?Sized,
{
    let Some(filter) = classifier.where_clause(sql) else {
        return select_rows(executor, table, None, None, &[]);
    };

    let bound = filter
        .parameters
        .iter()
        .map(|index| params.get(*index).cloned())
        .collect::<Option<Vec<_>>>();
    let Some(bound) = bound else {
        let needed = filter.parameters.iter().max().map_or(0, |index| index + 1);
        return Err(HistoryError::SnapshotCaptureFailed(format!(
            "{table}: filter uses parameter {needed} but {} were bound",
            params.len()
        )));
    };
    select_rows(
        executor,
        table,
        filter.table_alias.as_deref(),
        Some(&filter.condition),
        &bound,
    )
}

fn select_rows<E>(
    executor: &mut E,
    table: &str,
    alias: Option<&str>,
    condition: Option<&str>,
    params: &[Value],
) -> Result<Vec<RowImage>, HistoryError>
where
    E: SqlExecutor + ?Sized,
{
    let mut query = format!("SELECT * FROM {}", executor.quote_identifier(table));
    if let Some(alias) = alias {
        query.push_str(" AS ");
        query.push_str(alias);
    }
    if let Some(condition) = condition {
        query.push_str(" WHERE ");
        query.push_str(condition);
    }

    executor
        .execute(&query, params)
        .map(|result| result.rows)
        .map_err(|err| capture_failed(table, &err))
}

fn capture_failed(table: &str, err: &anyhow::Error) -> HistoryError {
    HistoryError::SnapshotCaptureFailed(format!("{table}: {err:#}"))
}
