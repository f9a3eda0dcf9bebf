//! Inverse-statement planning and best-effort replay.
//!
//! A restore is split in two: [`plan_rollback`] turns a history record into
//! the inverse statements (pure, no I/O) and [`execute_rollback_plan`] issues
//! them one by one, counting what succeeded. [`rollback`] runs both and
//! appends the auditable ROLLBACK record.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    segment_name, BackupPayload, HistoryError, HistoryLedger, HistoryRecord, IdRange,
    NewHistoryRecord, OperationType, RowImage, SessionContext, SqlExecutor, IDENTITY_COLUMN,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// When a prerequisite fails, the remaining statements are not issued.
    pub prerequisite: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollbackPlan {
    pub statements: Vec<RollbackStatement>,
    /// One reason per captured row that cannot be restored.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Success,
    Partial,
    Failed,
}

impl RollbackStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackResult {
    pub version_id: i64,
    pub operation_type: OperationType,
    pub target_table: Option<String>,
    pub status: RollbackStatus,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub affected_rows: u64,
    pub failures: Vec<String>,
    pub message: String,
    /// Version id of the appended ROLLBACK record, if one was written.
    pub rollback_record_id: Option<i64>,
    /// Set when the ROLLBACK record could not be appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_warning: Option<String>,
}

impl RollbackResult {
    /// The error view of a non-successful outcome.
    #[must_use]
    pub fn failure(&self) -> Option<HistoryError> {
        match self.status {
            RollbackStatus::Success => None,
            RollbackStatus::Partial | RollbackStatus::Failed => {
                Some(HistoryError::RollbackPartialFailure {
                    version_id: self.version_id,
                    attempted: self.attempted,
                    succeeded: self.succeeded,
                })
            }
        }
    }
}

/// Builds the inverse statements for `record`.
///
/// # Errors
/// Returns [`HistoryError::NoBackupAvailable`] for records without a
/// payload, [`HistoryError::UnreversibleOperation`] for ROLLBACK records,
/// INSERTs without an identity range and records without a target table,
/// and [`HistoryError::InvalidBackup`] when the payload cannot be decoded.
pub fn plan_rollback<E>(record: &HistoryRecord, executor: &E) -> Result<RollbackPlan, HistoryError>
where
    E: SqlExecutor + ?Sized,
{
    if record.operation_type == OperationType::Rollback {
        return Err(unreversible(record, "rolling back a rollback is not supported"));
    }

    let Some(payload) = record.decode_backup()? else {
        return Err(HistoryError::NoBackupAvailable(record.id));
    };

    let table = match (&payload, record.target_table.as_deref()) {
        (BackupPayload::CreateTable(backup), _) => backup.table_name.clone(),
        (_, Some(table)) => table.to_string(),
        (_, None) => return Err(unreversible(record, "record has no target table")),
    };
    let quoted_table = executor.quote_identifier(&table);

    let mut plan = RollbackPlan::default();
    match payload {
        BackupPayload::Delete(backup) => {
            for row in &backup.deleted_rows {
                push_insert(&mut plan, executor, &quoted_table, row);
            }
        }
        BackupPayload::Update(backup) => {
            for row in &backup.original_rows {
                push_update(&mut plan, executor, &quoted_table, row);
            }
        }
        BackupPayload::Insert(backup) => {
            let Some(range) = backup.inserted_id_range else {
                return Err(unreversible(
                    record,
                    "no inserted id range was captured; remove the inserted rows manually",
                ));
            };
            plan.statements
                .push(delete_inserted(executor, &quoted_table, range));
        }
        BackupPayload::CreateTable(_) => plan.statements.push(RollbackStatement {
            sql: format!("DROP TABLE IF EXISTS {quoted_table}"),
            params: Vec::new(),
            prerequisite: false,
        }),
        BackupPayload::DropTable(backup) => {
            plan.statements.push(RollbackStatement {
                sql: backup.create_statement.clone(),
                params: Vec::new(),
                prerequisite: true,
            });
            for row in &backup.rows {
                push_insert(&mut plan, executor, &quoted_table, row);
            }
        }
    }

    Ok(plan)
}

/// Issues every statement of `plan`, continuing past per-row failures.
///
/// Statements are not wrapped in a transaction: rows restored before a
/// failure stay restored and the result reports the split.
pub fn execute_rollback_plan<E>(
    record: &HistoryRecord,
    plan: &RollbackPlan,
    executor: &mut E,
) -> RollbackResult
where
    E: SqlExecutor + ?Sized,
{
    let mut attempted = 0;
    let mut succeeded = 0;
    let mut affected_rows = 0_u64;
    let mut failures = Vec::new();

    for (index, statement) in plan.statements.iter().enumerate() {
        attempted += 1;
        match executor.execute(&statement.sql, &statement.params) {
            Ok(result) => {
                succeeded += 1;
                affected_rows += result.affected_rows;
            }
            Err(err) => {
                failures.push(format!("statement {}: {err:#}", index + 1));
                if statement.prerequisite {
                    break;
                }
            }
        }
    }

    let skipped = plan.skipped.len();
    let status = if failures.is_empty() && skipped == 0 {
        RollbackStatus::Success
    } else if succeeded > 0 {
        RollbackStatus::Partial
    } else {
        RollbackStatus::Failed
    };

    let subject = describe_subject(record);
    let message = match status {
        RollbackStatus::Success => format!(
            "restored version {} ({subject}): {succeeded} statement(s), {affected_rows} row(s) affected",
            record.id
        ),
        RollbackStatus::Partial => format!(
            "partially restored version {} ({subject}): {succeeded} of {attempted} statement(s) applied, {skipped} row(s) skipped",
            record.id
        ),
        RollbackStatus::Failed => format!(
            "failed to restore version {} ({subject}): {}",
            record.id,
            failures
                .first()
                .or_else(|| plan.skipped.first())
                .map_or("nothing could be restored", String::as_str)
        ),
    };

    RollbackResult {
        version_id: record.id,
        operation_type: record.operation_type,
        target_table: record.target_table.clone(),
        status,
        attempted,
        succeeded,
        skipped,
        affected_rows,
        failures,
        message,
        rollback_record_id: None,
        record_warning: None,
    }
}

/// Plans and replays the inverse of `record`, then appends a ROLLBACK record
/// unless nothing at all was applied.
///
/// # Errors
/// Propagates the refusals of [`plan_rollback`]; no statement has been
/// issued when an error is returned.
pub fn rollback<E, L>(
    ctx: &SessionContext,
    record: &HistoryRecord,
    executor: &mut E,
    ledger: &L,
) -> Result<RollbackResult, HistoryError>
where
    E: SqlExecutor + ?Sized,
    L: HistoryLedger + ?Sized,
{
    let plan = plan_rollback(record, executor)?;
    for reason in &plan.skipped {
        warn!(version_id = record.id, reason = reason.as_str(), "row skipped during rollback");
    }

    let mut result = execute_rollback_plan(record, &plan, executor);
    match result.status {
        RollbackStatus::Success => info!(
            version_id = record.id,
            affected_rows = result.affected_rows,
            "rollback applied"
        ),
        RollbackStatus::Partial => warn!(
            version_id = record.id,
            attempted = result.attempted,
            succeeded = result.succeeded,
            skipped = result.skipped,
            "rollback partially applied"
        ),
        RollbackStatus::Failed => error!(
            version_id = record.id,
            failures = ?result.failures,
            "rollback failed"
        ),
    }

    if result.status == RollbackStatus::Failed && result.succeeded == 0 {
        return Ok(result);
    }

    let marker = rollback_record(ctx, record, &plan, &result);
    match ledger.append(&marker) {
        Ok(appended) => result.rollback_record_id = Some(appended.id),
        Err(err) => {
            warn!(version_id = record.id, error = %err, "failed to record rollback in history");
            result.record_warning = Some(format!("rollback was not recorded in history: {err:#}"));
        }
    }
    Ok(result)
}

fn rollback_record(
    ctx: &SessionContext,
    record: &HistoryRecord,
    plan: &RollbackPlan,
    result: &RollbackResult,
) -> NewHistoryRecord {
    let statements = plan
        .statements
        .iter()
        .map(|statement| statement.sql.as_str())
        .collect::<Vec<_>>()
        .join(";\n");

    NewHistoryRecord {
        session_id: ctx.session_id,
        operation_type: OperationType::Rollback,
        target_table: record.target_table.clone(),
        sql_query: format!("/* rollback of version {} */\n{statements}", record.id),
        backup_payload: None,
        affected_rows: result.affected_rows,
        description: format!(
            "Rollback of version {} ({}): {}",
            record.id,
            describe_subject(record),
            result.status.as_str()
        ),
    }
}

fn describe_subject(record: &HistoryRecord) -> String {
    match record.target_table.as_deref() {
        Some(table) => format!("{} on {table}", record.operation_type),
        None => record.operation_type.to_string(),
    }
}

fn unreversible(record: &HistoryRecord, reason: &str) -> HistoryError {
    HistoryError::UnreversibleOperation {
        version_id: record.id,
        reason: reason.to_string(),
    }
}

fn push_insert<E>(plan: &mut RollbackPlan, executor: &E, quoted_table: &str, row: &RowImage)
where
    E: SqlExecutor + ?Sized,
{
    if row.is_empty() {
        plan.skipped.push("row image has no columns".to_string());
        return;
    }

    let columns = row
        .keys()
        .map(|column| executor.quote_identifier(&segment_name(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; row.len()].join(", ");
    plan.statements.push(RollbackStatement {
        sql: format!("INSERT INTO {quoted_table} ({columns}) VALUES ({placeholders})"),
        params: row
            .values()
            .map(|value| executor.normalize_value(value))
            .collect(),
        prerequisite: false,
    });
}

fn push_update<E>(plan: &mut RollbackPlan, executor: &E, quoted_table: &str, row: &RowImage)
where
    E: SqlExecutor + ?Sized,
{
    let Some(id) = row.get(IDENTITY_COLUMN).filter(|id| !id.is_null()) else {
        plan.skipped
            .push(format!("row without an {IDENTITY_COLUMN} column cannot be matched"));
        return;
    };

    let assignments = row
        .iter()
        .filter(|(column, _)| column.as_str() != IDENTITY_COLUMN)
        .collect::<Vec<_>>();
    if assignments.is_empty() {
        plan.skipped
            .push(format!("row {id} has no columns besides {IDENTITY_COLUMN}"));
        return;
    }

    let set_clause = assignments
        .iter()
        .map(|(column, _)| {
            format!(
                "{} = ?",
                executor.quote_identifier(&segment_name(column))
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let mut params = assignments
        .iter()
        .map(|(_, value)| executor.normalize_value(value))
        .collect::<Vec<_>>();
    params.push(id.clone());

    plan.statements.push(RollbackStatement {
        sql: format!(
            "UPDATE {quoted_table} SET {set_clause} WHERE {} = ?",
            executor.quote_identifier(IDENTITY_COLUMN)
        ),
        params,
        prerequisite: false,
    });
}

fn delete_inserted<E>(executor: &E, quoted_table: &str, range: IdRange) -> RollbackStatement
where
    E: SqlExecutor + ?Sized,
{
    let id_column = executor.quote_identifier(IDENTITY_COLUMN);
    if range.is_single() {
        RollbackStatement {
            sql: format!("DELETE FROM {quoted_table} WHERE {id_column} = ?"),
            params: vec![json!(range.start)],
            prerequisite: false,
        }
    } else {
        RollbackStatement {
            sql: format!("DELETE FROM {quoted_table} WHERE {id_column} BETWEEN ? AND ?"),
            params: vec![json!(range.start), json!(range.end)],
            prerequisite: false,
        }
    }
}
