use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capture::{capture, CapturePhase};
use crate::classify::{HeuristicClassifier, StatementClassifier};
use crate::rollback::{rollback, RollbackResult};
use crate::{
    BackupPayload, Classification, ExecutionResult, HistoryError, HistoryFilter, HistoryLedger,
    HistoryQuery, HistoryRecord, NewHistoryRecord, OperationType, Permissions, PurgeScope,
    SessionContext, SqlExecutor, StatementKind,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ClassificationAmbiguous,
    SnapshotCaptureFailed,
    LedgerWriteFailed,
}

/// A degradation on the write path: the write went through, its protection
/// did not.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl WriteWarning {
    fn from_error(err: &HistoryError) -> Self {
        let kind = match err {
            HistoryError::ClassificationAmbiguous(_) => WarningKind::ClassificationAmbiguous,
            HistoryError::LedgerWriteFailed(_) | HistoryError::Ledger(_) => {
                WarningKind::LedgerWriteFailed
            }
            _ => WarningKind::SnapshotCaptureFailed,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteReport {
    pub classification: Classification,
    pub execution: ExecutionResult,
    /// The appended history record; `None` for unrecorded kinds or when the
    /// ledger append failed.
    pub record: Option<HistoryRecord>,
    pub warnings: Vec<WriteWarning>,
}

/// Orchestrates classification, capture, history and restore.
pub struct VersionControl<L> {
    ledger: L,
    classifier: Box<dyn StatementClassifier>,
    permissions: Permissions,
}

impl<L: HistoryLedger> VersionControl<L> {
    pub fn new(ledger: L, permissions: Permissions) -> Self {
        Self {
            ledger,
            classifier: Box::new(HeuristicClassifier),
            permissions,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: impl StatementClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn classify(&self, sql: &str) -> Classification {
        self.classifier.classify(sql)
    }

    /// Captures and appends the history record for one write.
    ///
    /// UPDATE/DELETE/DROP must be recorded before the statement runs;
    /// INSERT and CREATE TABLE after, with `execution` set. Returns
    /// `Ok(None)` when no write permission is enabled or the kind is never
    /// recorded. A failed capture is logged and the record is appended with
    /// a null payload.
    ///
    /// The recorded `affected_rows` is taken from `execution` when the host
    /// passes one. Pre-execution records have none, so they count the
    /// captured snapshot rows, which are the rows the statement is about to
    /// touch; without a snapshot the count is 0.
    ///
    /// # Errors
    /// Returns [`HistoryError::LedgerWriteFailed`] when the append fails.
    #[allow(clippy::too_many_arguments)]
    pub fn record_write<E>(
        &self,
        ctx: &SessionContext,
        kind: StatementKind,
        sql: &str,
        params: &[Value],
        target_table: Option<&str>,
        execution: Option<&ExecutionResult>,
        executor: &mut E,
    ) -> Result<Option<HistoryRecord>, HistoryError>
    where
        E: SqlExecutor + ?Sized,
    {
        if !self.permissions.any_write_enabled() {
            return Ok(None);
        }
        let Some(operation_type) = kind.operation_type() else {
            return Ok(None);
        };

        let payload = match capture(
            kind,
            target_table,
            sql,
            params,
            execution,
            executor,
            self.classifier.as_ref(),
        ) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "backup skipped, write proceeds unprotected");
                None
            }
        };

        let affected_rows = match (execution, payload.as_ref()) {
            (Some(result), _) => result.affected_rows,
            (None, Some(payload)) => u64::try_from(payload.row_count()).unwrap_or(u64::MAX),
            (None, None) => 0,
        };
        self.append(
            ctx,
            operation_type,
            target_table,
            sql,
            payload.as_ref(),
            affected_rows,
        )
        .map(Some)
    }

    /// Runs one write as a single unit of work: pre-state capture, the
    /// statement, post-state capture and commit, then the history append.
    ///
    /// # Errors
    /// Returns [`HistoryError::PermissionDenied`] before anything runs when
    /// the statement kind is not enabled, and [`HistoryError::Execution`]
    /// when the statement or its unit of work fails; the unit of work is
    /// aborted and nothing is recorded. Capture and ledger failures are
    /// reported as warnings instead.
    pub fn execute_write<E>(
        &self,
        ctx: &SessionContext,
        executor: &mut E,
        sql: &str,
        params: &[Value],
    ) -> Result<WriteReport, HistoryError>
    where
        E: SqlExecutor + ?Sized,
    {
        let classification = self.classifier.classify(sql);
        debug!(
            kind = ?classification.kind,
            target_table = classification.target_table.as_deref(),
            multi_statement = classification.multi_statement,
            "classified write"
        );
        self.permissions.authorize(classification.kind)?;

        let phase = CapturePhase::for_kind(classification.kind);
        let mut warnings = Vec::new();
        let mut payload = None;

        executor
            .begin()
            .map_err(|err| HistoryError::Execution(format!("failed to begin unit of work: {err:#}")))?;

        if phase == Some(CapturePhase::BeforeExecution) {
            payload = self.capture_or_warn(&classification, sql, params, None, executor, &mut warnings);
        }

        let execution = match executor.execute(sql, params) {
            Ok(execution) => execution,
            Err(err) => {
                abort_quietly(executor);
                return Err(HistoryError::Execution(format!("{err:#}")));
            }
        };

        if phase == Some(CapturePhase::AfterExecution) {
            payload = self.capture_or_warn(
                &classification,
                sql,
                params,
                Some(&execution),
                executor,
                &mut warnings,
            );
        }

        if let Err(err) = executor.commit() {
            abort_quietly(executor);
            return Err(HistoryError::Execution(format!("failed to commit: {err:#}")));
        }

        let record = match classification.kind.operation_type() {
            Some(operation_type) => match self.append(
                ctx,
                operation_type,
                classification.target_table.as_deref(),
                sql,
                payload.as_ref(),
                execution.affected_rows,
            ) {
                Ok(record) => Some(record),
                Err(err) => {
                    warnings.push(WriteWarning::from_error(&err));
                    None
                }
            },
            None => None,
        };

        Ok(WriteReport {
            classification,
            execution,
            record,
            warnings,
        })
    }

    /// History records newest first, scoped to the caller's session unless
    /// `query.session_only` is off.
    ///
    /// # Errors
    /// Returns [`HistoryError::Ledger`] when the ledger cannot be read.
    pub fn list_history(
        &self,
        ctx: &SessionContext,
        query: &HistoryQuery,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, HistoryError> {
        let filter = HistoryFilter {
            session_id: query.session_only.then_some(ctx.session_id),
            operation_type: query.operation_type,
            target_table: query.target_table.clone(),
        };
        self.ledger
            .list(&filter, limit)
            .map_err(|err| HistoryError::Ledger(format!("{err:#}")))
    }

    /// # Errors
    /// Returns [`HistoryError::VersionNotFound`] for unknown ids.
    pub fn get_version(&self, version_id: i64) -> Result<HistoryRecord, HistoryError> {
        self.ledger
            .get(version_id)
            .map_err(|err| HistoryError::Ledger(format!("{err:#}")))?
            .ok_or(HistoryError::VersionNotFound(version_id))
    }

    /// Replays the inverse of a recorded operation. Records from any session
    /// can be restored; the ROLLBACK record belongs to the caller's session.
    ///
    /// # Errors
    /// Returns [`HistoryError::VersionNotFound`],
    /// [`HistoryError::NoBackupAvailable`] or
    /// [`HistoryError::UnreversibleOperation`] without touching the target
    /// database.
    pub fn restore<E>(
        &self,
        ctx: &SessionContext,
        version_id: i64,
        executor: &mut E,
    ) -> Result<RollbackResult, HistoryError>
    where
        E: SqlExecutor + ?Sized,
    {
        let record = self.get_version(version_id)?;
        rollback(ctx, &record, executor, &self.ledger)
    }

    /// Irreversibly removes history in `scope`. Confirmation for a global
    /// purge belongs to the caller.
    ///
    /// # Errors
    /// Returns [`HistoryError::Ledger`] when the ledger rejects the delete.
    pub fn purge_history(&self, scope: PurgeScope) -> Result<usize, HistoryError> {
        let removed = self
            .ledger
            .clear(scope)
            .map_err(|err| HistoryError::Ledger(format!("{err:#}")))?;
        info!(?scope, removed, "purged history");
        Ok(removed)
    }

    fn capture_or_warn<E>(
        &self,
        classification: &Classification,
        sql: &str,
        params: &[Value],
        execution: Option<&ExecutionResult>,
        executor: &mut E,
        warnings: &mut Vec<WriteWarning>,
    ) -> Option<BackupPayload>
    where
        E: SqlExecutor + ?Sized,
    {
        match capture(
            classification.kind,
            classification.target_table.as_deref(),
            sql,
            params,
            execution,
            executor,
            self.classifier.as_ref(),
        ) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "backup skipped, write proceeds unprotected");
                warnings.push(WriteWarning::from_error(&err));
                None
            }
        }
    }

    fn append(
        &self,
        ctx: &SessionContext,
        operation_type: OperationType,
        target_table: Option<&str>,
        sql: &str,
        payload: Option<&BackupPayload>,
        affected_rows: u64,
    ) -> Result<HistoryRecord, HistoryError> {
        let backup_payload = payload.map(BackupPayload::to_json).transpose()?;
        let description = describe_write(operation_type, target_table, affected_rows, payload.is_some());
        let record = NewHistoryRecord {
            session_id: ctx.session_id,
            operation_type,
            target_table: target_table.map(str::to_string),
            sql_query: sql.to_string(),
            backup_payload,
            affected_rows,
            description,
        };

        match self.ledger.append(&record) {
            Ok(stored) => {
                info!(
                    version_id = stored.id,
                    operation = %operation_type,
                    target_table,
                    "recorded write in history"
                );
                Ok(stored)
            }
            Err(err) => {
                warn!(error = %err, "history append failed, write is unprotected");
                Err(HistoryError::LedgerWriteFailed(format!("{err:#}")))
            }
        }
    }
}

fn abort_quietly<E: SqlExecutor + ?Sized>(executor: &mut E) {
    if let Err(err) = executor.abort() {
        warn!(error = %err, "failed to abort unit of work");
    }
}

fn describe_write(
    operation_type: OperationType,
    target_table: Option<&str>,
    affected_rows: u64,
    protected: bool,
) -> String {
    let table = target_table.unwrap_or("an undetermined table");
    let summary = match operation_type {
        OperationType::Insert => format!("Inserted {affected_rows} row(s) into {table}"),
        OperationType::Update => format!("Updated {affected_rows} row(s) in {table}"),
        OperationType::Delete => format!("Deleted {affected_rows} row(s) from {table}"),
        OperationType::CreateTable => format!("Created table {table}"),
        OperationType::DropTable => format!("Dropped table {table}"),
        OperationType::Rollback => format!("Rolled back changes to {table}"),
    };
    if protected {
        summary
    } else {
        format!("{summary} (no backup)")
    }
}
