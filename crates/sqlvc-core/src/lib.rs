//! Version-control and rollback engine for audited SQL writes.
//!
//! The engine classifies a write statement, captures enough pre- or
//! post-state to reverse it, appends a session-scoped record to a durable
//! ledger and, on demand, replays the inverse of a recorded operation.
//!
//! Collaborators are reached through two traits:
//! - [`SqlExecutor`] runs SQL against the target database.
//! - [`HistoryLedger`] persists [`HistoryRecord`]s.
//!
//! [`VersionControl`] wires them together.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod capture;
mod classify;
mod engine;
mod ledger;
mod rollback;
#[cfg(test)]
mod test_support;
mod value;

pub use capture::{capture, inserted_id_range, CapturePhase};
pub use classify::{
    scan_where_clause, FilterClause, HeuristicClassifier, StatementClassifier,
};
pub use engine::{VersionControl, WarningKind, WriteReport, WriteWarning};
pub use ledger::InMemoryLedger;
pub use rollback::{
    execute_rollback_plan, plan_rollback, rollback, RollbackPlan, RollbackResult,
    RollbackStatement, RollbackStatus,
};
pub use value::{identifier_segments, normalize_datetime_value, quote_identifier, segment_name};

/// A single captured row: column name to value, in column order.
pub type RowImage = Map<String, Value>;

/// Identity column assumed by INSERT and UPDATE reversal.
pub const IDENTITY_COLUMN: &str = "id";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("classification ambiguous: {0}")]
    ClassificationAmbiguous(String),
    #[error("snapshot capture failed: {0}")]
    SnapshotCaptureFailed(String),
    #[error("ledger write failed: {0}")]
    LedgerWriteFailed(String),
    #[error("version {0} not found in history")]
    VersionNotFound(i64),
    #[error("version {0} has no backup payload to restore from")]
    NoBackupAvailable(i64),
    #[error("rollback of version {version_id} partially failed: {succeeded} of {attempted} statements applied")]
    RollbackPartialFailure {
        version_id: i64,
        attempted: usize,
        succeeded: usize,
    },
    #[error("version {version_id} cannot be reversed automatically: {reason}")]
    UnreversibleOperation { version_id: i64, reason: String },
    #[error("invalid backup payload: {0}")]
    InvalidBackup(String),
    #[error("statement execution failed: {0}")]
    Execution(String),
    #[error("permission denied: {0} operations are disabled")]
    PermissionDenied(String),
    #[error("ledger error: {0}")]
    Ledger(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    Rollback,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::CreateTable => "CREATE_TABLE",
            Self::DropTable => "DROP_TABLE",
            Self::Rollback => "ROLLBACK",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "CREATE_TABLE" => Some(Self::CreateTable),
            "DROP_TABLE" => Some(Self::DropTable),
            "ROLLBACK" => Some(Self::Rollback),
            _ => None,
        }
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect class of an arbitrary SQL statement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    Other,
}

impl StatementKind {
    /// Ledger operation type for reversible kinds, `None` for [`Self::Other`].
    #[must_use]
    pub fn operation_type(self) -> Option<OperationType> {
        match self {
            Self::Insert => Some(OperationType::Insert),
            Self::Update => Some(OperationType::Update),
            Self::Delete => Some(OperationType::Delete),
            Self::CreateTable => Some(OperationType::CreateTable),
            Self::DropTable => Some(OperationType::DropTable),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Classification {
    pub kind: StatementKind,
    pub target_table: Option<String>,
    /// Set when the text holds more than one statement; the target is then
    /// never trusted.
    pub multi_statement: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SessionId(pub Ulid);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a session id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`HistoryError::Ledger`] when the text is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, HistoryError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| HistoryError::Ledger(format!("invalid session id {raw}: {err}")))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-call context threaded through every engine operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionContext {
    pub session_id: SessionId,
}

impl SessionContext {
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self::new(SessionId::generate())
    }
}

/// Three-way write policy evaluated at the boundary before the engine runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Permissions {
    pub allow_insert: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
}

impl Permissions {
    #[must_use]
    pub fn all() -> Self {
        Self {
            allow_insert: true,
            allow_update: true,
            allow_delete: true,
        }
    }

    #[must_use]
    pub fn any_write_enabled(&self) -> bool {
        self.allow_insert || self.allow_update || self.allow_delete
    }

    #[must_use]
    pub fn permits(&self, kind: StatementKind) -> bool {
        match kind {
            StatementKind::Insert | StatementKind::CreateTable => self.allow_insert,
            StatementKind::Update => self.allow_update,
            StatementKind::Delete | StatementKind::DropTable => self.allow_delete,
            StatementKind::Other => false,
        }
    }

    /// Refuses statement kinds the policy does not enable.
    ///
    /// # Errors
    /// Returns [`HistoryError::PermissionDenied`] naming the refused class.
    pub fn authorize(&self, kind: StatementKind) -> Result<(), HistoryError> {
        if self.permits(kind) {
            return Ok(());
        }

        let class = match kind {
            StatementKind::Insert | StatementKind::CreateTable => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete | StatementKind::DropTable => "delete",
            StatementKind::Other => "unclassified write",
        };
        Err(HistoryError::PermissionDenied(class.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    #[must_use]
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackup {
    pub deleted_rows: Vec<RowImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBackup {
    pub original_rows: Vec<RowImage>,
}

/// Post-execution INSERT capture.
///
/// The range assumes one auto-increment column named [`IDENTITY_COLUMN`]
/// and a single contiguous batch; gaps or non-contiguous identity
/// assignment make it wrong.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsertBackup {
    pub inserted_id_range: Option<IdRange>,
    pub inserted_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableBackup {
    pub table_name: String,
    pub create_statement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DropTableBackup {
    pub create_statement: String,
    pub rows: Vec<RowImage>,
}

/// Captured state sufficient to invert one write. The persisted document is
/// untagged; the record's operation type selects the shape on decode.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BackupPayload {
    Delete(DeleteBackup),
    Update(UpdateBackup),
    Insert(InsertBackup),
    CreateTable(CreateTableBackup),
    DropTable(DropTableBackup),
}

impl BackupPayload {
    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::Delete(_) => OperationType::Delete,
            Self::Update(_) => OperationType::Update,
            Self::Insert(_) => OperationType::Insert,
            Self::CreateTable(_) => OperationType::CreateTable,
            Self::DropTable(_) => OperationType::DropTable,
        }
    }

    /// Number of row images held by the payload.
    #[must_use]
    pub fn row_count(&self) -> usize {
        match self {
            Self::Delete(backup) => backup.deleted_rows.len(),
            Self::Update(backup) => backup.original_rows.len(),
            Self::DropTable(backup) => backup.rows.len(),
            Self::Insert(_) | Self::CreateTable(_) => 0,
        }
    }

    /// Encodes the payload as its stored JSON document.
    ///
    /// # Errors
    /// Returns [`HistoryError::InvalidBackup`] when serialization fails.
    pub fn to_json(&self) -> Result<Value, HistoryError> {
        serde_json::to_value(self)
            .map_err(|err| HistoryError::InvalidBackup(format!("failed to encode payload: {err}")))
    }

    /// Decodes a stored document using the record's operation type.
    ///
    /// # Errors
    /// Returns [`HistoryError::InvalidBackup`] when the document does not
    /// match the shape for `operation`, or when `operation` never carries a
    /// payload.
    pub fn from_json(operation: OperationType, value: &Value) -> Result<Self, HistoryError> {
        let decoded = match operation {
            OperationType::Delete => serde_json::from_value(value.clone()).map(Self::Delete),
            OperationType::Update => serde_json::from_value(value.clone()).map(Self::Update),
            OperationType::Insert => serde_json::from_value(value.clone()).map(Self::Insert),
            OperationType::CreateTable => {
                serde_json::from_value(value.clone()).map(Self::CreateTable)
            }
            OperationType::DropTable => serde_json::from_value(value.clone()).map(Self::DropTable),
            OperationType::Rollback => {
                return Err(HistoryError::InvalidBackup(
                    "ROLLBACK records never carry a backup payload".to_string(),
                ))
            }
        };

        decoded.map_err(|err| {
            HistoryError::InvalidBackup(format!("payload does not match {operation}: {err}"))
        })
    }
}

/// A record as submitted to [`HistoryLedger::append`]; the ledger assigns
/// `id` and `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewHistoryRecord {
    pub session_id: SessionId,
    pub operation_type: OperationType,
    pub target_table: Option<String>,
    pub sql_query: String,
    pub backup_payload: Option<Value>,
    pub affected_rows: u64,
    pub description: String,
}

/// One immutable ledger entry. `id` is the external version id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub timestamp: String,
    pub operation_type: OperationType,
    pub target_table: Option<String>,
    pub sql_query: String,
    pub backup_payload: Option<Value>,
    pub affected_rows: u64,
    pub description: String,
}

impl HistoryRecord {
    /// Decodes the stored payload, `Ok(None)` when absent.
    ///
    /// # Errors
    /// Returns [`HistoryError::InvalidBackup`] when the stored document does
    /// not match the record's operation type.
    pub fn decode_backup(&self) -> Result<Option<BackupPayload>, HistoryError> {
        self.backup_payload
            .as_ref()
            .map(|value| BackupPayload::from_json(self.operation_type, value))
            .transpose()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryFilter {
    pub session_id: Option<SessionId>,
    pub operation_type: Option<OperationType>,
    pub target_table: Option<String>,
}

impl HistoryFilter {
    #[must_use]
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.session_id
            .map_or(true, |session_id| record.session_id == session_id)
            && self
                .operation_type
                .map_or(true, |operation| record.operation_type == operation)
            && self
                .target_table
                .as_deref()
                .map_or(true, |table| record.target_table.as_deref() == Some(table))
    }
}

/// Listing request as seen by callers; `session_only` scopes to the
/// caller's [`SessionContext`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryQuery {
    pub session_only: bool,
    pub operation_type: Option<OperationType>,
    pub target_table: Option<String>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            session_only: true,
            operation_type: None,
            target_table: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PurgeScope {
    Session(SessionId),
    AllSessions,
}

/// Outcome of one statement handed to a [`SqlExecutor`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<RowImage>,
    pub affected_rows: u64,
    /// First identity value generated by an INSERT batch, when known.
    pub insert_id: Option<i64>,
}

/// SQL executor collaborator for the target database.
///
/// Calls are atomic from the engine's perspective: each either completes or
/// fails. Handles are borrowed for one engine call and never retained.
pub trait SqlExecutor {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<ExecutionResult>;

    /// Canonical `CREATE TABLE` text for `table`.
    #[allow(clippy::missing_errors_doc)]
    fn describe_table(&mut self, table: &str) -> anyhow::Result<String>;

    #[allow(clippy::missing_errors_doc)]
    fn begin(&mut self) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn commit(&mut self) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn abort(&mut self) -> anyhow::Result<()>;

    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name)
    }

    /// Rewrites a captured value into a form the executor accepts back in a
    /// write statement.
    fn normalize_value(&self, value: &Value) -> Value {
        normalize_datetime_value(value)
    }
}

/// Durable, append-only operation history.
///
/// Implementations must serialize concurrent appends so no record is lost
/// and no id is handed out twice.
pub trait HistoryLedger {
    #[allow(clippy::missing_errors_doc)]
    fn append(&self, record: &NewHistoryRecord) -> anyhow::Result<HistoryRecord>;

    /// Records matching `filter`, newest first, at most `limit`.
    #[allow(clippy::missing_errors_doc)]
    fn list(&self, filter: &HistoryFilter, limit: usize) -> anyhow::Result<Vec<HistoryRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, id: i64) -> anyhow::Result<Option<HistoryRecord>>;

    /// Removes records in `scope`, returning how many were removed.
    #[allow(clippy::missing_errors_doc)]
    fn clear(&self, scope: PurgeScope) -> anyhow::Result<usize>;
}

/// Formats a ledger timestamp: UTC, fixed width, microsecond precision, so
/// lexical order matches chronological order.
///
/// # Errors
/// Returns [`HistoryError::Ledger`] when formatting fails.
pub fn format_ledger_timestamp(value: OffsetDateTime) -> Result<String, HistoryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
        ))
        .map_err(|err| HistoryError::Ledger(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn operation_type_round_trips_through_text() {
        for operation in [
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete,
            OperationType::CreateTable,
            OperationType::DropTable,
            OperationType::Rollback,
        ] {
            assert_eq!(OperationType::parse(operation.as_str()), Some(operation));
        }
        assert_eq!(OperationType::parse("insert"), None);
    }

    #[test]
    fn permissions_map_kinds_to_flags() {
        let insert_only = Permissions {
            allow_insert: true,
            ..Permissions::default()
        };
        assert!(insert_only.permits(StatementKind::Insert));
        assert!(insert_only.permits(StatementKind::CreateTable));
        assert!(!insert_only.permits(StatementKind::DropTable));
        assert!(!insert_only.permits(StatementKind::Other));
        assert!(insert_only.any_write_enabled());
        assert!(!Permissions::default().any_write_enabled());

        let err = match insert_only.authorize(StatementKind::Delete) {
            Ok(()) => panic!("delete should be refused"),
            Err(err) => err,
        };
        assert_eq!(err, HistoryError::PermissionDenied("delete".to_string()));
    }

    #[test]
    fn payload_documents_use_stored_key_names() {
        let payload = BackupPayload::Insert(InsertBackup {
            inserted_id_range: Some(IdRange { start: 5, end: 5 }),
            inserted_count: 1,
        });
        assert_eq!(
            must(payload.to_json()),
            json!({"insertedIdRange": {"start": 5, "end": 5}, "insertedCount": 1})
        );

        let decoded = must(BackupPayload::from_json(
            OperationType::Update,
            &json!({"originalRows": [{"id": 5, "name": "a"}]}),
        ));
        assert_eq!(decoded.operation_type(), OperationType::Update);
        assert_eq!(decoded.row_count(), 1);
    }

    #[test]
    fn payload_decode_rejects_mismatched_shape() {
        let err = match BackupPayload::from_json(
            OperationType::Delete,
            &json!({"originalRows": []}),
        ) {
            Ok(_) => panic!("expected shape mismatch"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("payload does not match DELETE"));
        assert!(BackupPayload::from_json(OperationType::Rollback, &json!({})).is_err());
    }

    #[test]
    fn ledger_timestamps_are_fixed_width_and_sortable() {
        let early = must(format_ledger_timestamp(must(OffsetDateTime::from_unix_timestamp(
            1_700_000_000,
        ))));
        let later = must(format_ledger_timestamp(
            must(OffsetDateTime::from_unix_timestamp(1_700_000_000))
                + time::Duration::microseconds(7),
        ));
        assert_eq!(early, "2023-11-14 22:13:20.000000");
        assert_eq!(later, "2023-11-14 22:13:20.000007");
        assert_eq!(early.len(), later.len());
        assert!(early < later);
    }

    #[test]
    fn history_filter_matches_every_populated_field() {
        let session_id = SessionId::generate();
        let record = HistoryRecord {
            id: 1,
            session_id,
            timestamp: "2026-01-01 00:00:00.000000".to_string(),
            operation_type: OperationType::Delete,
            target_table: Some("users".to_string()),
            sql_query: "DELETE FROM users".to_string(),
            backup_payload: None,
            affected_rows: 2,
            description: "fixture".to_string(),
        };

        assert!(HistoryFilter::default().matches(&record));
        assert!(HistoryFilter {
            session_id: Some(session_id),
            operation_type: Some(OperationType::Delete),
            target_table: Some("users".to_string()),
        }
        .matches(&record));
        assert!(!HistoryFilter {
            session_id: Some(SessionId::generate()),
            ..HistoryFilter::default()
        }
        .matches(&record));
        assert!(!HistoryFilter {
            target_table: Some("orders".to_string()),
            ..HistoryFilter::default()
        }
        .matches(&record));
    }
}
