use std::sync::Mutex;

use anyhow::anyhow;

use crate::{
    format_ledger_timestamp, now_utc, HistoryFilter, HistoryLedger, HistoryRecord,
    NewHistoryRecord, PurgeScope,
};

/// Process-local ledger. Nothing survives a restart; used for embedding and
/// tests where durability is not wanted.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    last_id: i64,
    records: Vec<HistoryRecord>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory ledger lock poisoned"))
    }
}

impl HistoryLedger for InMemoryLedger {
    fn append(&self, record: &NewHistoryRecord) -> anyhow::Result<HistoryRecord> {
        let mut state = self.lock()?;
        let mut timestamp = format_ledger_timestamp(now_utc())?;
        if let Some(latest) = state
            .records
            .iter()
            .filter(|existing| existing.session_id == record.session_id)
            .map(|existing| existing.timestamp.as_str())
            .max()
        {
            if latest > timestamp.as_str() {
                timestamp = latest.to_string();
            }
        }

        state.last_id += 1;
        let stored = HistoryRecord {
            id: state.last_id,
            session_id: record.session_id,
            timestamp,
            operation_type: record.operation_type,
            target_table: record.target_table.clone(),
            sql_query: record.sql_query.clone(),
            backup_payload: record.backup_payload.clone(),
            affected_rows: record.affected_rows,
            description: record.description.clone(),
        };
        state.records.push(stored.clone());
        Ok(stored)
    }

    fn list(&self, filter: &HistoryFilter, limit: usize) -> anyhow::Result<Vec<HistoryRecord>> {
        let state = self.lock()?;
        let mut matching = state
            .records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|left, right| {
            right
                .timestamp
                .cmp(&left.timestamp)
                .then_with(|| right.id.cmp(&left.id))
        });
        matching.truncate(limit);
        Ok(matching)
    }

    fn get(&self, id: i64) -> anyhow::Result<Option<HistoryRecord>> {
        let state = self.lock()?;
        Ok(state.records.iter().find(|record| record.id == id).cloned())
    }

    fn clear(&self, scope: PurgeScope) -> anyhow::Result<usize> {
        let mut state = self.lock()?;
        let before = state.records.len();
        match scope {
            PurgeScope::Session(session_id) => {
                state.records.retain(|record| record.session_id != session_id);
            }
            PurgeScope::AllSessions => state.records.clear(),
        }
        Ok(before - state.records.len())
    }
}
