use std::collections::{HashMap, VecDeque};

use anyhow::anyhow;
use serde_json::Value;

use crate::{ExecutionResult, RowImage, SqlExecutor};

pub(crate) fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

pub(crate) fn row(value: Value) -> RowImage {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object fixture, got {other}"),
    }
}

/// Scripted executor that records every call it receives.
///
/// Responses are popped in order; an exhausted script answers with an empty
/// success. Statements containing a registered failure fragment error out.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    pub(crate) statements: Vec<(String, Vec<Value>)>,
    pub(crate) events: Vec<&'static str>,
    pub(crate) responses: VecDeque<ExecutionResult>,
    pub(crate) schemas: HashMap<String, String>,
    pub(crate) failing_fragments: Vec<String>,
}

impl RecordingExecutor {
    pub(crate) fn respond(mut self, result: ExecutionResult) -> Self {
        self.responses.push_back(result);
        self
    }

    pub(crate) fn respond_rows(self, rows: Vec<RowImage>) -> Self {
        self.respond(ExecutionResult {
            columns: rows
                .first()
                .map(|first| first.keys().cloned().collect())
                .unwrap_or_default(),
            rows,
            ..ExecutionResult::default()
        })
    }

    pub(crate) fn with_schema(mut self, table: &str, create_statement: &str) -> Self {
        self.schemas
            .insert(table.to_string(), create_statement.to_string());
        self
    }

    pub(crate) fn failing_on(mut self, fragment: &str) -> Self {
        self.failing_fragments.push(fragment.to_string());
        self
    }

    pub(crate) fn sql(&self) -> Vec<&str> {
        self.statements.iter().map(|(sql, _)| sql.as_str()).collect()
    }
}

impl SqlExecutor for RecordingExecutor {
    fn execute(&mut self, sql: &str, params: &[Value]) -> anyhow::Result<ExecutionResult> {
        self.statements.push((sql.to_string(), params.to_vec()));
        if self
            .failing_fragments
            .iter()
            .any(|fragment| sql.contains(fragment.as_str()))
        {
            return Err(anyhow!("scripted failure for {sql}"));
        }
        Ok(self.responses.pop_front().unwrap_or_default())
    }

    fn describe_table(&mut self, table: &str) -> anyhow::Result<String> {
        self.schemas
            .get(table)
            .cloned()
            .ok_or_else(|| anyhow!("no such table: {table}"))
    }

    fn begin(&mut self) -> anyhow::Result<()> {
        self.events.push("begin");
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        self.events.push("commit");
        Ok(())
    }

    fn abort(&mut self) -> anyhow::Result<()> {
        self.events.push("abort");
        Ok(())
    }
}
