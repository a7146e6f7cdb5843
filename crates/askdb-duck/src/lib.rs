//! DuckDB execution gateway with bounded time and row budgets.
//!
//! Each call opens its own read-only connection inside `spawn_blocking`, so
//! the connection lives entirely within the call scope and is released on
//! every exit path. The wall-clock timeout and the fetched-row cap are
//! enforced here independently of the validator's injected LIMIT.

use std::path::PathBuf;
use std::time::Duration;

use duckdb::{AccessMode, Config, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use askdb_sql::ValidatedQuery;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Row budget exceeded: more than {0} rows fetched")]
    RowLimitExceeded(usize),

    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Execution failed: {0}")]
    Execution(String),
}

/// Per-call execution budget, fixed at session start.
#[derive(Debug, Clone)]
pub struct ExecBudget {
    pub timeout: Duration,
    /// Hard cap on fetched rows, independent of the query's LIMIT.
    pub max_rows: usize,
}

impl Default for ExecBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_rows: 10_000,
        }
    }
}

/// Bounded ordered rows plus column metadata. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
}

/// Read-only executor for validated queries against one DuckDB database.
pub struct ExecutionGateway {
    db_path: PathBuf,
}

impl ExecutionGateway {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Execute a validated query within the budget.
    ///
    /// The blocking closure owns the connection; a timeout abandons the call
    /// and the connection is dropped when the closure finishes.
    pub async fn execute(
        &self,
        query: &ValidatedQuery,
        budget: &ExecBudget,
    ) -> Result<ResultSet, ExecError> {
        let sql = query.sql();
        let path = self.db_path.clone();
        let max_rows = budget.max_rows;

        let task = tokio::task::spawn_blocking(move || run_query(&path, &sql, max_rows));

        match tokio::time::timeout(budget.timeout, task).await {
            Err(_) => {
                tracing::warn!(timeout = ?budget.timeout, "query execution timed out");
                Err(ExecError::Timeout(budget.timeout))
            }
            Ok(Err(join_err)) => Err(ExecError::Execution(join_err.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn run_query(path: &PathBuf, sql: &str, max_rows: usize) -> Result<ResultSet, ExecError> {
    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
    let conn = Connection::open_with_flags(path, config)?;

    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let mut columns: Vec<String> = Vec::new();
    let mut result_rows: Vec<Vec<serde_json::Value>> = Vec::new();

    while let Some(row) = rows.next()? {
        if columns.is_empty() {
            let count = row.as_ref().column_count();
            for i in 0..count {
                columns.push(row.as_ref().column_name(i)?.to_string());
            }
        }

        if result_rows.len() >= max_rows {
            return Err(ExecError::RowLimitExceeded(max_rows));
        }

        let mut json_row = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            json_row.push(value_to_json(row.get_ref(i)?));
        }
        result_rows.push(json_row);
    }

    let row_count = result_rows.len();
    Ok(ResultSet {
        columns,
        rows: result_rows,
        row_count,
    })
}

fn value_to_json(value: duckdb::types::ValueRef<'_>) -> serde_json::Value {
    use duckdb::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Boolean(b) => serde_json::Value::Bool(b),
        ValueRef::TinyInt(i) => serde_json::json!(i),
        ValueRef::SmallInt(i) => serde_json::json!(i),
        ValueRef::Int(i) => serde_json::json!(i),
        ValueRef::BigInt(i) => serde_json::json!(i),
        ValueRef::HugeInt(i) => serde_json::json!(i),
        ValueRef::UTinyInt(i) => serde_json::json!(i),
        ValueRef::USmallInt(i) => serde_json::json!(i),
        ValueRef::UInt(i) => serde_json::json!(i),
        ValueRef::UBigInt(i) => serde_json::json!(i),
        ValueRef::Float(f) => serde_json::json!(f),
        ValueRef::Double(f) => serde_json::json!(f),
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).to_string()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
        _ => serde_json::Value::String("<unsupported>".to_string()),
    }
}
