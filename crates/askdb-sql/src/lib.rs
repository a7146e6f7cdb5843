//! SQL validation and sanitization for model-generated candidate queries.
//!
//! Model output is never trusted as executable. Every candidate is re-parsed
//! into a strict grammar subset, identifier-bound against the schema catalog
//! (case-insensitive, canonicalized to catalog casing), checked against a
//! read-only allow-list, and given a clamped row limit. The model is treated
//! symmetrically with the end user as an untrusted input source.

use sqlparser::ast::{Expr, SetExpr, Statement, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use askdb_schema::SchemaCatalog;

mod binder;

#[derive(Debug, Error)]
pub enum ValidateError {
    /// Candidate did not parse. The message carries the parser's diagnostic
    /// position, which feeds the single repair retry.
    #[error("Malformed query: {0}")]
    Malformed(String),

    #[error("Expected a single statement, found {0}")]
    MultiStatement(usize),

    #[error("Not a read-only query: {0}")]
    NotReadOnly(String),

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Disallowed construct: {0}")]
    DisallowedConstruct(String),
}

/// A parsed, identifier-bound, limit-clamped read-only query, safe for
/// execution. Owned solely by the turn that produced it.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    statement: Statement,
    limit: u64,
    tables: Vec<String>,
}

impl ValidatedQuery {
    /// Canonical sanitized SQL text.
    pub fn sql(&self) -> String {
        self.statement.to_string()
    }

    /// Effective row limit after clamping; never exceeds the ceiling passed
    /// to [`validate`].
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Catalog-cased names of the tables the query reads.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

/// Validate candidate text against the catalog and produce a sanitized query.
///
/// The admitted subset is a single plain SELECT over named base tables with
/// JOINs. Set operations, CTEs, subqueries, table functions, window frames
/// and anything else that cannot be identifier-bound against the catalog is
/// rejected rather than guessed at.
pub fn validate(
    candidate: &str,
    catalog: &SchemaCatalog,
    limit_ceiling: u64,
) -> Result<ValidatedQuery, ValidateError> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, candidate)
        .map_err(|e| ValidateError::Malformed(e.to_string()))?;

    match statements.len() {
        0 => return Err(ValidateError::Malformed("empty candidate".into())),
        1 => {}
        n => return Err(ValidateError::MultiStatement(n)),
    }
    let mut statement = statements.remove(0);

    let query = match &mut statement {
        Statement::Query(query) => query,
        other => return Err(ValidateError::NotReadOnly(statement_kind(other).into())),
    };

    if query.with.is_some() {
        return Err(ValidateError::DisallowedConstruct("WITH clause".into()));
    }
    if !query.locks.is_empty() {
        return Err(ValidateError::NotReadOnly("locking clause".into()));
    }
    if !query.limit_by.is_empty() {
        return Err(ValidateError::DisallowedConstruct("LIMIT BY".into()));
    }
    if query.fetch.is_some() {
        return Err(ValidateError::DisallowedConstruct("FETCH clause".into()));
    }

    let select = match &mut *query.body {
        SetExpr::Select(select) => select,
        SetExpr::SetOperation { op, .. } => {
            return Err(ValidateError::DisallowedConstruct(format!("set operation {op}")));
        }
        other => {
            return Err(ValidateError::DisallowedConstruct(format!(
                "query body {}",
                body_kind(other)
            )));
        }
    };

    if select.into.is_some() {
        return Err(ValidateError::NotReadOnly("SELECT INTO".into()));
    }
    if select.top.is_some() {
        return Err(ValidateError::DisallowedConstruct("TOP clause".into()));
    }

    // Bind every identifier against the catalog, canonicalizing casing.
    let bound = binder::bind_select(select, query.order_by.as_mut(), catalog)?;

    // Inject or clamp the row limit. The ceiling always wins over a larger
    // request; a smaller request is kept.
    let effective = match query.limit.take() {
        None => limit_ceiling,
        Some(Expr::Value(Value::Number(n, _))) => n
            .parse::<u64>()
            .map(|requested| requested.min(limit_ceiling))
            .unwrap_or(limit_ceiling),
        Some(_) => limit_ceiling,
    };
    query.limit = Some(Expr::Value(Value::Number(effective.to_string(), false)));

    tracing::debug!(limit = effective, tables = ?bound, "candidate validated");
    Ok(ValidatedQuery {
        statement,
        limit: effective,
        tables: bound,
    })
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::Copy { .. } => "COPY",
        _ => "non-SELECT statement",
    }
}

fn body_kind(body: &SetExpr) -> &'static str {
    match body {
        SetExpr::Values(_) => "VALUES",
        SetExpr::Query(_) => "nested query",
        _ => "unsupported form",
    }
}
