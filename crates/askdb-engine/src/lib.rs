//! askdb engine: natural language to guarded, validated, read-only SQL.
//!
//! The engine wires the pipeline together per conversation session:
//!
//! input → guardrail screening → query synthesis (external model) →
//! output screening → SQL validation → bounded execution → turn + audit log
//!
//! Sessions are independent worker contexts. They share only the immutable
//! schema catalog snapshot and the append-only audit log; turns within one
//! session run strictly sequentially. The core is invoked in-process and
//! defines no wire protocol of its own.

pub mod audit;
pub mod config;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod synth;

pub use audit::{AuditLog, AuditOutcome, AuditRecord};
pub use config::{Config, ConfigError, ExecutionConfig, LoggingConfig, ModelConfig};
pub use model::{ModelError, ModelProvider, OpenAiProvider};
pub use pipeline::{Assistant, Session, TurnError};
pub use session::{Turn, TurnStatus};

pub use askdb_duck::{ExecBudget, ExecutionGateway, ResultSet};
pub use askdb_guard::{Action, FindingKind, GuardrailFinding, Severity};
pub use askdb_schema::SchemaCatalog;
pub use askdb_sql::{ValidateError, ValidatedQuery};
