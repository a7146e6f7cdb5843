//! The turn pipeline: screening, synthesis, validation, execution, and the
//! bookkeeping around them.
//!
//! An [`Assistant`] owns the shared, immutable pieces (catalog snapshot,
//! model provider, execution gateway, audit log). Each [`Session`] runs its
//! turns strictly in sequence; sessions never share mutable state, so any
//! number of them can run concurrently against the same assistant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use askdb_duck::{ExecBudget, ExecError, ExecutionGateway, ResultSet};
use askdb_guard::{any_block, Action, FindingKind, GuardrailEngine, GuardrailFinding};
use askdb_schema::SchemaCatalog;
use askdb_sql::ValidateError;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditOutcome};
use crate::config::Config;
use crate::model::{ModelError, ModelProvider};
use crate::session::{ConversationSession, Turn, TurnStatus};
use crate::synth::{SynthError, Synthesizer};

#[derive(Debug, Error)]
pub enum TurnError {
    /// A Block finding was raised at some stage. The findings live on the
    /// recorded turn; this error deliberately carries no match details.
    #[error("request was blocked by guardrails")]
    GuardrailBlocked,

    #[error("query synthesis failed: {0}")]
    Model(#[from] ModelError),

    #[error("candidate query was rejected: {0}")]
    Validation(#[from] ValidateError),

    #[error("query execution failed: {0}")]
    Execution(#[from] ExecError),

    #[error("turn was cancelled")]
    Cancelled,

    #[error("no turn with id {0}")]
    UnknownTurn(Uuid),

    #[error("turn {0} has no executable query")]
    NotExecutable(Uuid),
}

impl From<SynthError> for TurnError {
    fn from(err: SynthError) -> Self {
        match err {
            SynthError::Model(e) => TurnError::Model(e),
        }
    }
}

impl TurnError {
    /// End-user message. Guardrail and execution internals stay out of it.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::GuardrailBlocked => {
                "The request could not be processed as asked. Try rephrasing the question.".into()
            }
            TurnError::Model(_) => "The query service is temporarily unavailable.".into(),
            TurnError::Validation(e) => format!("The generated query was not usable: {e}"),
            TurnError::Execution(ExecError::Timeout(_)) => "The query took too long and was stopped.".into(),
            TurnError::Execution(_) => "The query could not be executed.".into(),
            TurnError::Cancelled => "The request was cancelled.".into(),
            TurnError::UnknownTurn(_) | TurnError::NotExecutable(_) => {
                "That turn cannot be rerun.".into()
            }
        }
    }
}

/// Shared, session-independent engine state.
pub struct Assistant {
    catalog: Arc<SchemaCatalog>,
    guard: Arc<GuardrailEngine>,
    model: Arc<dyn ModelProvider>,
    gateway: Arc<ExecutionGateway>,
    audit: AuditLog,
    config: Config,
}

impl Assistant {
    pub fn new(config: Config, catalog: SchemaCatalog, model: Arc<dyn ModelProvider>) -> Self {
        let gateway = ExecutionGateway::new(config.execution.database_path.clone());
        Self {
            catalog: Arc::new(catalog),
            guard: Arc::new(GuardrailEngine::new(config.guard.clone())),
            model,
            gateway: Arc::new(gateway),
            audit: AuditLog::new(),
            config,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Open an independent conversation session. Sessions share the catalog
    /// snapshot and audit queue, nothing else.
    pub fn open_session(&self) -> Session {
        Session {
            catalog: Arc::clone(&self.catalog),
            guard: Arc::clone(&self.guard),
            synth: Synthesizer::new(Arc::clone(&self.model), &self.config.model),
            gateway: Arc::clone(&self.gateway),
            audit: self.audit.clone(),
            budget: ExecBudget {
                timeout: Duration::from_millis(self.config.execution.timeout_ms),
                max_rows: self.config.execution.max_fetch_rows,
            },
            limit_ceiling: self.config.execution.row_limit_ceiling,
            history_turns: self.config.model.history_turns,
            state: ConversationSession::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One conversation. Turns run sequentially; `ask` and `rerun` both append
/// exactly one turn whether they succeed or fail.
pub struct Session {
    catalog: Arc<SchemaCatalog>,
    guard: Arc<GuardrailEngine>,
    synth: Synthesizer,
    gateway: Arc<ExecutionGateway>,
    audit: AuditLog,
    budget: ExecBudget,
    limit_ceiling: u64,
    history_turns: usize,
    state: ConversationSession,
    cancel: Arc<AtomicBool>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn turns(&self) -> &[Turn] {
        self.state.turns()
    }

    pub fn turn(&self, id: Uuid) -> Option<&Turn> {
        self.state.turn(id)
    }

    /// Handle for cancelling the in-flight turn from another task. The flag
    /// is checked between pipeline stages and cleared at the start of the
    /// next turn.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn check_cancel(&self) -> Result<(), TurnError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(TurnError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run one full turn. The recorded turn (blocked, failed, or executed)
    /// is always the last element of [`Session::turns`] afterwards.
    pub async fn ask(&mut self, question: &str) -> Result<Uuid, TurnError> {
        self.cancel.store(false, Ordering::Relaxed);
        tracing::info!(session_id = %self.state.id, "turn started");

        // Screening runs over the raw input; only the redacted form is ever
        // stored or forwarded.
        let pre_findings = self.guard.screen_input(question);
        let redacted_question = askdb_guard::redact(question);

        let mut turn = Turn::new(redacted_question.clone());
        turn.pre_findings = pre_findings.clone();

        if any_block(&pre_findings) {
            turn.status = TurnStatus::Blocked;
            turn.error = Some(TurnError::GuardrailBlocked.user_message());
            return self.finish(turn, AuditOutcome::Blocked, Err(TurnError::GuardrailBlocked));
        }

        let history = self.state.history(self.history_turns);

        // First synthesis attempt, then at most one repair round driven by
        // the validator diagnostic.
        let mut repair_hint: Option<String> = None;
        let validated = loop {
            if let Err(e) = self.check_cancel() {
                turn.error = Some(e.user_message());
                return self.finish(turn, AuditOutcome::Cancelled, Err(e));
            }

            let candidate = match self
                .synth
                .synthesize(&redacted_question, &self.catalog, &history, repair_hint.as_deref())
                .await
            {
                Ok(candidate) => candidate,
                Err(e) => {
                    let err = TurnError::from(e);
                    turn.error = Some(err.user_message());
                    return self.finish(turn, AuditOutcome::SynthesisFailed, Err(err));
                }
            };

            // Output screening, then the pattern pre-screen, both over the
            // raw candidate before any structural parsing. Only the redacted
            // copy of the candidate is stored on the turn.
            let mut screening = self.guard.screen_output(&candidate);
            screening.extend(self.guard.prescreen_sql(&candidate));
            turn.candidate_query = Some(askdb_guard::redact(&candidate));
            turn.post_findings.extend(screening);
            if any_block(&turn.post_findings) {
                turn.status = TurnStatus::Blocked;
                turn.error = Some(TurnError::GuardrailBlocked.user_message());
                return self.finish(turn, AuditOutcome::Blocked, Err(TurnError::GuardrailBlocked));
            }

            match askdb_sql::validate(&candidate, &self.catalog, self.limit_ceiling) {
                Ok(validated) => break validated,
                Err(e) if repair_hint.is_none() => {
                    tracing::info!(error = %e, "validation failed, attempting repair");
                    repair_hint = Some(e.to_string());
                }
                Err(e) => {
                    let err = TurnError::from(e);
                    turn.error = Some(err.user_message());
                    return self.finish(turn, AuditOutcome::ValidationFailed, Err(err));
                }
            }
        };

        // The raw SQL lives only inside `validated` for execution; the
        // stored copy, which feeds display and later prompts, is redacted.
        turn.sanitized_query = Some(askdb_guard::redact(&validated.sql()));

        if let Err(e) = self.check_cancel() {
            turn.error = Some(e.user_message());
            return self.finish(turn, AuditOutcome::Cancelled, Err(e));
        }

        match self.gateway.execute(&validated, &self.budget).await {
            Ok(result) => {
                let (result, findings) = redact_result(&self.guard, result);
                turn.post_findings.extend(findings);
                turn.result = Some(result);
                turn.validated = Some(validated);
                turn.status = TurnStatus::Executed;
                let id = turn.id;
                self.finish(turn, AuditOutcome::Executed, Ok(id))
            }
            Err(e) => {
                let err = TurnError::from(e);
                turn.error = Some(err.user_message());
                turn.validated = Some(validated);
                self.finish(turn, AuditOutcome::ExecutionFailed, Err(err))
            }
        }
    }

    /// Re-execute the sanitized query of an earlier executed turn against
    /// current data. No re-screening of the input and no resynthesis; the
    /// fresh result still goes through output redaction.
    pub async fn rerun(&mut self, turn_id: Uuid) -> Result<Uuid, TurnError> {
        self.cancel.store(false, Ordering::Relaxed);

        let (user_text, sanitized, result) = {
            let original = self
                .state
                .turn(turn_id)
                .ok_or(TurnError::UnknownTurn(turn_id))?;
            let validated = original
                .validated
                .as_ref()
                .ok_or(TurnError::NotExecutable(turn_id))?;
            let result = self.gateway.execute(validated, &self.budget).await;
            (
                original.user_text.clone(),
                original.sanitized_query.clone(),
                result,
            )
        };

        let mut turn = Turn::new(user_text);
        turn.sanitized_query = sanitized;

        match result {
            Ok(result) => {
                let (result, findings) = redact_result(&self.guard, result);
                turn.post_findings = findings;
                turn.result = Some(result);
                turn.status = TurnStatus::Executed;
                let id = turn.id;
                self.finish(turn, AuditOutcome::Executed, Ok(id))
            }
            Err(e) => {
                let err = TurnError::from(e);
                turn.error = Some(err.user_message());
                self.finish(turn, AuditOutcome::ExecutionFailed, Err(err))
            }
        }
    }

    /// Append the turn and emit its audit record in one place, so every exit
    /// path of `ask`/`rerun` records consistently.
    fn finish(
        &mut self,
        turn: Turn,
        outcome: AuditOutcome,
        result: Result<Uuid, TurnError>,
    ) -> Result<Uuid, TurnError> {
        let mut findings = turn.pre_findings.clone();
        findings.extend(turn.post_findings.iter().cloned());
        let turn_id = turn.id;
        self.audit.record(self.state.id, turn_id, outcome, findings);
        self.state.append(turn);
        result
    }
}

/// Redact PII out of string cells and report what was redacted. Numeric and
/// null cells pass through untouched.
fn redact_result(
    guard: &GuardrailEngine,
    mut result: ResultSet,
) -> (ResultSet, Vec<GuardrailFinding>) {
    let mut findings = Vec::new();
    for row in &mut result.rows {
        for cell in row.iter_mut() {
            if let serde_json::Value::String(text) = cell {
                let cell_findings: Vec<GuardrailFinding> = guard
                    .screen_output(text)
                    .into_iter()
                    .filter(|f| f.kind == FindingKind::Pii && f.action == Action::Redact)
                    .collect();
                if !cell_findings.is_empty() {
                    *cell = serde_json::Value::String(askdb_guard::redact(text));
                    findings.extend(cell_findings);
                }
            }
        }
    }
    (result, findings)
}
