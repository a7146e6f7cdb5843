//! Conversation state: an append-only sequence of turns per session.
//!
//! Turns are never rewritten after being appended. A rerun of an earlier
//! turn produces a new turn that references the original's sanitized query;
//! the original stays as recorded.

use askdb_duck::ResultSet;
use askdb_guard::GuardrailFinding;
use askdb_sql::ValidatedQuery;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::synth::HistoryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Input was blocked before synthesis.
    Blocked,
    /// Synthesis or validation failed.
    Failed,
    /// Validated and executed to completion.
    Executed,
}

/// One question-answer exchange. `user_text` and any stored result are
/// already redacted; raw PII never lands in a turn.
#[derive(Debug)]
pub struct Turn {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_text: String,
    pub pre_findings: Vec<GuardrailFinding>,
    /// Raw model output after fence stripping, kept for diagnostics.
    pub candidate_query: Option<String>,
    pub post_findings: Vec<GuardrailFinding>,
    /// Canonical SQL text of the validated statement.
    pub sanitized_query: Option<String>,
    /// Present only on executed turns; reruns borrow this.
    pub validated: Option<ValidatedQuery>,
    pub result: Option<ResultSet>,
    pub error: Option<String>,
    pub status: TurnStatus,
}

impl Turn {
    pub fn new(user_text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_text,
            pre_findings: Vec::new(),
            candidate_query: None,
            post_findings: Vec::new(),
            sanitized_query: None,
            validated: None,
            result: None,
            error: None,
            status: TurnStatus::Failed,
        }
    }
}

/// Append-only turn log for one session.
#[derive(Debug)]
pub struct ConversationSession {
    pub id: Uuid,
    turns: Vec<Turn>,
}

impl ConversationSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            turns: Vec::new(),
        }
    }

    pub fn append(&mut self, turn: Turn) -> Uuid {
        let id = turn.id;
        self.turns.push(turn);
        id
    }

    pub fn turn(&self, id: Uuid) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Context for the synthesizer: the last `limit` turns, most recent
    /// first, carrying only redacted questions and sanitized SQL.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.turns
            .iter()
            .rev()
            .take(limit)
            .map(|t| HistoryEntry {
                question: t.user_text.clone(),
                sanitized_sql: t.sanitized_query.clone(),
            })
            .collect()
    }
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new()
    }
}
