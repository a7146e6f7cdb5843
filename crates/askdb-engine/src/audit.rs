//! Audit trail for guardrail decisions.
//!
//! Sessions push records onto a shared queue; the queue is append-safe
//! across sessions without holding a lock during pipeline work. Records
//! carry finding metadata only, never the raw matched text.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use askdb_guard::GuardrailFinding;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Blocked,
    SynthesisFailed,
    ValidationFailed,
    ExecutionFailed,
    Cancelled,
    Executed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub session_id: Uuid,
    pub turn_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub findings: Vec<GuardrailFinding>,
}

struct Inner {
    rx: Mutex<Receiver<AuditRecord>>,
    drained: Mutex<Vec<AuditRecord>>,
}

/// Cloneable handle to the audit queue. Each clone gets its own sender, so
/// concurrent sessions append without contending.
#[derive(Clone)]
pub struct AuditLog {
    tx: Sender<AuditRecord>,
    inner: Arc<Inner>,
}

impl AuditLog {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        Self {
            tx,
            inner: Arc::new(Inner {
                rx: Mutex::new(rx),
                drained: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn record(
        &self,
        session_id: Uuid,
        turn_id: Uuid,
        outcome: AuditOutcome,
        findings: Vec<GuardrailFinding>,
    ) {
        let record = AuditRecord {
            session_id,
            turn_id,
            timestamp: Utc::now(),
            outcome,
            findings,
        };
        tracing::info!(
            session_id = %record.session_id,
            turn_id = %record.turn_id,
            outcome = ?record.outcome,
            findings = record.findings.len(),
            "audit"
        );
        // The receiver lives as long as any handle does, so send cannot fail
        // while self is alive.
        let _ = self.tx.send(record);
    }

    /// All records to date, in arrival order.
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        let mut drained = match self.inner.drained.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Ok(rx) = self.inner.rx.lock() {
            while let Ok(record) = rx.try_recv() {
                drained.push(record);
            }
        }
        drained.clone()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
