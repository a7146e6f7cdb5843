//! Guardrail engine: pre-flight screening of user input and post-flight
//! screening of model output.
//!
//! Screening produces findings rather than panics or silent rewrites; the
//! caller decides what a `Block` means for the turn. Three families of rules:
//!
//! - prompt-injection heuristics over user input (scored, thresholded)
//! - PII detection with typed-placeholder redaction
//! - SQL injection pattern pre-screen over raw candidate text, applied
//!   before any structural parsing

use serde::{Deserialize, Serialize};

mod injection;
mod pii;

pub use pii::redact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    PromptInjection,
    Pii,
    SqlInjectionPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Advisory only; recorded in the audit log, never alters control flow.
    Flag,
    /// Span replaced with a typed placeholder before display or logging.
    Redact,
    /// Authoritative at any stage; the turn short-circuits to blocked.
    Block,
}

/// One screening hit. `location` describes the matched span without carrying
/// the raw matched value, so findings are always safe to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub location: String,
    pub action: Action,
}

impl GuardrailFinding {
    pub fn is_block(&self) -> bool {
        self.action == Action::Block
    }
}

pub fn any_block(findings: &[GuardrailFinding]) -> bool {
    findings.iter().any(GuardrailFinding::is_block)
}

/// Thresholds for the prompt-injection heuristic score. A score at or above
/// `block_threshold` blocks; the band between the two only flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub block_threshold: u32,
    pub flag_threshold: u32,
    /// Inputs longer than this raise an advisory flag.
    pub max_input_len: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            block_threshold: 8,
            flag_threshold: 4,
            max_input_len: 10_000,
        }
    }
}

pub struct GuardrailEngine {
    config: GuardConfig,
}

impl GuardrailEngine {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Pre-flight screening of raw user input.
    pub fn screen_input(&self, text: &str) -> Vec<GuardrailFinding> {
        let mut findings = Vec::new();

        let score = injection::score(text);
        if score.total >= self.config.block_threshold {
            findings.push(GuardrailFinding {
                kind: FindingKind::PromptInjection,
                severity: Severity::High,
                location: score.describe(),
                action: Action::Block,
            });
        } else if score.total >= self.config.flag_threshold {
            findings.push(GuardrailFinding {
                kind: FindingKind::PromptInjection,
                severity: Severity::Medium,
                location: score.describe(),
                action: Action::Flag,
            });
        }

        findings.extend(pii::detect(text));

        if text.len() > self.config.max_input_len {
            findings.push(GuardrailFinding {
                kind: FindingKind::PromptInjection,
                severity: Severity::Low,
                location: format!("input length {} exceeds {}", text.len(), self.config.max_input_len),
                action: Action::Flag,
            });
        }

        if any_block(&findings) {
            tracing::warn!(score = score.total, "input screening blocked");
        }
        findings
    }

    /// Post-flight screening of model output or of result text. PII hits
    /// here carry the `Redact` action; callers apply [`redact`] before the
    /// text is displayed or persisted anywhere.
    pub fn screen_output(&self, text: &str) -> Vec<GuardrailFinding> {
        let mut findings = pii::detect(text);

        // A model echoing injection phrasing back is itself suspicious.
        let score = injection::score(text);
        if score.total >= self.config.block_threshold {
            findings.push(GuardrailFinding {
                kind: FindingKind::PromptInjection,
                severity: Severity::High,
                location: score.describe(),
                action: Action::Block,
            });
        }

        findings
    }

    /// Pattern pre-screen over raw candidate SQL text, before structural
    /// parsing. These shapes indicate adversarial intent rather than benign
    /// variance, so every hit blocks.
    pub fn prescreen_sql(&self, candidate: &str) -> Vec<GuardrailFinding> {
        injection::sql_patterns(candidate)
            .into_iter()
            .map(|location| GuardrailFinding {
                kind: FindingKind::SqlInjectionPattern,
                severity: Severity::High,
                location,
                action: Action::Block,
            })
            .collect()
    }
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}
