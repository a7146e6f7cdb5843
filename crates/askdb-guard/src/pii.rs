//! PII detection and typed-placeholder redaction.
//!
//! Findings report the kind and span location of a match, never the matched
//! value itself, so they can be persisted in the audit log as-is.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Action, FindingKind, GuardrailFinding, Severity};

struct PiiPattern {
    label: &'static str,
    placeholder: &'static str,
    severity: Severity,
    pattern: Regex,
}

static PII_PATTERNS: Lazy<Vec<PiiPattern>> = Lazy::new(|| {
    let table: &[(&str, &str, Severity, &str)] = &[
        (
            "email",
            "[EMAIL_REDACTED]",
            Severity::High,
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        ),
        (
            "ssn",
            "[SSN_REDACTED]",
            Severity::High,
            r"\b\d{3}-\d{2}-\d{4}\b",
        ),
        (
            "credit_card",
            "[CARD_REDACTED]",
            Severity::High,
            r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b",
        ),
        (
            "phone",
            "[PHONE_REDACTED]",
            Severity::Medium,
            r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s][0-9]{3}[-.\s]?[0-9]{4}\b",
        ),
        (
            "ip_address",
            "[IP_REDACTED]",
            Severity::Low,
            r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b",
        ),
    ];
    table
        .iter()
        .map(|(label, placeholder, severity, pattern)| PiiPattern {
            label,
            placeholder,
            severity: *severity,
            pattern: Regex::new(pattern).expect("pii pattern"),
        })
        .collect()
});

/// Scan text for PII. Every hit carries the `Redact` action.
pub fn detect(text: &str) -> Vec<GuardrailFinding> {
    let mut findings = Vec::new();
    for pii in PII_PATTERNS.iter() {
        for m in pii.pattern.find_iter(text) {
            findings.push(GuardrailFinding {
                kind: FindingKind::Pii,
                severity: pii.severity,
                location: format!("{} at bytes {}..{}", pii.label, m.start(), m.end()),
                action: Action::Redact,
            });
        }
    }
    findings
}

/// Replace every PII span with its typed placeholder. Applied to any text
/// headed for display or persistence; the raw value must not outlive the
/// screening pass.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for pii in PII_PATTERNS.iter() {
        out = pii.pattern.replace_all(&out, pii.placeholder).into_owned();
    }
    out
}
