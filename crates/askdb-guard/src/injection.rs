//! Prompt-injection heuristics and SQL pattern pre-screen.

use once_cell::sync::Lazy;
use regex::Regex;

/// Instruction-override phrases with weights. High-weight entries are the
/// classic override openers; lower weights cover persona and mode switching.
static OVERRIDE_PHRASES: Lazy<Vec<(Regex, u32)>> = Lazy::new(|| {
    let table: &[(&str, u32)] = &[
        // Qualifiers stack ("all previous instructions"), so each one is
        // one-or-more words, not exactly one.
        (r"ignore\s+(?:(?:previous|above|all|prior|earlier)\s+)+(?:instructions?|prompts?|rules?)", 8),
        (r"forget\s+(?:(?:everything|all|previous|prior)\s*)+", 8),
        (r"disregard\s+(?:(?:previous|above|all|prior|your)\s*)+", 8),
        (r"override\s+(?:system|safety)", 8),
        (r"bypass\s+(?:safety|guardrails?|filters?)", 8),
        (r"jailbreak", 8),
        (r"you\s+are\s+now\s+(?:a\s+)?(?:different|new)", 6),
        (r"system\s*:\s*", 6),
        (r"(?:admin|developer|debug)\s+(?:mode|access)", 6),
        (r"pretend\s+to\s+be", 4),
        (r"act\s+as\s+if", 4),
        (r"roleplay\s+as", 4),
        (r"new\s+instructions?", 4),
    ];
    table
        .iter()
        .map(|(pattern, weight)| {
            (
                Regex::new(&format!("(?i){pattern}")).expect("override phrase pattern"),
                *weight,
            )
        })
        .collect()
});

/// Known jailbreak template fragments. Matching any of these is treated the
/// same as a high-weight override phrase.
static JAILBREAK_DENYLIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bDAN\b.{0,40}do\s+anything\s+now",
        r"(?i)developer\s+message\s+begins",
        r"(?i)your\s+true\s+self\s+has\s+no\s+restrictions",
        r"(?i)hypothetically.{0,40}no\s+rules",
        r"(?i)<\|[a-z_]+\|>",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("jailbreak pattern"))
    .collect()
});

static TEMPLATE_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[{}\[\]<>|]").expect("template token pattern"));

#[derive(Debug, Clone, Copy, Default)]
pub struct InjectionScore {
    pub phrase_hits: u32,
    pub denylist_hits: u32,
    pub density: u32,
    pub total: u32,
}

impl InjectionScore {
    pub fn describe(&self) -> String {
        format!(
            "injection score {} (phrases {}, denylist {}, density {})",
            self.total, self.phrase_hits, self.denylist_hits, self.density
        )
    }
}

/// Heuristic score combining override-phrase weight, denylist similarity and
/// structural density of template-like tokens.
pub fn score(text: &str) -> InjectionScore {
    let mut score = InjectionScore::default();

    for (pattern, weight) in OVERRIDE_PHRASES.iter() {
        if pattern.is_match(text) {
            score.phrase_hits += weight;
        }
    }

    for pattern in JAILBREAK_DENYLIST.iter() {
        if pattern.is_match(text) {
            score.denylist_hits += 8;
        }
    }

    // Anomalous structural density: prompts full of braces, brackets and
    // role markers look like template smuggling, not questions about data.
    if !text.is_empty() {
        let tokens = TEMPLATE_TOKENS.find_iter(text).count();
        let per_hundred = tokens * 100 / text.len().max(100);
        score.density = match per_hundred {
            0..=2 => 0,
            3..=6 => 2,
            _ => 4,
        };
    }

    score.total = score.phrase_hits + score.denylist_hits + score.density;
    score
}

static SQL_BLOCK_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let table: &[(&str, &str)] = &[
        (r"\|\|", "string concatenation marker"),
        (r"(?i)\bconcat\s*\(", "string concatenation call"),
        (r"(?i)\bcha?r\s*\(", "character construction call"),
        (r";[^;]*\S", "multiple semicolon-delimited statements"),
        (r"--", "line comment terminator"),
        (r"/\*", "block comment opener"),
        (r"(?i);\s*(?:drop|delete|insert|update|alter|create|truncate)\b", "stacked mutating statement"),
        (r"(?i)\bunion\s+(?:all\s+)?select\b", "union-based injection shape"),
        (r"(?i)\b(?:xp_cmdshell|sp_executesql)\b", "procedural escape"),
        (r"0x[0-9a-fA-F]{8,}", "hex-encoded payload"),
    ];
    table
        .iter()
        .map(|(pattern, what)| (Regex::new(pattern).expect("sql pattern"), *what))
        .collect()
});

/// Adversarial shapes in raw candidate SQL. Returns a description per hit;
/// the caller turns each into a blocking finding.
pub fn sql_patterns(candidate: &str) -> Vec<String> {
    let mut hits = Vec::new();
    for (pattern, what) in SQL_BLOCK_PATTERNS.iter() {
        if let Some(m) = pattern.find(candidate) {
            hits.push(format!("{what} at byte {}", m.start()));
        }
    }
    hits
}
