use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const MASK: &str = "[REDACTED]";
const MIN_LITERAL_LEN: usize = 4;
const PUBLIC_PREFIX: &str = "PUBLIC_";

struct SecretPattern {
    regex: Regex,
    /// Group 1 is the key name; the key survives and only the value is masked.
    keyed: bool,
}

static SECRET_PATTERNS: Lazy<Vec<SecretPattern>> = Lazy::new(|| {
    let keyed = |pattern: &str| SecretPattern {
        regex: Regex::new(pattern).expect("valid regex"),
        keyed: true,
    };
    let bare = |pattern: &str| SecretPattern {
        regex: Regex::new(pattern).expect("valid regex"),
        keyed: false,
    };
    vec![
        keyed(r#"(?i)(api[_-]?key|token|secret|password)\s*[:=]\s*["']?([A-Za-z0-9_\-\.]{6,})["']?"#),
        bare(r"\bsk-[A-Za-z0-9]{20,}\b"),
        bare(r"\bAKIA[0-9A-Z]{16}\b"),
        bare(r"\b[A-Fa-f0-9]{32,}\b"),
    ]
});

/// Masks secrets in process output before it is logged or reported.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    literals: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_literal(&mut self, value: &str) {
        if value.len() < MIN_LITERAL_LEN {
            return;
        }
        for candidate in [value.to_string(), STANDARD.encode(value)] {
            if !self.literals.contains(&candidate) {
                self.literals.push(candidate);
            }
        }
        // Longest first so a secret is not partially masked by one of its prefixes.
        self.literals.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Registers every non-public value of an env file as a literal secret.
    pub fn absorb_env(&mut self, entries: &BTreeMap<String, String>) {
        for (key, value) in entries {
            if key.starts_with(PUBLIC_PREFIX) {
                continue;
            }
            self.add_literal(value);
        }
    }

    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    pub fn redact_str(&self, input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let mut result = input.to_string();
        for literal in &self.literals {
            if result.contains(literal.as_str()) {
                result = result.replace(literal.as_str(), MASK);
            }
        }

        for pattern in SECRET_PATTERNS.iter() {
            if !pattern.regex.is_match(&result) {
                continue;
            }
            result = if pattern.keyed {
                pattern
                    .regex
                    .replace_all(&result, |caps: &regex::Captures<'_>| {
                        let key = caps.get(1).map(|m| m.as_str()).unwrap_or("secret");
                        format!("{}={}", key.to_ascii_lowercase(), MASK)
                    })
                    .into_owned()
            } else {
                pattern.regex.replace_all(&result, MASK).into_owned()
            };
        }
        result
    }
}
