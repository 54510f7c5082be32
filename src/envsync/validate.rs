use crate::errors::{AppError, AppResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

const BUILTIN_PREFIX: &str = "builtin:";

const BUILTINS: &[(&str, &[&str])] = &[
    ("next-basic", &["DATABASE_URL", "NEXT_PUBLIC_SITE_URL"]),
    ("next-prisma", &["DATABASE_URL", "DIRECT_URL"]),
    ("next-auth", &["NEXTAUTH_SECRET", "NEXTAUTH_URL"]),
    ("better-auth", &["BETTER_AUTH_SECRET", "BETTER_AUTH_URL"]),
    ("drizzle", &["DATABASE_URL"]),
    (
        "supabase",
        &["NEXT_PUBLIC_SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_ANON_KEY", "SUPABASE_SERVICE_ROLE_KEY"],
    ),
    (
        "stripe",
        &["STRIPE_SECRET_KEY", "STRIPE_WEBHOOK_SECRET", "NEXT_PUBLIC_STRIPE_PUBLISHABLE_KEY"],
    ),
    ("s3", &["AWS_REGION", "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "S3_BUCKET"]),
    ("r2", &["R2_ACCOUNT_ID", "R2_ACCESS_KEY_ID", "R2_SECRET_ACCESS_KEY", "R2_BUCKET"]),
    ("resend", &["RESEND_API_KEY"]),
    ("clerk", &["NEXT_PUBLIC_CLERK_PUBLISHABLE_KEY", "CLERK_SECRET_KEY"]),
    ("upstash-redis", &["UPSTASH_REDIS_REST_URL", "UPSTASH_REDIS_REST_TOKEN"]),
    ("google-oauth", &["GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET"]),
    ("github-oauth", &["GITHUB_CLIENT_ID", "GITHUB_CLIENT_SECRET"]),
    ("smtp-basic", &["SMTP_HOST", "SMTP_PORT", "SMTP_SECURE", "SMTP_USER", "SMTP_PASS"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequireIf {
    /// `KEY` (present) or `KEY=value`.
    #[serde(rename = "if")]
    pub condition: String,
    pub then: Vec<String>,
}

/// Required keys plus optional value rules. A plain `{"required": [...]}`
/// document and a JSON Schema `required` list both parse as this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvRules {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub regex: BTreeMap<String, String>,
    #[serde(default)]
    pub allowed: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub one_of: Vec<Vec<String>>,
    #[serde(default)]
    pub require_if: Vec<RequireIf>,
}

impl EnvRules {
    pub fn builtin(name: &str) -> Option<Self> {
        BUILTINS.iter().find(|(id, _)| *id == name).map(|(_, keys)| Self {
            required: keys.iter().map(|key| key.to_string()).collect(),
            ..Self::default()
        })
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        serde_yaml::from_str(raw).map_err(|error| AppError::Config(format!("invalid env schema: {}", error)))
    }

    /// Resolves a comma-separated list of `builtin:<name>` entries and schema
    /// files (relative to `dir`) into one rule set.
    pub fn compose(spec: &str, dir: &Path) -> AppResult<(Self, Vec<PathBuf>)> {
        let mut rules = Self::default();
        let mut files = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let next = match part.strip_prefix(BUILTIN_PREFIX) {
                Some(name) => {
                    Self::builtin(name).ok_or_else(|| AppError::NotFound(format!("Unknown builtin schema: {}", name)))?
                }
                None => {
                    let path = dir.join(part);
                    let raw = std::fs::read_to_string(&path).map_err(|error| {
                        AppError::Io(format!("failed to read env schema {}: {}", path.display(), error))
                    })?;
                    files.push(path);
                    Self::parse(&raw)?
                }
            };
            rules.merge(next);
        }
        if files.is_empty() && rules == Self::default() {
            return Err(AppError::Cli("--schema needs at least one builtin or file".to_string()));
        }
        Ok((rules, files))
    }

    fn merge(&mut self, other: Self) {
        for key in other.required {
            if !self.required.contains(&key) {
                self.required.push(key);
            }
        }
        self.regex.extend(other.regex);
        self.allowed.extend(other.allowed);
        self.one_of.extend(other.one_of);
        self.require_if.extend(other.require_if);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ok: bool,
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub schema_files: Vec<PathBuf>,
    pub required: Vec<String>,
    pub missing: Vec<String>,
    /// Present keys no rule asks for; informational.
    pub unknown: Vec<String>,
    pub violations: Vec<String>,
}

pub fn validate_env(file: &Path, entries: &BTreeMap<String, String>, rules: &EnvRules) -> AppResult<ValidationReport> {
    let mut missing: Vec<String> = rules
        .required
        .iter()
        .filter(|key| !entries.contains_key(key.as_str()))
        .cloned()
        .collect();
    let required: BTreeSet<&str> = rules.required.iter().map(String::as_str).collect();
    let unknown = if required.is_empty() {
        Vec::new()
    } else {
        entries
            .keys()
            .filter(|key| !required.contains(key.as_str()))
            .cloned()
            .collect()
    };

    let mut violations = Vec::new();
    for (key, pattern) in &rules.regex {
        let regex = Regex::new(pattern)
            .map_err(|error| AppError::Config(format!("invalid regex for {}: {}", key, error)))?;
        if let Some(value) = entries.get(key) {
            if !regex.is_match(value) {
                violations.push(format!("regex:{} does not match {}", key, pattern));
            }
        }
    }
    for (key, values) in &rules.allowed {
        if let Some(value) = entries.get(key) {
            if !values.contains(value) {
                violations.push(format!("allowed:{} must be one of {}", key, values.join("|")));
            }
        }
    }
    for group in &rules.one_of {
        if !group.iter().any(|key| entries.contains_key(key)) {
            violations.push(format!("oneOf: one of [{}] must be present", group.join(", ")));
        }
    }
    for rule in &rules.require_if {
        let (key, expected) = match rule.condition.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (rule.condition.trim(), None),
        };
        let triggered = match (entries.get(key), expected) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !triggered {
            continue;
        }
        for needed in &rule.then {
            if entries.contains_key(needed) {
                continue;
            }
            violations.push(format!("requireIf: {} is required when {}", needed, rule.condition));
            if !missing.contains(needed) {
                missing.push(needed.clone());
            }
        }
    }

    Ok(ValidationReport {
        ok: missing.is_empty() && violations.is_empty(),
        file: file.to_path_buf(),
        schema_files: Vec::new(),
        required: rules.required.clone(),
        missing,
        unknown,
        violations,
    })
}
