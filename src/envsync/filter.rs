use crate::errors::{AppError, AppResult};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;

fn glob_to_regex(pattern: &str) -> AppResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
        .map_err(|error| AppError::Cli(format!("invalid key pattern '{}': {}", pattern, error)))
}

/// `only`/`ignore` glob lists over env keys; `*` is the only wildcard.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    only: Vec<Regex>,
    ignore: Vec<Regex>,
}

impl KeyFilter {
    pub fn new(only: &[String], ignore: &[String]) -> AppResult<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(glob_to_regex)
                .collect::<AppResult<Vec<_>>>()
        };
        Ok(Self {
            only: compile(only)?,
            ignore: compile(ignore)?,
        })
    }

    pub fn allows(&self, key: &str) -> bool {
        if !self.only.is_empty() && !self.only.iter().any(|re| re.is_match(key)) {
            return false;
        }
        !self.ignore.iter().any(|re| re.is_match(key))
    }

    pub fn apply(&self, entries: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        entries
            .iter()
            .filter(|(key, _)| self.allows(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
