use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

pub const MAX_EXPANSION_PASSES: usize = 5;

static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Z0-9_]+)\}|\$([A-Z0-9_]+)").expect("valid variable regex"));

fn expand_once<F>(value: &str, resolve: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    VAR_RE
        .replace_all(value, |caps: &Captures<'_>| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .and_then(|name| resolve(name.as_str()))
                .unwrap_or_default()
        })
        .into_owned()
}

/// Expands `${NAME}` and `$NAME` against the file itself, then `process_env`.
///
/// Each value is rewritten at most [`MAX_EXPANSION_PASSES`] times; unresolved
/// references become empty strings.
pub fn expand_with<F>(raw: &BTreeMap<String, String>, process_env: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let resolve = |name: &str| raw.get(name).cloned().or_else(|| process_env(name));
    raw.iter()
        .map(|(key, value)| {
            let mut current = value.clone();
            for _ in 0..MAX_EXPANSION_PASSES {
                let next = expand_once(&current, &resolve);
                if next == current {
                    break;
                }
                current = next;
            }
            (key.clone(), current)
        })
        .collect()
}

pub fn expand(raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    expand_with(raw, |name| std::env::var(name).ok())
}
