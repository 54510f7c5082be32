use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedEntry {
    pub key: String,
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ChangedEntry>,
}

impl DiffResult {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compares key sets and exact values; keys are case-sensitive.
pub fn diff_env(local: &BTreeMap<String, String>, remote: &BTreeMap<String, String>) -> DiffResult {
    let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut result = DiffResult::default();
    for key in keys {
        match (local.get(key), remote.get(key)) {
            (Some(_), None) => result.added.push(key.clone()),
            (None, Some(_)) => result.removed.push(key.clone()),
            (Some(l), Some(r)) if l != r => result.changed.push(ChangedEntry {
                key: key.clone(),
                local: l.clone(),
                remote: r.clone(),
            }),
            _ => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::diff_env;
    use crate::envsync::expand::expand_with;
    use std::collections::BTreeMap;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn compares_expanded_local_values() {
        let local = expand_with(&map(&[("A", "1"), ("B", "${A}2")]), |_| None);
        let remote = map(&[("B", "12"), ("C", "x")]);
        let diff = diff_env(&local, &remote);
        assert_eq!(diff.added, vec!["A".to_string()]);
        assert_eq!(diff.removed, vec!["C".to_string()]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn keys_are_case_sensitive() {
        let diff = diff_env(&map(&[("key", "1")]), &map(&[("KEY", "1")]));
        assert_eq!(diff.added, vec!["key".to_string()]);
        assert_eq!(diff.removed, vec!["KEY".to_string()]);
    }

    #[test]
    fn applying_adds_and_changes_leaves_only_removals() {
        let local = map(&[("A", "1"), ("B", "2"), ("D", "4")]);
        let mut remote = map(&[("B", "old"), ("C", "3"), ("D", "4")]);
        let diff = diff_env(&local, &remote);
        assert_eq!(diff.changed.len(), 1);

        for key in &diff.added {
            remote.insert(key.clone(), local[key].clone());
        }
        for changed in &diff.changed {
            remote.insert(changed.key.clone(), changed.local.clone());
        }
        let after = diff_env(&local, &remote);
        assert!(after.added.is_empty());
        assert!(after.changed.is_empty());
        assert_eq!(after.removed, diff.removed);
    }
}
