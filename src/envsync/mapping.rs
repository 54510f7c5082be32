use crate::errors::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Base64,
    Trim,
    Upper,
    Lower,
}

impl Transform {
    pub fn apply(self, value: &str) -> String {
        match self {
            Self::Base64 => STANDARD.encode(value),
            Self::Trim => value.trim().to_string(),
            Self::Upper => value.to_uppercase(),
            Self::Lower => value.to_lowercase(),
        }
    }
}

/// Key renames and value transforms read from a YAML (or JSON) mapping file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KeyMapping {
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub transform: BTreeMap<String, Transform>,
}

impl KeyMapping {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("failed to read mapping file {}: {}", path.display(), error)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|error| AppError::Config(format!("invalid mapping file: {}", error)))
    }

    /// Transform under the old key, rename, then transform under the new key.
    pub fn apply(&self, entries: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| {
                let pre = match self.transform.get(key) {
                    Some(transform) => transform.apply(value),
                    None => value.clone(),
                };
                let new_key = self.rename.get(key).cloned().unwrap_or_else(|| key.clone());
                let post = match self.transform.get(&new_key) {
                    Some(transform) => transform.apply(&pre),
                    None => pre,
                };
                (new_key, post)
            })
            .collect()
    }
}
