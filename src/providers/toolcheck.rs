use crate::executor::Executor;
use crate::models::ProviderKind;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
struct MatrixEntry {
    min_version: &'static str,
    max_version: &'static str,
}

/// What was found when probing a provider's command-line tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProfile {
    pub provider: ProviderKind,
    pub binary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub installed: bool,
    pub tested: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

fn tested_range(provider: ProviderKind) -> Option<MatrixEntry> {
    match provider {
        ProviderKind::Vercel => Some(MatrixEntry {
            min_version: "28.0.0",
            max_version: "99.99.99",
        }),
        ProviderKind::Cloudflare => Some(MatrixEntry {
            min_version: "3.0.0",
            max_version: "9.99.99",
        }),
        ProviderKind::GithubPages => Some(MatrixEntry {
            min_version: "5.0.0",
            max_version: "9.99.99",
        }),
        ProviderKind::Noop => None,
    }
}

pub async fn inspect_tool(executor: &Executor, provider: ProviderKind, binary: &str, dir: &Path) -> ToolProfile {
    let Some(raw) = executor.version_of(binary, dir).await else {
        return ToolProfile {
            provider,
            binary: binary.to_string(),
            version: None,
            installed: false,
            tested: false,
            notes: vec![format!("`{} --version` did not succeed", binary)],
        };
    };

    let version = extract_semver(&raw);
    let mut notes = Vec::new();
    let tested = match (version.as_deref(), tested_range(provider)) {
        (Some(found), Some(range)) => {
            let inside = version_between(found, range.min_version, range.max_version);
            if !inside {
                notes.push(format!(
                    "version {} is outside the tested range {}..={}",
                    found, range.min_version, range.max_version
                ));
            }
            inside
        }
        (None, _) => {
            notes.push(format!("could not read a version from: {}", raw));
            false
        }
        (Some(_), None) => true,
    };

    ToolProfile {
        provider,
        binary: binary.to_string(),
        version,
        installed: true,
        tested,
        notes,
    }
}

/// First candidate whose `--version` succeeds.
pub async fn first_available(executor: &Executor, candidates: &[&str], dir: &Path) -> Option<String> {
    for candidate in candidates {
        if executor.has(candidate, dir).await {
            return Some((*candidate).to_string());
        }
    }
    None
}

pub fn extract_semver(raw: &str) -> Option<String> {
    let mut current = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() || (ch == '.' && !current.is_empty()) {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    let current = current.trim_end_matches('.');
    (!current.is_empty()).then(|| current.to_string())
}

pub fn version_at_least(version: &str, min_version: &str) -> bool {
    parse_version(version) >= parse_version(min_version)
}

fn version_between(version: &str, min_version: &str, max_version: &str) -> bool {
    let parsed = parse_version(version);
    parsed >= parse_version(min_version) && parsed <= parse_version(max_version)
}

fn parse_version(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').filter_map(|segment| segment.parse::<u64>().ok());
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
