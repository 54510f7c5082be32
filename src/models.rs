use crate::errors::AppError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Vercel,
    Cloudflare,
    GithubPages,
    Noop,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Vercel,
        ProviderKind::Cloudflare,
        ProviderKind::GithubPages,
        ProviderKind::Noop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vercel => "vercel",
            Self::Cloudflare => "cloudflare",
            Self::GithubPages => "github-pages",
            Self::Noop => "noop",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vercel" => Ok(Self::Vercel),
            "cloudflare" | "cloudflare-pages" => Ok(Self::Cloudflare),
            "github" | "github-pages" => Ok(Self::GithubPages),
            "noop" | "virtual" => Ok(Self::Noop),
            _ => Err(AppError::NotFound(format!("Unknown provider: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvTarget {
    Preview,
    Production,
    Development,
}

impl EnvTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Production => "production",
            Self::Development => "development",
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl FromStr for EnvTarget {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "preview" => Ok(Self::Preview),
            "prod" | "production" => Ok(Self::Production),
            "dev" | "development" => Ok(Self::Development),
            other => Err(AppError::Cli(format!(
                "unknown environment '{}' (expected preview, production or development)",
                other
            ))),
        }
    }
}

/// Remote project identity produced by `link`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl ProjectRef {
    pub fn is_empty(&self) -> bool {
        self.project_id.is_none() && self.org_id.is_none() && self.slug.is_none()
    }

    /// Best human-facing name for the project.
    pub fn display_name(&self) -> Option<&str> {
        self.slug.as_deref().or(self.project_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionHint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub local_build: bool,
    pub remote_build: bool,
    pub static_deploy: bool,
    pub serverless: bool,
    pub edge_functions: bool,
    pub ssr: bool,
    pub project_linking: bool,
    pub env_contexts: Vec<EnvTarget>,
    pub logs_follow: bool,
    pub alias_domains: bool,
    pub rollback: bool,
}

impl CapabilitySet {
    pub fn has_env_store(&self) -> bool {
        !self.env_contexts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInputs {
    pub dir: PathBuf,
    pub target: EnvTarget,
    pub publish_dir: Option<PathBuf>,
    pub command: Option<String>,
    pub no_build: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployInputs {
    pub dir: PathBuf,
    pub target: EnvTarget,
    pub project: ProjectRef,
    pub artifact_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigInputs {
    pub dir: PathBuf,
    pub overwrite: bool,
    pub detection: DetectionHint,
}

#[cfg(test)]
mod tests {
    use super::{EnvTarget, ProjectRef, ProviderKind};

    #[test]
    fn provider_ids_accept_aliases() {
        assert_eq!("cloudflare-pages".parse::<ProviderKind>().ok(), Some(ProviderKind::Cloudflare));
        assert_eq!("GitHub".parse::<ProviderKind>().ok(), Some(ProviderKind::GithubPages));
        assert_eq!("virtual".parse::<ProviderKind>().ok(), Some(ProviderKind::Noop));
    }

    #[test]
    fn unknown_provider_is_not_found() {
        let err = "netlify".parse::<ProviderKind>().expect_err("netlify is not registered");
        assert_eq!(err.to_string(), "NOT_FOUND: Unknown provider: netlify");
    }

    #[test]
    fn env_target_accepts_prod_shorthand() {
        assert_eq!("prod".parse::<EnvTarget>().ok(), Some(EnvTarget::Production));
        assert!("staging".parse::<EnvTarget>().is_err());
    }

    #[test]
    fn project_ref_prefers_slug_for_display() {
        let project = ProjectRef {
            project_id: Some("prj_1".to_string()),
            org_id: None,
            slug: Some("site".to_string()),
        };
        assert_eq!(project.display_name(), Some("site"));
        assert!(ProjectRef::default().is_empty());
    }
}

/// One remote deployment as reported by the provider, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub url: String,
    pub target: EnvTarget,
    pub ready: bool,
}
