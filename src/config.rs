use crate::context::DEFAULT_CACHE_TTL;
use crate::errors::{AppError, AppResult};
use crate::executor::{RetryPolicy, DEPLOY_TIMEOUT};
use crate::models::{EnvTarget, ProviderKind};
use crate::providers::ProviderOptions;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "launchpad.config.json";
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Invocation-wide settings: defaults overlaid by flags and their `LAUNCHPAD_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub retry: RetryPolicy,
    pub deploy_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub concurrency: usize,
    pub cache_ttl: Duration,
    pub record_fixtures: Option<PathBuf>,
    pub replay_fixtures: Option<PathBuf>,
    pub virtual_mode: bool,
    pub ci: bool,
    pub binaries: BTreeMap<ProviderKind, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deploy_timeout: DEPLOY_TIMEOUT,
            idle_timeout: None,
            concurrency: DEFAULT_CONCURRENCY,
            cache_ttl: DEFAULT_CACHE_TTL,
            record_fixtures: None,
            replay_fixtures: None,
            virtual_mode: false,
            ci: false,
            binaries: BTreeMap::new(),
        }
    }
}

/// Values resolved by the command line parser, which also reads the
/// `LAUNCHPAD_*` environment; `None` leaves the default in place.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub deploy_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub record_fixtures: Option<PathBuf>,
    pub replay_fixtures: Option<PathBuf>,
    pub virtual_mode: bool,
    pub ci: bool,
    pub binaries: BTreeMap<ProviderKind, String>,
}

impl Settings {
    pub fn apply_overrides(mut self, overrides: &SettingsOverrides) -> AppResult<Self> {
        if let Some(retries) = overrides.retries {
            self.retry.retries = retries;
        }
        if let Some(delay) = overrides.base_delay_ms {
            self.retry.base_delay = Duration::from_millis(delay);
        }
        if let Some(timeout) = overrides.timeout_ms {
            self.retry.per_attempt_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = overrides.deploy_timeout_ms {
            self.deploy_timeout = Duration::from_millis(timeout);
        }
        if let Some(idle) = overrides.idle_timeout_ms {
            self.idle_timeout = (idle > 0).then(|| Duration::from_millis(idle));
        }
        if let Some(concurrency) = overrides.concurrency {
            self.concurrency = concurrency.max(1);
        }
        let non_empty = |path: &Option<PathBuf>| path.clone().filter(|path| !path.as_os_str().is_empty());
        self.record_fixtures = non_empty(&overrides.record_fixtures).or(self.record_fixtures);
        self.replay_fixtures = non_empty(&overrides.replay_fixtures).or(self.replay_fixtures);
        self.virtual_mode = self.virtual_mode || overrides.virtual_mode;
        self.ci = self.ci || overrides.ci;
        for (kind, bin) in &overrides.binaries {
            if !bin.trim().is_empty() {
                self.binaries.insert(*kind, bin.clone());
            }
        }

        if self.record_fixtures.is_some() && self.replay_fixtures.is_some() {
            return Err(AppError::Config(
                "LAUNCHPAD_RECORD_FIXTURES and LAUNCHPAD_REPLAY_FIXTURES cannot both be set".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            retry: self.retry,
            deploy_timeout: self.deploy_timeout,
            idle_timeout: self.idle_timeout,
            binaries: self.binaries.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvPolicy {
    #[serde(default)]
    pub env_only: Option<Vec<String>>,
    #[serde(default)]
    pub env_ignore: Option<Vec<String>>,
    #[serde(default)]
    pub fail_on_add: Option<bool>,
    #[serde(default)]
    pub fail_on_remove: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    pub path: String,
    pub provider: String,
    #[serde(default)]
    pub env_file_preview: Option<String>,
    #[serde(default)]
    pub env_file_prod: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub policy: EnvPolicy,
}

impl ProjectConfig {
    pub fn provider_kind(&self) -> AppResult<ProviderKind> {
        self.provider.parse()
    }

    pub fn env_file(&self, target: EnvTarget) -> Option<&str> {
        match target {
            EnvTarget::Production => self.env_file_prod.as_deref(),
            _ => self.env_file_preview.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectsConfig {
    #[serde(default)]
    pub policy: EnvPolicy,
    pub projects: Vec<ProjectConfig>,
    /// Directory project paths are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

/// Env policy after applying command line, project and global layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub only: Vec<String>,
    pub ignore: Vec<String>,
    pub fail_on_add: bool,
    pub fail_on_remove: bool,
}

impl ProjectsConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("config not found or unreadable: {}: {}", path.display(), error)))?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&raw, root)
    }

    pub fn parse(raw: &str, root: PathBuf) -> AppResult<Self> {
        let mut config: ProjectsConfig = serde_json::from_str(raw)
            .map_err(|error| AppError::Config(format!("invalid config: {}", error)))?;
        config.root = root;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for (index, project) in self.projects.iter().enumerate() {
            let prefix = format!("projects[{}]", index);
            if project.name.trim().is_empty() {
                return Err(AppError::Config(format!("{}.name must be a non-empty string", prefix)));
            }
            if project.path.trim().is_empty() {
                return Err(AppError::Config(format!("{}.path must be a non-empty string", prefix)));
            }
            if let Err(error) = project.provider_kind() {
                return Err(AppError::Config(format!("{}.provider: {}", prefix, error)));
            }
            if !seen.insert(project.name.as_str()) {
                return Err(AppError::Config(format!("{}.name '{}' is used more than once", prefix, project.name)));
            }
        }
        Ok(())
    }

    pub fn project_dir(&self, project: &ProjectConfig) -> PathBuf {
        self.root.join(&project.path)
    }

    /// Projects matching every given filter; no filters selects all of them.
    pub fn select(&self, names: &[String], tags: &[String]) -> AppResult<Vec<ProjectConfig>> {
        for name in names {
            if !self.projects.iter().any(|project| &project.name == name) {
                return Err(AppError::Config(format!("unknown project '{}'", name)));
            }
        }
        let selected: Vec<ProjectConfig> = self
            .projects
            .iter()
            .filter(|project| names.is_empty() || names.contains(&project.name))
            .filter(|project| tags.is_empty() || project.tags.iter().any(|tag| tags.contains(tag)))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(AppError::Config("no matching projects in config".to_string()));
        }
        Ok(selected)
    }

    pub fn resolve_policy(&self, project: &ProjectConfig, cli: &EnvPolicy) -> ResolvedPolicy {
        let layers = [cli, &project.policy, &self.policy];
        ResolvedPolicy {
            only: layers.iter().find_map(|layer| layer.env_only.clone()).unwrap_or_default(),
            ignore: layers.iter().find_map(|layer| layer.env_ignore.clone()).unwrap_or_default(),
            fail_on_add: layers.iter().find_map(|layer| layer.fail_on_add).unwrap_or(false),
            fail_on_remove: layers.iter().find_map(|layer| layer.fail_on_remove).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EnvPolicy, ProjectsConfig, Settings, SettingsOverrides};
    use crate::models::ProviderKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    const CONFIG: &str = r#"{
      "policy": { "envIgnore": ["NEXT_PUBLIC_*"], "failOnAdd": true },
      "projects": [
        { "name": "web", "path": "apps/web", "provider": "vercel", "tags": ["frontend"], "envFilePreview": ".env.preview" },
        { "name": "docs", "path": "apps/docs", "provider": "cloudflare-pages", "tags": ["frontend", "docs"], "dependsOn": ["web"], "envIgnore": [] },
        { "name": "api", "path": "apps/api", "provider": "noop", "failOnAdd": false }
      ]
    }"#;

    #[test]
    fn overrides_replace_defaults() {
        let mut binaries = BTreeMap::new();
        binaries.insert(ProviderKind::Vercel, "/opt/vercel".to_string());
        binaries.insert(ProviderKind::Cloudflare, " ".to_string());
        let settings = Settings::default()
            .apply_overrides(&SettingsOverrides {
                retries: Some(4),
                base_delay_ms: Some(50),
                deploy_timeout_ms: Some(60_000),
                idle_timeout_ms: Some(0),
                concurrency: Some(0),
                virtual_mode: true,
                ci: true,
                binaries,
                ..SettingsOverrides::default()
            })
            .expect("settings");
        assert_eq!(settings.retry.retries, 4);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(50));
        assert_eq!(settings.retry.per_attempt_timeout, Duration::from_secs(120));
        assert_eq!(settings.deploy_timeout, Duration::from_secs(60));
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.concurrency, 1);
        assert!(settings.virtual_mode);
        assert!(settings.ci);
        assert_eq!(settings.binaries.get(&ProviderKind::Vercel).map(String::as_str), Some("/opt/vercel"));
        assert!(!settings.binaries.contains_key(&ProviderKind::Cloudflare));
    }

    #[test]
    fn rejects_conflicting_fixture_modes() {
        let err = Settings::default()
            .apply_overrides(&SettingsOverrides {
                record_fixtures: Some(PathBuf::from("a.ndjson")),
                replay_fixtures: Some(PathBuf::from("b.ndjson")),
                ..SettingsOverrides::default()
            })
            .expect_err("conflict");
        assert!(err.to_string().starts_with("CONFIG_INVALID"));

        let settings = Settings::default()
            .apply_overrides(&SettingsOverrides {
                record_fixtures: Some(PathBuf::new()),
                replay_fixtures: Some(PathBuf::from("b.ndjson")),
                ..SettingsOverrides::default()
            })
            .expect("empty record path is ignored");
        assert_eq!(settings.replay_fixtures, Some(PathBuf::from("b.ndjson")));
    }

    #[test]
    fn parses_and_selects_projects() {
        let config = ProjectsConfig::parse(CONFIG, PathBuf::from("/repo")).expect("config");
        assert_eq!(config.project_dir(&config.projects[0]), PathBuf::from("/repo/apps/web"));

        let frontend = config.select(&[], &["frontend".to_string()]).expect("by tag");
        assert_eq!(frontend.len(), 2);
        let docs = config
            .select(&["docs".to_string(), "api".to_string()], &["docs".to_string()])
            .expect("intersection");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].name, "docs");
        assert_eq!(config.select(&[], &[]).expect("all").len(), 3);
        assert!(config.select(&["nope".to_string()], &[]).is_err());
        assert!(config.select(&[], &["backend".to_string()]).is_err());
    }

    #[test]
    fn policy_precedence_is_cli_then_project_then_global() {
        let config = ProjectsConfig::parse(CONFIG, PathBuf::from(".")).expect("config");
        let none = EnvPolicy::default();

        let web = config.resolve_policy(&config.projects[0], &none);
        assert_eq!(web.ignore, vec!["NEXT_PUBLIC_*".to_string()]);
        assert!(web.fail_on_add);

        let docs = config.resolve_policy(&config.projects[1], &none);
        assert!(docs.ignore.is_empty());

        let api = config.resolve_policy(&config.projects[2], &none);
        assert!(!api.fail_on_add);

        let cli = EnvPolicy {
            env_only: Some(vec!["API_*".to_string()]),
            fail_on_add: Some(false),
            ..EnvPolicy::default()
        };
        let web = config.resolve_policy(&config.projects[0], &cli);
        assert_eq!(web.only, vec!["API_*".to_string()]);
        assert!(!web.fail_on_add);
    }

    #[test]
    fn validation_names_the_offending_field() {
        let err = ProjectsConfig::parse(
            r#"{"projects":[{"name":"a","path":"a","provider":"vercel"},{"name":" ","path":"b","provider":"vercel"}]}"#,
            PathBuf::from("."),
        )
        .expect_err("blank name");
        assert_eq!(err.to_string(), "CONFIG_INVALID: projects[1].name must be a non-empty string");

        let err = ProjectsConfig::parse(
            r#"{"projects":[{"name":"a","path":"a","provider":"netlify"}]}"#,
            PathBuf::from("."),
        )
        .expect_err("unknown provider");
        assert!(err.to_string().contains("projects[0].provider: NOT_FOUND: Unknown provider: netlify"));
    }
}
