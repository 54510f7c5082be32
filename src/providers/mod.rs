pub mod cloudflare;
pub mod detect;
pub mod github_pages;
pub mod noop;
pub mod toolcheck;
pub mod vercel;

use crate::diagnostics::classifier::classify_result;
use crate::errors::{AppError, AppResult, ErrorCode, ProviderError};
use crate::executor::stream::StreamHandle;
use crate::executor::{CommandResult, CommandSpec, Executor, RetryPolicy, DEPLOY_TIMEOUT};
use crate::models::{
    BuildInputs, BuildResult, CapabilitySet, ConfigInputs, DeployInputs, DeployResult, DeploymentRecord,
    DetectionHint, EnvTarget, ProjectRef, ProviderKind,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Knobs shared by every CLI-backed provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub retry: RetryPolicy,
    pub deploy_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub binaries: BTreeMap<ProviderKind, String>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deploy_timeout: DEPLOY_TIMEOUT,
            idle_timeout: None,
            binaries: BTreeMap::new(),
        }
    }
}

/// Where a remote env operation is addressed.
#[derive(Debug, Clone, Copy)]
pub struct EnvScope<'a> {
    pub dir: &'a Path,
    pub project: &'a ProjectRef,
    pub target: EnvTarget,
}

/// The uniform lifecycle every hosting target implements.
///
/// Operations a provider cannot perform keep the default body, which reports
/// the gap as an error; callers consult [`Provider::capabilities`] first.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> CapabilitySet;

    /// Local, read-only framework guess.
    async fn detect(&self, dir: &Path) -> AppResult<DetectionHint>;

    async fn validate_auth(&self, dir: &Path) -> AppResult<()>;

    async fn login(&self, _dir: &Path) -> AppResult<()> {
        Err(unsupported(self.kind(), "login"))
    }

    async fn link(&self, dir: &Path, project: &ProjectRef) -> AppResult<ProjectRef>;

    async fn build(&self, inputs: &BuildInputs) -> AppResult<BuildResult>;

    /// Creates a new remote deployment. Not idempotent.
    async fn deploy(&self, inputs: &DeployInputs) -> AppResult<DeployResult>;

    async fn alias(&self, _dir: &Path, _url: &str, _domain: &str) -> AppResult<String> {
        Err(unsupported(self.kind(), "alias"))
    }

    async fn open(&self, _dir: &Path, _project: &ProjectRef) -> AppResult<()> {
        Err(unsupported(self.kind(), "open"))
    }

    async fn list_env(&self, _scope: EnvScope<'_>) -> AppResult<BTreeMap<String, String>> {
        Err(unsupported(self.kind(), "env list"))
    }

    async fn set_env(&self, _scope: EnvScope<'_>, _key: &str, _value: &str) -> AppResult<()> {
        Err(unsupported(self.kind(), "env set"))
    }

    /// Removing a key that does not exist succeeds.
    async fn remove_env(&self, _scope: EnvScope<'_>, _key: &str) -> AppResult<()> {
        Err(unsupported(self.kind(), "env remove"))
    }

    async fn stream_logs(&self, _dir: &Path, _project: &ProjectRef, _follow: bool) -> AppResult<StreamHandle> {
        Err(unsupported(self.kind(), "logs"))
    }

    /// Recent deployments, newest first.
    async fn list_deployments(&self, _dir: &Path, _project: &ProjectRef) -> AppResult<Vec<DeploymentRecord>> {
        Err(unsupported(self.kind(), "deployment history"))
    }

    /// Turns a deployment URL or provider-specific reference into a URL.
    async fn resolve_deployment(&self, _dir: &Path, reference: &str) -> AppResult<String> {
        if is_url(reference) {
            return Ok(reference.to_string());
        }
        Err(AppError::Cli(format!(
            "{} cannot resolve '{}'; pass a deployment URL",
            self.kind().as_str(),
            reference
        )))
    }

    async fn generate_config(&self, inputs: &ConfigInputs) -> AppResult<PathBuf>;
}

pub(crate) fn is_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}

pub(crate) fn unsupported(kind: ProviderKind, operation: &str) -> AppError {
    AppError::Cli(format!("{} does not support {}", kind.as_str(), operation))
}

/// Quotes a value for a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | ','));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Lowercase, dash-separated project name derived from `raw`.
pub(crate) fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "site".to_string()
    } else {
        slug
    }
}

pub(crate) fn dir_name(dir: &Path) -> String {
    let absolute = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    absolute
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "site".to_string())
}

/// Writes `body` unless the file exists and `overwrite` is off; returns the path either way.
pub(crate) fn write_config_file(path: PathBuf, body: &str, overwrite: bool) -> AppResult<PathBuf> {
    if path.is_file() && !overwrite {
        tracing::info!(path = %path.display(), "config file exists, keeping it");
        return Ok(path);
    }
    std::fs::write(&path, body)
        .map_err(|error| AppError::Io(format!("failed to write {}: {}", path.display(), error)))?;
    tracing::info!(path = %path.display(), "wrote provider config");
    Ok(path)
}

/// Runs a provider's CLI through the executor and classifies its failures.
#[derive(Debug, Clone)]
pub struct CliDriver {
    kind: ProviderKind,
    executor: Executor,
    options: ProviderOptions,
}

impl CliDriver {
    pub fn new(kind: ProviderKind, executor: Executor, options: ProviderOptions) -> Self {
        Self {
            kind,
            executor,
            options,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    pub fn override_binary(&self) -> Option<&str> {
        self.options.binaries.get(&self.kind).map(String::as_str)
    }

    pub fn spec(&self, command: impl Into<String>, dir: &Path) -> CommandSpec {
        CommandSpec::new(command, dir)
            .scoped(self.kind)
            .with_timeout(self.options.retry.per_attempt_timeout)
            .with_idle_timeout(self.options.idle_timeout)
    }

    pub fn deploy_spec(&self, command: impl Into<String>, dir: &Path) -> CommandSpec {
        self.spec(command, dir).with_timeout(self.options.deploy_timeout)
    }

    /// Idempotent reads go through the retry policy.
    pub async fn query(&self, spec: &CommandSpec) -> CommandResult {
        self.executor.run_with_retry(spec, &self.options.retry).await
    }

    /// Mutations run exactly once.
    pub async fn once(&self, spec: &CommandSpec) -> CommandResult {
        self.executor.run_buffered(spec).await
    }

    pub fn failure(&self, result: &CommandResult) -> ProviderError {
        let mut error = classify_result(self.kind, result);
        error.detail = error.detail.map(|detail| self.executor.context().redact(&detail));
        error
    }

    pub fn check(&self, result: CommandResult) -> AppResult<CommandResult> {
        if result.succeeded {
            Ok(result)
        } else {
            Err(self.failure(&result).into())
        }
    }

    pub fn error(&self, code: ErrorCode, message: impl Into<String>) -> AppError {
        ProviderError::new(code, self.kind.as_str(), message).into()
    }
}

/// Verifies the expected build output exists when the build step is skipped.
pub(crate) fn require_artifact_dir(kind: ProviderKind, dir: &Path) -> AppResult<PathBuf> {
    if dir.is_dir() {
        return Ok(dir.to_path_buf());
    }
    Err(ProviderError::new(
        ErrorCode::BuildFailed,
        kind.as_str(),
        format!("Artifact directory not found: {}", dir.display()),
    )
    .with_remedy("Run your build first or drop --no-build")
    .into())
}

/// Runs a project's own build command (package script) and reports its result.
pub(crate) async fn run_project_build(
    driver: &CliDriver,
    inputs: &BuildInputs,
    fallback_command: Option<String>,
) -> AppResult<BuildResult> {
    let publish_dir = inputs.publish_dir.clone().unwrap_or_else(|| PathBuf::from("dist"));
    let artifact_dir = if publish_dir.is_absolute() {
        publish_dir
    } else {
        inputs.dir.join(publish_dir)
    };
    if inputs.no_build {
        let artifact_dir = require_artifact_dir(driver.kind, &artifact_dir)?;
        return Ok(BuildResult {
            succeeded: true,
            artifact_dir: Some(artifact_dir),
            message: Some("build skipped".to_string()),
        });
    }

    let Some(command) = inputs.command.clone().or(fallback_command) else {
        let artifact_dir = require_artifact_dir(driver.kind, &artifact_dir)?;
        return Ok(BuildResult {
            succeeded: true,
            artifact_dir: Some(artifact_dir),
            message: Some("no build command; using existing output".to_string()),
        });
    };

    tracing::info!(provider = driver.kind.as_str(), command = %command, "running project build");
    let mut spec = driver.deploy_spec(command, &inputs.dir);
    if inputs.target.is_production() {
        spec = spec.with_env("NODE_ENV", "production");
    }
    let result = driver.once(&spec).await;
    if !result.succeeded {
        return Err(driver.failure(&result).into());
    }
    Ok(BuildResult {
        succeeded: true,
        artifact_dir: Some(artifact_dir),
        message: None,
    })
}

/// Closed registry: each id maps to one implementation; virtual mode swaps in the no-op provider.
pub fn resolve(kind: ProviderKind, executor: Executor, options: ProviderOptions, virtual_mode: bool) -> Arc<dyn Provider> {
    if virtual_mode {
        return Arc::new(noop::NoopProvider::default());
    }
    match kind {
        ProviderKind::Vercel => Arc::new(vercel::VercelProvider::new(CliDriver::new(kind, executor, options))),
        ProviderKind::Cloudflare => {
            Arc::new(cloudflare::CloudflareProvider::new(CliDriver::new(kind, executor, options)))
        }
        ProviderKind::GithubPages => {
            Arc::new(github_pages::GithubPagesProvider::new(CliDriver::new(kind, executor, options)))
        }
        ProviderKind::Noop => Arc::new(noop::NoopProvider::default()),
    }
}

pub fn provider_for(
    id: &str,
    executor: Executor,
    options: ProviderOptions,
    virtual_mode: bool,
) -> AppResult<Arc<dyn Provider>> {
    let kind: ProviderKind = id.parse()?;
    Ok(resolve(kind, executor, options, virtual_mode))
}

#[cfg(test)]
mod tests {
    use super::{provider_for, shell_quote, slugify, ProviderOptions};
    use crate::context::RuntimeContext;
    use crate::executor::Executor;
    use crate::models::ProviderKind;
    use std::sync::Arc;

    fn executor() -> Executor {
        Executor::live(Arc::new(RuntimeContext::default()))
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("dist/site"), "dist/site");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn slugs_collapse_separators() {
        assert_eq!(slugify("My Site__v2"), "my-site-v2");
        assert_eq!(slugify("--"), "site");
    }

    #[test]
    fn registry_resolves_ids_and_rejects_unknown() {
        let provider = provider_for("cloudflare-pages", executor(), ProviderOptions::default(), false)
            .expect("cloudflare registered");
        assert_eq!(provider.kind(), ProviderKind::Cloudflare);

        let forced = provider_for("vercel", executor(), ProviderOptions::default(), true).expect("virtual mode");
        assert_eq!(forced.kind(), ProviderKind::Noop);

        let err = provider_for("netlify", executor(), ProviderOptions::default(), false)
            .err()
            .expect("unknown id");
        assert_eq!(err.to_string(), "NOT_FOUND: Unknown provider: netlify");
    }

    #[test]
    fn capabilities_drive_feature_flags() {
        let vercel = provider_for("vercel", executor(), ProviderOptions::default(), false).expect("vercel");
        let pages = provider_for("github", executor(), ProviderOptions::default(), false).expect("github");
        assert!(vercel.capabilities().remote_build);
        assert!(vercel.capabilities().alias_domains);
        assert!(!pages.capabilities().project_linking);
        assert!(!pages.capabilities().has_env_store());
    }
}
