use super::detect::detect_project;
use super::{is_url, require_artifact_dir, shell_quote, write_config_file, CliDriver, EnvScope, Provider};
use crate::envsync::dotenv::parse_dotenv;
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::executor::output::LineSplitter;
use crate::executor::stream::{StreamHandle, StreamKind};
use crate::models::{
    BuildInputs, BuildResult, CapabilitySet, ConfigInputs, DeployInputs, DeployResult, DeploymentRecord,
    DetectionHint, EnvTarget, ProjectRef, ProviderKind,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

static DEPLOY_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+\.vercel\.app\b").expect("valid deploy url regex"));
static INSPECT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]*vercel\.com[^\s]*").expect("valid inspect url regex"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkedProject {
    project_id: Option<String>,
    org_id: Option<String>,
    project_name: Option<String>,
}

fn read_linked_project(dir: &Path) -> Option<ProjectRef> {
    let raw = std::fs::read_to_string(dir.join(".vercel").join("project.json")).ok()?;
    let linked: LinkedProject = serde_json::from_str(&raw).ok()?;
    linked.project_id.as_ref()?;
    Some(ProjectRef {
        project_id: linked.project_id,
        org_id: linked.org_id,
        slug: linked.project_name,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedDeployment {
    url: Option<String>,
    ready_state: Option<String>,
    state: Option<String>,
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeploymentListing {
    Bare(Vec<ListedDeployment>),
    Wrapped { deployments: Vec<ListedDeployment> },
}

/// Parses `vercel list --json`, which is either an array or `{"deployments": [...]}`.
pub fn parse_deployment_list(raw: &str) -> Option<Vec<DeploymentRecord>> {
    let listing: DeploymentListing = serde_json::from_str(raw.trim()).ok()?;
    let entries = match listing {
        DeploymentListing::Bare(entries) | DeploymentListing::Wrapped { deployments: entries } => entries,
    };
    Some(
        entries
            .into_iter()
            .filter_map(|entry| {
                let url = entry.url?;
                let state = entry.ready_state.or(entry.state).unwrap_or_default();
                let production = entry.target.as_deref().is_some_and(|t| t.eq_ignore_ascii_case("production"));
                Some(DeploymentRecord {
                    url: if is_url(&url) { url } else { format!("https://{}", url) },
                    target: if production { EnvTarget::Production } else { EnvTarget::Preview },
                    ready: state.eq_ignore_ascii_case("ready"),
                })
            })
            .collect(),
    )
}

pub fn extract_deploy_url(text: &str) -> Option<String> {
    DEPLOY_URL_RE.find(text).map(|m| m.as_str().to_string())
}

pub fn extract_inspect_url(text: &str) -> Option<String> {
    INSPECT_URL_RE.find(text).map(|m| m.as_str().to_string())
}

#[derive(Debug)]
pub struct VercelProvider {
    cli: CliDriver,
}

impl VercelProvider {
    pub fn new(cli: CliDriver) -> Self {
        Self { cli }
    }

    fn bin(&self) -> &str {
        self.cli.override_binary().unwrap_or("vercel")
    }

    async fn inspect_logs_url(&self, dir: &Path, url: &str) -> Option<String> {
        let spec = self.cli.spec(format!("{} inspect {}", self.bin(), shell_quote(url)), dir);
        let result = self.cli.query(&spec).await;
        if !result.succeeded {
            tracing::debug!(url, "inspect query failed");
            return None;
        }
        extract_inspect_url(&result.combined_output())
    }
}

#[async_trait]
impl Provider for VercelProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vercel
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            local_build: true,
            remote_build: true,
            static_deploy: true,
            serverless: true,
            edge_functions: true,
            ssr: true,
            project_linking: true,
            env_contexts: vec![EnvTarget::Preview, EnvTarget::Production, EnvTarget::Development],
            logs_follow: true,
            alias_domains: true,
            rollback: true,
        }
    }

    async fn detect(&self, dir: &Path) -> AppResult<DetectionHint> {
        // Vercel detects frameworks remotely, so an unknown layout is still deployable.
        match detect_project(dir) {
            Ok(hint) => Ok(hint),
            Err(AppError::NotFound(_)) if dir.is_dir() => Ok(DetectionHint::default()),
            Err(error) => Err(error),
        }
    }

    async fn validate_auth(&self, dir: &Path) -> AppResult<()> {
        let spec = self.cli.spec(format!("{} whoami", self.bin()), dir);
        let result = self.cli.query(&spec).await;
        if result.succeeded {
            return Ok(());
        }
        let mut error = self.cli.failure(&result);
        if !matches!(
            error.code,
            ErrorCode::AuthExpired | ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::IdleTimeout
        ) {
            error.code = ErrorCode::AuthRequired;
            error.message = "Not logged in to Vercel.".to_string();
            error.remedy = Some("Run: vercel login".to_string());
        }
        Err(error.into())
    }

    async fn login(&self, dir: &Path) -> AppResult<()> {
        let spec = self.cli.spec(format!("{} login", self.bin()), dir).attached();
        self.cli.check(self.cli.once(&spec).await).map(|_| ())
    }

    async fn link(&self, dir: &Path, project: &ProjectRef) -> AppResult<ProjectRef> {
        if let Some(existing) = read_linked_project(dir) {
            tracing::debug!(project = ?existing.project_id, "already linked");
            return Ok(existing);
        }

        let mut command = format!("{} link --yes", self.bin());
        if let Some(id) = project.project_id.as_deref().or(project.slug.as_deref()) {
            command.push_str(&format!(" --project {}", shell_quote(id)));
        }
        if let Some(org) = &project.org_id {
            command.push_str(&format!(" --org {}", shell_quote(org)));
        }
        let result = self.cli.once(&self.cli.spec(command, dir)).await;
        if !result.succeeded && !result.stdout.to_lowercase().contains("already linked") {
            let mut error = self.cli.failure(&result);
            if error.code == ErrorCode::UnknownProviderError {
                error.code = ErrorCode::NotLinked;
                error.message = "Project not linked to Vercel.".to_string();
                error.remedy = Some("Run: vercel link".to_string());
            }
            return Err(error.into());
        }
        Ok(read_linked_project(dir).unwrap_or_else(|| project.clone()))
    }

    async fn build(&self, inputs: &BuildInputs) -> AppResult<BuildResult> {
        let output = inputs.dir.join(".vercel").join("output");
        if inputs.no_build {
            let artifact_dir = require_artifact_dir(self.kind(), &output)?;
            return Ok(BuildResult {
                succeeded: true,
                artifact_dir: Some(artifact_dir),
                message: Some("build skipped".to_string()),
            });
        }

        let mut command = format!("{} build", self.bin());
        if inputs.target.is_production() {
            command.push_str(" --prod");
        }
        let result = self.cli.once(&self.cli.deploy_spec(command, &inputs.dir)).await;
        if !result.succeeded {
            return Err(self.cli.failure(&result).into());
        }
        Ok(BuildResult {
            succeeded: true,
            artifact_dir: Some(output),
            message: None,
        })
    }

    async fn deploy(&self, inputs: &DeployInputs) -> AppResult<DeployResult> {
        let mut command = format!("{} deploy", self.bin());
        if inputs.artifact_dir.is_some() {
            command.push_str(" --prebuilt");
        }
        if inputs.target.is_production() {
            command.push_str(" --prod");
        }
        command.push_str(" --yes");

        let spec = self.cli.deploy_spec(command, &inputs.dir);
        let mut handle = self.cli.executor().run_streamed(&spec);
        let mut out_lines = LineSplitter::new(None);
        let mut err_lines = LineSplitter::new(None);
        let mut url: Option<String> = None;
        let mut logs_url: Option<String> = None;
        while let Some(chunk) = handle.next_chunk().await {
            let lines = match chunk.stream {
                StreamKind::Stdout => out_lines.push(&chunk.data),
                StreamKind::Stderr => err_lines.push(&chunk.data),
            };
            for line in lines {
                if url.is_none() && chunk.stream == StreamKind::Stdout {
                    url = extract_deploy_url(&line);
                }
                if logs_url.is_none() {
                    logs_url = extract_inspect_url(&line);
                }
            }
        }
        let result = handle.wait().await;
        url = url.or_else(|| extract_deploy_url(&result.stdout));
        logs_url = logs_url.or_else(|| extract_inspect_url(&result.combined_output()));

        if !result.succeeded {
            let mut error = self.cli.failure(&result);
            error.url = url;
            error.logs_url = logs_url;
            return Err(error.into());
        }
        let Some(url) = url else {
            return Err(self.cli.error(
                ErrorCode::UnknownProviderError,
                "Vercel deploy succeeded but no URL found in output",
            ));
        };
        if logs_url.is_none() {
            logs_url = self.inspect_logs_url(&inputs.dir, &url).await;
        }
        Ok(DeployResult {
            succeeded: true,
            url: Some(url),
            logs_url,
            message: None,
        })
    }

    async fn alias(&self, dir: &Path, url: &str, domain: &str) -> AppResult<String> {
        let command = format!("{} alias set {} {}", self.bin(), shell_quote(url), shell_quote(domain));
        self.cli.check(self.cli.once(&self.cli.spec(command, dir)).await)?;
        Ok(if domain.starts_with("http") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        })
    }

    async fn list_deployments(&self, dir: &Path, project: &ProjectRef) -> AppResult<Vec<DeploymentRecord>> {
        let mut command = format!("{} list", self.bin());
        if let Some(name) = project.display_name() {
            command.push(' ');
            command.push_str(&shell_quote(name));
        }
        command.push_str(" --json -n 20");
        let result = self.cli.check(self.cli.query(&self.cli.spec(command, dir)).await)?;
        parse_deployment_list(&result.stdout)
            .ok_or_else(|| self.cli.error(ErrorCode::UnknownProviderError, "Could not read the deployment list."))
    }

    async fn resolve_deployment(&self, dir: &Path, reference: &str) -> AppResult<String> {
        if is_url(reference) {
            return Ok(reference.to_string());
        }
        let spec = self.cli.spec(format!("{} inspect {}", self.bin(), shell_quote(reference)), dir);
        let result = self.cli.check(self.cli.query(&spec).await)?;
        extract_deploy_url(&result.combined_output()).ok_or_else(|| {
            AppError::Cli(format!(
                "could not resolve a deployment URL from '{}'; pass a URL or a resolvable reference",
                reference
            ))
        })
    }

    async fn open(&self, dir: &Path, _project: &ProjectRef) -> AppResult<()> {
        let spec = self.cli.spec(format!("{} open", self.bin()), dir);
        self.cli.check(self.cli.once(&spec).await).map(|_| ())
    }

    async fn list_env(&self, scope: EnvScope<'_>) -> AppResult<BTreeMap<String, String>> {
        let pulled = tempfile::Builder::new()
            .prefix(".launchpad-env-")
            .suffix(".env")
            .tempfile()?;
        let command = format!(
            "{} env pull {} --environment {} --yes",
            self.bin(),
            shell_quote(&pulled.path().to_string_lossy()),
            scope.target.as_str()
        );
        self.cli.check(self.cli.query(&self.cli.spec(command, scope.dir)).await)?;
        let text = std::fs::read_to_string(pulled.path())
            .map_err(|error| AppError::Io(format!("failed to read pulled env file: {}", error)))?;
        Ok(parse_dotenv(&text))
    }

    async fn set_env(&self, scope: EnvScope<'_>, key: &str, value: &str) -> AppResult<()> {
        let command = format!("{} env add {} {}", self.bin(), shell_quote(key), scope.target.as_str());
        let spec = self.cli.spec(command, scope.dir).with_stdin(value);
        self.cli.check(self.cli.once(&spec).await).map(|_| ())
    }

    async fn remove_env(&self, scope: EnvScope<'_>, key: &str) -> AppResult<()> {
        let command = format!("{} env rm {} {} -y", self.bin(), shell_quote(key), scope.target.as_str());
        let result = self.cli.once(&self.cli.spec(command, scope.dir)).await;
        if result.succeeded {
            return Ok(());
        }
        let text = result.combined_output().to_lowercase();
        if text.contains("not found") || text.contains("does not exist") {
            return Ok(());
        }
        Err(self.cli.failure(&result).into())
    }

    async fn stream_logs(&self, dir: &Path, project: &ProjectRef, follow: bool) -> AppResult<StreamHandle> {
        let Some(name) = project.display_name() else {
            return Err(self.cli.error(ErrorCode::NotLinked, "No linked Vercel project to read logs for"));
        };
        let mut command = format!("{} logs {}", self.bin(), shell_quote(name));
        if follow {
            command.push_str(" --follow");
        }
        let mut spec = self.cli.spec(command, dir);
        if follow {
            spec.timeout = None;
        }
        Ok(self.cli.executor().run_streamed(&spec))
    }

    async fn generate_config(&self, inputs: &ConfigInputs) -> AppResult<PathBuf> {
        let mut config = serde_json::json!({
            "$schema": "https://openapi.vercel.sh/vercel.json",
            "version": 2,
        });
        if let Some(command) = &inputs.detection.build_command {
            config["buildCommand"] = serde_json::Value::String(command.clone());
        }
        if let Some(publish) = &inputs.detection.publish_dir {
            let relative = publish.strip_prefix(&inputs.dir).unwrap_or(publish);
            config["outputDirectory"] = serde_json::Value::String(relative.to_string_lossy().to_string());
        }
        let body = format!("{}\n", serde_json::to_string_pretty(&config)?);
        write_config_file(inputs.dir.join("vercel.json"), &body, inputs.overwrite)
    }
}
