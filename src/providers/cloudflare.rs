use super::detect::detect_project;
use super::toolcheck::first_available;
use super::{dir_name, run_project_build, shell_quote, slugify, write_config_file, CliDriver, Provider};
use crate::errors::{AppResult, ErrorCode, ProviderError};
use crate::models::{
    BuildInputs, BuildResult, CapabilitySet, ConfigInputs, DeployInputs, DeployResult, DetectionHint, ProjectRef,
    ProviderKind,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;

pub(crate) const WRANGLER_CANDIDATES: [&str; 3] = ["wrangler", "npx -y wrangler", "pnpm dlx wrangler"];

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("valid url regex"));

/// Deployment URL (preferring `*.pages.dev`) and dashboard link found in wrangler output.
pub fn extract_urls(text: &str) -> (Option<String>, Option<String>) {
    let urls: Vec<&str> = URL_RE.find_iter(text).map(|m| m.as_str()).collect();
    let deploy = urls
        .iter()
        .find(|url| url.contains(".pages.dev"))
        .or_else(|| urls.iter().find(|url| !url.contains("dash.cloudflare.com")))
        .map(|url| url.to_string());
    let dashboard = urls
        .iter()
        .find(|url| url.contains("dash.cloudflare.com/"))
        .map(|url| url.to_string());
    (deploy, dashboard)
}

pub fn dashboard_url(project: &str) -> String {
    format!("https://dash.cloudflare.com/?to=/:account/pages/view/{}", project)
}

#[derive(Debug)]
pub struct CloudflareProvider {
    cli: CliDriver,
    wrangler: OnceCell<Option<String>>,
}

impl CloudflareProvider {
    pub fn new(cli: CliDriver) -> Self {
        Self {
            cli,
            wrangler: OnceCell::new(),
        }
    }

    /// Override, then the candidates in order; `None` when none of them answers.
    async fn resolve_wrangler(&self, dir: &Path) -> Option<String> {
        self.wrangler
            .get_or_init(|| async {
                let executor = self.cli.executor();
                if let Some(custom) = self.cli.override_binary() {
                    if executor.has(custom, dir).await {
                        return Some(custom.to_string());
                    }
                    tracing::warn!(binary = custom, "wrangler override does not answer --version");
                }
                first_available(executor, &WRANGLER_CANDIDATES, dir).await
            })
            .await
            .clone()
    }

    async fn bin(&self, dir: &Path) -> String {
        self.resolve_wrangler(dir)
            .await
            .unwrap_or_else(|| WRANGLER_CANDIDATES[0].to_string())
    }

    fn project_name(project: &ProjectRef, dir: &Path) -> String {
        let raw = project
            .project_id
            .clone()
            .or_else(|| project.slug.clone())
            .unwrap_or_else(|| dir_name(dir));
        slugify(&raw)
    }
}

#[async_trait]
impl Provider for CloudflareProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflare
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            local_build: true,
            remote_build: false,
            static_deploy: true,
            serverless: true,
            edge_functions: true,
            ssr: true,
            project_linking: true,
            env_contexts: Vec::new(),
            logs_follow: false,
            alias_domains: false,
            rollback: false,
        }
    }

    async fn detect(&self, dir: &Path) -> AppResult<DetectionHint> {
        Ok(detect_project(dir).unwrap_or_else(|_| DetectionHint {
            framework: None,
            publish_dir: Some(dir.join("dist")),
            build_command: None,
        }))
    }

    async fn validate_auth(&self, dir: &Path) -> AppResult<()> {
        let Some(bin) = self.resolve_wrangler(dir).await else {
            return Err(ProviderError::new(ErrorCode::ModuleNotFound, self.kind().as_str(), "Wrangler not found.")
                .with_remedy("Install with: npm i -g wrangler")
                .into());
        };
        let result = self.cli.query(&self.cli.spec(format!("{} whoami", bin), dir)).await;
        if result.succeeded {
            return Ok(());
        }
        let mut error = self.cli.failure(&result);
        if !matches!(error.code, ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::IdleTimeout) {
            error.code = ErrorCode::AuthRequired;
            error.message = "Wrangler not logged in.".to_string();
            error.remedy = Some("Run: wrangler login".to_string());
        }
        Err(error.into())
    }

    async fn login(&self, dir: &Path) -> AppResult<()> {
        let bin = self.bin(dir).await;
        let spec = self.cli.spec(format!("{} login", bin), dir).attached();
        self.cli.check(self.cli.once(&spec).await).map(|_| ())
    }

    /// Pages projects are addressed by name; creating one that exists is fine.
    async fn link(&self, dir: &Path, project: &ProjectRef) -> AppResult<ProjectRef> {
        let name = Self::project_name(project, dir);
        let bin = self.bin(dir).await;
        let attempts = [
            format!("{} pages project create {} --production-branch main", bin, shell_quote(&name)),
            format!("{} pages project create {}", bin, shell_quote(&name)),
        ];
        for command in attempts {
            let result = self.cli.once(&self.cli.spec(command, dir)).await;
            if result.succeeded || result.combined_output().to_lowercase().contains("already exists") {
                break;
            }
            tracing::warn!(project = %name, exit_code = result.exit_code, "pages project create failed");
        }
        Ok(ProjectRef {
            project_id: Some(name.clone()),
            org_id: project.org_id.clone(),
            slug: Some(name),
        })
    }

    async fn build(&self, inputs: &BuildInputs) -> AppResult<BuildResult> {
        run_project_build(&self.cli, inputs, None).await
    }

    async fn deploy(&self, inputs: &DeployInputs) -> AppResult<DeployResult> {
        let artifact = inputs
            .artifact_dir
            .clone()
            .unwrap_or_else(|| inputs.dir.join("dist"));
        if !artifact.is_dir() {
            return Err(ProviderError::new(
                ErrorCode::BuildFailed,
                self.kind().as_str(),
                format!("Artifact directory not found: {}", artifact.display()),
            )
            .with_remedy("Run your build or set the publish directory")
            .into());
        }
        let name = Self::project_name(&inputs.project, &inputs.dir);
        let bin = self.bin(&inputs.dir).await;
        let command = format!(
            "{} pages deploy {} --project-name {}",
            bin,
            shell_quote(&artifact.to_string_lossy()),
            shell_quote(&name)
        );
        let result = self.cli.once(&self.cli.deploy_spec(command, &inputs.dir)).await;
        let (url, dashboard) = extract_urls(&result.combined_output());
        let logs_url = dashboard.or_else(|| Some(dashboard_url(&name)));
        if !result.succeeded {
            let mut error = self.cli.failure(&result);
            error.url = url;
            error.logs_url = logs_url;
            return Err(error.into());
        }
        Ok(DeployResult {
            succeeded: true,
            url,
            logs_url,
            message: None,
        })
    }

    async fn generate_config(&self, inputs: &ConfigInputs) -> AppResult<PathBuf> {
        let name = slugify(&dir_name(&inputs.dir));
        let output = inputs
            .detection
            .publish_dir
            .as_ref()
            .map(|publish| publish.strip_prefix(&inputs.dir).unwrap_or(publish).to_path_buf())
            .unwrap_or_else(|| PathBuf::from("dist"));
        let body = format!(
            "name = \"{}\"\ncompatibility_date = \"{}\"\npages_build_output_dir = \"{}\"\n",
            name,
            chrono::Utc::now().format("%Y-%m-%d"),
            output.to_string_lossy()
        );
        write_config_file(inputs.dir.join("wrangler.toml"), &body, inputs.overwrite)
    }
}
