use super::detect::{detect_project, detect_static};
use super::toolcheck::first_available;
use super::{run_project_build, shell_quote, write_config_file, CliDriver, Provider};
use crate::errors::{AppError, AppResult, ErrorCode, ProviderError};
use crate::models::{
    BuildInputs, BuildResult, CapabilitySet, ConfigInputs, DeployInputs, DeployResult, DetectionHint, ProjectRef,
    ProviderKind,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;

pub(crate) const GH_PAGES_CANDIDATES: [&str; 2] = ["gh-pages", "npx -y gh-pages"];

static REMOTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com[:/]([^/\s]+)/([^/\s]+?)(?:\.git)?/?$").expect("valid remote regex")
});

/// `(owner, repo)` from an `origin` remote in SSH or HTTPS form.
pub fn parse_remote(remote: &str) -> Option<(String, String)> {
    let caps = REMOTE_RE.captures(remote.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub fn pages_url(owner: &str, repo: &str) -> String {
    if repo.eq_ignore_ascii_case(&format!("{}.github.io", owner)) {
        format!("https://{}.github.io/", owner)
    } else {
        format!("https://{}.github.io/{}/", owner, repo)
    }
}

pub fn actions_url(owner: &str, repo: &str) -> String {
    format!("https://github.com/{}/{}/actions", owner, repo)
}

const WORKFLOW: &str = "name: Deploy to GitHub Pages
on:
  push:
    branches: [main]
permissions:
  contents: write
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: actions/setup-node@v4
        with:
          node-version: 20
      - run: npm ci
      - run: npm run build
      - run: npx -y gh-pages -d __PUBLISH_DIR__ --dotfiles
";

#[derive(Debug)]
pub struct GithubPagesProvider {
    cli: CliDriver,
    publisher: OnceCell<String>,
}

impl GithubPagesProvider {
    pub fn new(cli: CliDriver) -> Self {
        Self {
            cli,
            publisher: OnceCell::new(),
        }
    }

    async fn bin(&self, dir: &Path) -> String {
        self.publisher
            .get_or_init(|| async {
                if let Some(custom) = self.cli.override_binary() {
                    return custom.to_string();
                }
                first_available(self.cli.executor(), &GH_PAGES_CANDIDATES, dir)
                    .await
                    .unwrap_or_else(|| GH_PAGES_CANDIDATES[1].to_string())
            })
            .await
            .clone()
    }

    async fn origin(&self, dir: &Path) -> Option<(String, String)> {
        let result = self.cli.query(&self.cli.spec("git remote get-url origin", dir)).await;
        if !result.succeeded {
            return None;
        }
        parse_remote(&result.stdout)
    }
}

#[async_trait]
impl Provider for GithubPagesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GithubPages
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            local_build: true,
            static_deploy: true,
            ..CapabilitySet::default()
        }
    }

    async fn detect(&self, dir: &Path) -> AppResult<DetectionHint> {
        detect_project(dir).or_else(|_| {
            Ok(detect_static(dir).unwrap_or_else(|| DetectionHint {
                framework: None,
                publish_dir: Some(dir.join("dist")),
                build_command: None,
            }))
        })
    }

    async fn validate_auth(&self, dir: &Path) -> AppResult<()> {
        let result = self.cli.query(&self.cli.spec("git ls-remote --heads origin", dir)).await;
        if result.succeeded {
            return Ok(());
        }
        let mut error = self.cli.failure(&result);
        if !matches!(error.code, ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::IdleTimeout) {
            error.code = ErrorCode::AuthRequired;
            error.message = "Cannot push to the origin remote.".to_string();
            error.remedy = Some("Run: gh auth login (or check the origin remote)".to_string());
        }
        Err(error.into())
    }

    async fn login(&self, dir: &Path) -> AppResult<()> {
        let spec = self.cli.spec("gh auth login", dir).attached();
        self.cli.check(self.cli.once(&spec).await).map(|_| ())
    }

    /// Publishing targets the repository itself; there is no remote project to link.
    async fn link(&self, _dir: &Path, project: &ProjectRef) -> AppResult<ProjectRef> {
        Ok(project.clone())
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
        let marker = artifact.join(".nojekyll");
        if !marker.exists() {
            std::fs::write(&marker, "")
                .map_err(|error| AppError::Io(format!("failed to write {}: {}", marker.display(), error)))?;
        }

        let bin = self.bin(&inputs.dir).await;
        let command = format!("{} -d {} --dotfiles", bin, shell_quote(&artifact.to_string_lossy()));
        let result = self.cli.once(&self.cli.deploy_spec(command, &inputs.dir)).await;
        let origin = self.origin(&inputs.dir).await;
        let url = origin.as_ref().map(|(owner, repo)| pages_url(owner, repo));
        let logs_url = origin.as_ref().map(|(owner, repo)| actions_url(owner, repo));
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
        let publish = inputs
            .detection
            .publish_dir
            .as_ref()
            .map(|publish| publish.strip_prefix(&inputs.dir).unwrap_or(publish).to_path_buf())
            .unwrap_or_else(|| PathBuf::from("dist"));
        let workflows = inputs.dir.join(".github").join("workflows");
        std::fs::create_dir_all(&workflows)
            .map_err(|error| AppError::Io(format!("failed to create {}: {}", workflows.display(), error)))?;
        let body = WORKFLOW.replace("__PUBLISH_DIR__", &publish.to_string_lossy());
        write_config_file(workflows.join("deploy-pages.yml"), &body, inputs.overwrite)
    }
}

#[cfg(test)]
mod tests {
    use super::{actions_url, pages_url, parse_remote};

    #[test]
    fn parses_ssh_and_https_remotes() {
        assert_eq!(
            parse_remote("git@github.com:acme/site.git\n"),
            Some(("acme".to_string(), "site".to_string()))
        );
        assert_eq!(
            parse_remote("https://github.com/acme/docs"),
            Some(("acme".to_string(), "docs".to_string()))
        );
        assert_eq!(parse_remote("https://gitlab.com/acme/site.git"), None);
    }

    #[test]
    fn user_site_repo_publishes_at_root() {
        assert_eq!(pages_url("acme", "acme.github.io"), "https://acme.github.io/");
        assert_eq!(pages_url("acme", "site"), "https://acme.github.io/site/");
        assert_eq!(actions_url("acme", "site"), "https://github.com/acme/site/actions");
    }
}
