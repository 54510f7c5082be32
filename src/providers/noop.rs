use super::{write_config_file, EnvScope, Provider};
use crate::context::lock_unpoisoned;
use crate::errors::{AppResult, ErrorCode, ProviderError};
use crate::executor::stream::{OutputChunk, StreamHandle};
use crate::executor::CommandResult;
use crate::models::{
    BuildInputs, BuildResult, CapabilitySet, ConfigInputs, DeployInputs, DeployResult, DeploymentRecord,
    DetectionHint, EnvTarget, ProjectRef, ProviderKind,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Failure knobs for exercising orchestration paths without a real provider.
#[derive(Debug, Clone, Default)]
pub struct NoopBehavior {
    pub require_login: bool,
    pub fail_build: Option<String>,
    /// Deploy fails with this output; a URL is still reported.
    pub fail_deploy: Option<String>,
    /// Deploy completes but reports itself unsuccessful with this message.
    pub reject_deploy: Option<String>,
    pub fail_alias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EnvWrite {
    Set { target: EnvTarget, key: String },
    Remove { target: EnvTarget, key: String },
}

/// Deterministic provider with an in-memory env store; spawns nothing.
#[derive(Debug, Default)]
pub struct NoopProvider {
    behavior: NoopBehavior,
    logged_in: AtomicBool,
    store: Mutex<BTreeMap<EnvTarget, BTreeMap<String, String>>>,
    writes: Mutex<Vec<EnvWrite>>,
    deploys: Mutex<u32>,
    history: Mutex<Vec<DeploymentRecord>>,
}

impl NoopProvider {
    pub fn with_behavior(behavior: NoopBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Prepends a deployment to the history, as a finished deploy would.
    pub fn record_deployment(&self, url: &str, target: EnvTarget, ready: bool) {
        lock_unpoisoned(&self.history).insert(
            0,
            DeploymentRecord {
                url: url.to_string(),
                target,
                ready,
            },
        );
    }

    pub fn seed(&self, target: EnvTarget, entries: &[(&str, &str)]) {
        let mut store = lock_unpoisoned(&self.store);
        let remote = store.entry(target).or_default();
        for (key, value) in entries {
            remote.insert(key.to_string(), value.to_string());
        }
    }

    pub fn remote(&self, target: EnvTarget) -> BTreeMap<String, String> {
        lock_unpoisoned(&self.store).get(&target).cloned().unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<EnvWrite> {
        lock_unpoisoned(&self.writes).clone()
    }

    pub fn deploy_count(&self) -> u32 {
        *lock_unpoisoned(&self.deploys)
    }

    fn slug(project: &ProjectRef) -> String {
        project.display_name().unwrap_or("example").to_string()
    }

    fn error(&self, code: ErrorCode, message: impl Into<String>) -> ProviderError {
        ProviderError::new(code, self.kind().as_str(), message)
    }
}

#[async_trait]
impl Provider for NoopProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Noop
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            local_build: true,
            static_deploy: true,
            env_contexts: vec![EnvTarget::Preview, EnvTarget::Production],
            logs_follow: true,
            alias_domains: true,
            rollback: true,
            ..CapabilitySet::default()
        }
    }

    async fn detect(&self, dir: &Path) -> AppResult<DetectionHint> {
        Ok(DetectionHint {
            framework: Some("static".to_string()),
            publish_dir: Some(dir.join("dist")),
            build_command: None,
        })
    }

    async fn validate_auth(&self, _dir: &Path) -> AppResult<()> {
        if self.behavior.require_login && !self.logged_in.load(Ordering::SeqCst) {
            return Err(self
                .error(ErrorCode::AuthRequired, "Not logged in to the virtual provider.")
                .with_remedy("Log in to the virtual provider first")
                .into());
        }
        Ok(())
    }

    async fn login(&self, _dir: &Path) -> AppResult<()> {
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn link(&self, _dir: &Path, project: &ProjectRef) -> AppResult<ProjectRef> {
        Ok(project.clone())
    }

    async fn build(&self, inputs: &BuildInputs) -> AppResult<BuildResult> {
        if let Some(output) = &self.behavior.fail_build {
            return Err(self.error(ErrorCode::BuildFailed, "Build failed.").with_detail(output.clone()).into());
        }
        let artifact_dir = inputs.publish_dir.clone().unwrap_or_else(|| inputs.dir.join("dist"));
        Ok(BuildResult {
            succeeded: true,
            artifact_dir: Some(artifact_dir),
            message: inputs.no_build.then(|| "build skipped".to_string()),
        })
    }

    async fn deploy(&self, inputs: &DeployInputs) -> AppResult<DeployResult> {
        *lock_unpoisoned(&self.deploys) += 1;
        let slug = Self::slug(&inputs.project);
        let url = format!("https://{}-{}.virtual.app", slug, inputs.target.as_str());
        let logs_url = format!("https://virtual.dev/provider/logs/{}", slug);
        if let Some(output) = &self.behavior.fail_deploy {
            let mut error = self
                .error(ErrorCode::UnknownProviderError, "Deploy failed.")
                .with_detail(output.clone());
            error.url = Some(url);
            error.logs_url = Some(logs_url);
            return Err(error.into());
        }
        if let Some(message) = &self.behavior.reject_deploy {
            return Ok(DeployResult {
                succeeded: false,
                url: Some(url),
                logs_url: Some(logs_url),
                message: Some(message.clone()),
            });
        }
        self.record_deployment(&url, inputs.target, true);
        Ok(DeployResult {
            succeeded: true,
            url: Some(url),
            logs_url: Some(logs_url),
            message: None,
        })
    }

    async fn alias(&self, _dir: &Path, _url: &str, domain: &str) -> AppResult<String> {
        if self.behavior.fail_alias {
            return Err(self.error(ErrorCode::PermissionDenied, format!("cannot alias {}", domain)).into());
        }
        Ok(format!("https://{}", domain))
    }

    async fn open(&self, _dir: &Path, _project: &ProjectRef) -> AppResult<()> {
        Ok(())
    }

    async fn list_deployments(&self, _dir: &Path, _project: &ProjectRef) -> AppResult<Vec<DeploymentRecord>> {
        Ok(lock_unpoisoned(&self.history).clone())
    }

    async fn list_env(&self, scope: EnvScope<'_>) -> AppResult<BTreeMap<String, String>> {
        Ok(self.remote(scope.target))
    }

    async fn set_env(&self, scope: EnvScope<'_>, key: &str, value: &str) -> AppResult<()> {
        lock_unpoisoned(&self.store)
            .entry(scope.target)
            .or_default()
            .insert(key.to_string(), value.to_string());
        lock_unpoisoned(&self.writes).push(EnvWrite::Set {
            target: scope.target,
            key: key.to_string(),
        });
        Ok(())
    }

    async fn remove_env(&self, scope: EnvScope<'_>, key: &str) -> AppResult<()> {
        if let Some(remote) = lock_unpoisoned(&self.store).get_mut(&scope.target) {
            remote.remove(key);
        }
        lock_unpoisoned(&self.writes).push(EnvWrite::Remove {
            target: scope.target,
            key: key.to_string(),
        });
        Ok(())
    }

    async fn stream_logs(&self, _dir: &Path, project: &ProjectRef, _follow: bool) -> AppResult<StreamHandle> {
        let line = format!("[virtual] no runtime logs for {}\n", Self::slug(project));
        let result = CommandResult {
            succeeded: true,
            exit_code: 0,
            stdout: line.clone(),
            ..CommandResult::default()
        };
        Ok(StreamHandle::completed(result, vec![OutputChunk::stdout(line)]))
    }

    async fn generate_config(&self, inputs: &ConfigInputs) -> AppResult<PathBuf> {
        let config = serde_json::json!({
            "provider": "virtual",
            "framework": inputs.detection.framework.as_deref().unwrap_or("static"),
            "publishDir": "dist",
        });
        let body = format!("{}\n", serde_json::to_string_pretty(&config)?);
        write_config_file(inputs.dir.join("virtual.config.json"), &body, inputs.overwrite)
    }
}

#[cfg(test)]
mod tests {
    use super::{EnvWrite, NoopBehavior, NoopProvider};
    use crate::errors::ErrorCode;
    use crate::models::{DeployInputs, EnvTarget, ProjectRef};
    use crate::providers::{EnvScope, Provider};
    use std::path::{Path, PathBuf};

    #[tokio::test]
    async fn deploy_urls_are_deterministic() {
        let provider = NoopProvider::default();
        let inputs = DeployInputs {
            dir: PathBuf::from("."),
            target: EnvTarget::Production,
            project: ProjectRef {
                slug: Some("shop".to_string()),
                ..ProjectRef::default()
            },
            artifact_dir: None,
        };
        let result = provider.deploy(&inputs).await.expect("deploy");
        assert_eq!(result.url.as_deref(), Some("https://shop-production.virtual.app"));
        assert_eq!(result.logs_url.as_deref(), Some("https://virtual.dev/provider/logs/shop"));
    }

    #[tokio::test]
    async fn login_clears_auth_requirement() {
        let provider = NoopProvider::with_behavior(NoopBehavior {
            require_login: true,
            ..NoopBehavior::default()
        });
        let err = provider.validate_auth(Path::new(".")).await.expect_err("needs login");
        assert_eq!(err.provider_error().map(|e| e.code), Some(ErrorCode::AuthRequired));
        provider.login(Path::new(".")).await.expect("login");
        provider.validate_auth(Path::new(".")).await.expect("logged in");
    }

    #[tokio::test]
    async fn env_store_records_writes() {
        let provider = NoopProvider::default();
        let project = ProjectRef::default();
        let scope = EnvScope {
            dir: Path::new("."),
            project: &project,
            target: EnvTarget::Preview,
        };
        provider.set_env(scope, "K", "v").await.expect("set");
        provider.remove_env(scope, "MISSING").await.expect("remove missing");
        assert_eq!(provider.remote(EnvTarget::Preview).get("K").map(String::as_str), Some("v"));
        assert_eq!(
            provider.writes(),
            vec![
                EnvWrite::Set {
                    target: EnvTarget::Preview,
                    key: "K".to_string()
                },
                EnvWrite::Remove {
                    target: EnvTarget::Preview,
                    key: "MISSING".to_string()
                },
            ]
        );
    }
}
