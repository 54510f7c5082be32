use crate::context::RuntimeContext;
use crate::diagnostics::classifier;
use crate::diagnostics::hints::Hint;
use crate::envsync::{EnvReconciler, EnvSource, SyncOptions};
use crate::errors::{AppError, ErrorCode, ProviderError};
use crate::models::{BuildInputs, DeployInputs, DetectionHint, EnvTarget, ProjectRef, ProviderKind};
use crate::providers::detect::detect_project;
use crate::providers::Provider;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Detect,
    Auth,
    EnvSync,
    Link,
    Build,
    Deploy,
    Alias,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Auth => "auth",
            Self::EnvSync => "envSync",
            Self::Link => "link",
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Alias => "alias",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Planned,
    Ok,
    Skipped,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnvSyncRequest {
    pub source: EnvSource,
    pub options: SyncOptions,
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub provider: ProviderKind,
    pub dir: PathBuf,
    pub target: EnvTarget,
    pub project: ProjectRef,
    pub alias: Option<String>,
    pub no_build: bool,
    pub local_build: bool,
    pub build_command: Option<String>,
    pub env_sync: Option<EnvSyncRequest>,
    pub dry_run: bool,
    pub login_on_auth_failure: bool,
}

impl PipelineRequest {
    pub fn new(provider: ProviderKind, dir: impl Into<PathBuf>, target: EnvTarget) -> Self {
        Self {
            provider,
            dir: dir.into(),
            target,
            project: ProjectRef::default(),
            alias: None,
            no_build: false,
            local_build: false,
            build_command: None,
            env_sync: None,
            dry_run: false,
            login_on_auth_failure: true,
        }
    }
}

/// The single terminal result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub ok: bool,
    pub provider: ProviderKind,
    pub target: EnvTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_url: Option<String>,
    pub duration_ms: u64,
    pub stages: Vec<StageReport>,
    pub warnings: Vec<String>,
    pub hints: Vec<Hint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

/// One stage transition, emitted while a run is in progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub run_id: String,
    pub r#type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

pub type EventSink = Arc<dyn Fn(&StageEvent) + Send + Sync>;

/// Any failure surfaced by a stage, carried as a provider error in the summary.
fn as_provider_error(kind: ProviderKind, error: AppError) -> ProviderError {
    match error {
        AppError::Provider(inner) => inner,
        AppError::Timeout(message) => ProviderError::new(ErrorCode::Timeout, kind.as_str(), message),
        other => ProviderError::new(ErrorCode::UnknownProviderError, kind.as_str(), other.to_string()),
    }
}

struct Run {
    id: String,
    seq: AtomicU64,
    stages: Vec<StageReport>,
    warnings: Vec<String>,
}

/// Drives one provider through detect, auth, env, link, build, deploy and alias.
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    ctx: Arc<RuntimeContext>,
    events: Option<EventSink>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Provider>, ctx: Arc<RuntimeContext>) -> Self {
        Self {
            provider,
            ctx,
            events: None,
        }
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    fn emit(&self, run: &Run, event_type: &str, payload: serde_json::Value) {
        let Some(sink) = &self.events else {
            return;
        };
        let event = StageEvent {
            run_id: run.id.clone(),
            r#type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            seq: run.seq.fetch_add(1, Ordering::SeqCst),
        };
        sink(&event);
    }

    fn record(&self, run: &mut Run, stage: Stage, status: StageStatus, started: Instant, message: Option<String>) {
        let report = StageReport {
            stage,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            message,
        };
        info!(
            provider = self.provider.kind().as_str(),
            stage = stage.as_str(),
            status = ?status,
            duration_ms = report.duration_ms,
            "stage finished"
        );
        self.emit(
            run,
            "stage.finished",
            json!({ "stage": stage, "status": status, "durationMs": report.duration_ms, "message": report.message }),
        );
        run.stages.push(report);
    }

    fn start(&self, run: &Run, stage: Stage) -> Instant {
        self.emit(run, "stage.started", json!({ "stage": stage }));
        Instant::now()
    }

    fn summary(&self, request: &PipelineRequest, run: Run) -> PipelineSummary {
        PipelineSummary {
            ok: false,
            provider: self.provider.kind(),
            target: request.target,
            url: None,
            logs_url: None,
            alias_url: None,
            duration_ms: 0,
            stages: run.stages,
            warnings: run.warnings,
            hints: self.ctx.hints().emitted(),
            error: None,
        }
    }

    fn fail(&self, request: &PipelineRequest, mut run: Run, stage: Stage, started: Instant, error: ProviderError) -> PipelineSummary {
        warn!(provider = self.provider.kind().as_str(), stage = stage.as_str(), code = %error.code, "{}", error.message);
        self.record(&mut run, stage, StageStatus::Failed, started, Some(error.message.clone()));
        let mut summary = self.summary(request, run);
        summary.url = error.url.clone();
        summary.logs_url = error.logs_url.clone();
        summary.error = Some(error);
        summary
    }

    fn plan(&self, request: &PipelineRequest) -> Vec<Stage> {
        let caps = self.provider.capabilities();
        let mut stages = vec![Stage::Detect, Stage::Auth];
        if request.env_sync.is_some() {
            stages.push(Stage::EnvSync);
        }
        if caps.project_linking {
            stages.push(Stage::Link);
        }
        stages.push(Stage::Build);
        stages.push(Stage::Deploy);
        if request.alias.is_some() {
            stages.push(Stage::Alias);
        }
        stages
    }

    async fn detect(&self, request: &PipelineRequest) -> Result<DetectionHint, AppError> {
        match detect_project(&request.dir) {
            Ok(hint) => Ok(hint),
            Err(error) => {
                info!(error = %error, "generic detection failed; asking the provider");
                self.provider.detect(&request.dir).await
            }
        }
    }

    /// One login attempt, then one re-check.
    async fn authenticate(&self, request: &PipelineRequest, run: &mut Run) -> Result<(), ProviderError> {
        let kind = self.provider.kind();
        let first = match self.provider.validate_auth(&request.dir).await {
            Ok(()) => return Ok(()),
            Err(error) => as_provider_error(kind, error),
        };
        if !request.login_on_auth_failure || !matches!(first.code, ErrorCode::AuthRequired | ErrorCode::AuthExpired) {
            return Err(first);
        }

        run.warnings.push(format!("{}: {}; attempting login", kind.as_str(), first.message));
        if let Err(error) = self.provider.login(&request.dir).await {
            warn!(provider = kind.as_str(), error = %error, "login attempt failed");
        }
        self.provider.validate_auth(&request.dir).await.map_err(|error| {
            let mut error = as_provider_error(kind, error);
            error.code = ErrorCode::AuthRequired;
            if error.remedy.is_none() {
                error.remedy = first.remedy.clone();
            }
            error
        })
    }

    pub async fn run(&self, request: &PipelineRequest) -> PipelineSummary {
        let kind = self.provider.kind();
        let caps = self.provider.capabilities();
        let mut run = Run {
            id: Uuid::new_v4().to_string(),
            seq: AtomicU64::new(0),
            stages: Vec::new(),
            warnings: Vec::new(),
        };
        self.emit(&run, "run.started", json!({ "provider": kind, "target": request.target, "dryRun": request.dry_run }));

        if request.dry_run {
            for stage in self.plan(request) {
                run.stages.push(StageReport {
                    stage,
                    status: StageStatus::Planned,
                    duration_ms: 0,
                    message: None,
                });
            }
            run.warnings.push("dry run: no provider commands were executed".to_string());
            let mut summary = self.summary(request, run);
            summary.ok = true;
            return summary;
        }

        let started = self.start(&run, Stage::Detect);
        let detection = match self.detect(request).await {
            Ok(hint) => hint,
            Err(error) => return self.fail(request, run, Stage::Detect, started, as_provider_error(kind, error)),
        };
        self.record(&mut run, Stage::Detect, StageStatus::Ok, started, detection.framework.clone());

        let started = self.start(&run, Stage::Auth);
        if let Err(error) = self.authenticate(request, &mut run).await {
            return self.fail(request, run, Stage::Auth, started, error);
        }
        self.record(&mut run, Stage::Auth, StageStatus::Ok, started, None);

        if let Some(env) = &request.env_sync {
            let started = self.start(&run, Stage::EnvSync);
            if !caps.env_contexts.contains(&request.target) {
                let message = format!("{} has no {} env store", kind.as_str(), request.target.as_str());
                run.warnings.push(message.clone());
                self.record(&mut run, Stage::EnvSync, StageStatus::Skipped, started, Some(message));
            } else {
                let reconciler = EnvReconciler::new(self.provider.clone(), self.ctx.clone());
                let outcome = match reconciler.load_local(&env.source) {
                    Ok(local) => {
                        reconciler
                            .sync(&request.dir, &request.project, &[request.target], &local, &env.options)
                            .await
                    }
                    Err(error) => Err(error),
                };
                match outcome {
                    Ok(report) if report.ok() => {
                        let written: usize = report.targets.iter().map(|t| t.written.len()).sum();
                        self.record(
                            &mut run,
                            Stage::EnvSync,
                            StageStatus::Ok,
                            started,
                            Some(format!("{} values written", written)),
                        );
                    }
                    Ok(report) => {
                        let error = ProviderError::new(ErrorCode::EnvMissing, kind.as_str(), report.violations.join("; "))
                            .with_remedy("Reconcile the env file with the remote store or drop --fail-on-add/--fail-on-remove");
                        return self.fail(request, run, Stage::EnvSync, started, error);
                    }
                    Err(error) => return self.fail(request, run, Stage::EnvSync, started, as_provider_error(kind, error)),
                }
            }
        }

        let mut project = request.project.clone();
        if caps.project_linking {
            let started = self.start(&run, Stage::Link);
            match self.provider.link(&request.dir, &project).await {
                Ok(linked) => project = linked,
                Err(error) => return self.fail(request, run, Stage::Link, started, as_provider_error(kind, error)),
            }
            self.record(&mut run, Stage::Link, StageStatus::Ok, started, project.display_name().map(str::to_string));
        }

        let clock = Instant::now();
        let started = self.start(&run, Stage::Build);
        let mut artifact_dir = None;
        if caps.remote_build && !request.local_build {
            self.record(
                &mut run,
                Stage::Build,
                StageStatus::Skipped,
                started,
                Some("provider builds remotely".to_string()),
            );
        } else {
            let inputs = BuildInputs {
                dir: request.dir.clone(),
                target: request.target,
                publish_dir: detection.publish_dir.clone(),
                command: request.build_command.clone().or_else(|| detection.build_command.clone()),
                no_build: request.no_build,
            };
            match self.provider.build(&inputs).await {
                Ok(result) if result.succeeded => {
                    artifact_dir = result.artifact_dir;
                    self.record(&mut run, Stage::Build, StageStatus::Ok, started, result.message);
                }
                Ok(result) => {
                    let message = result.message.unwrap_or_else(|| "Build failed.".to_string());
                    let error = ProviderError::new(ErrorCode::BuildFailed, kind.as_str(), message);
                    return self.fail(request, run, Stage::Build, started, error);
                }
                Err(error) => return self.fail(request, run, Stage::Build, started, as_provider_error(kind, error)),
            }
        }

        let started = self.start(&run, Stage::Deploy);
        let inputs = DeployInputs {
            dir: request.dir.clone(),
            target: request.target,
            project: project.clone(),
            artifact_dir,
        };
        let deployed = match self.provider.deploy(&inputs).await {
            Ok(result) if result.succeeded => result,
            Ok(result) => {
                let raw = result.message.unwrap_or_else(|| "Deploy failed.".to_string());
                let classification = classifier::classify(kind, &raw);
                let mut error = ProviderError::new(classification.code, kind.as_str(), classification.message)
                    .with_detail(raw);
                error.remedy = classification.remedy;
                error.url = result.url;
                error.logs_url = result.logs_url;
                let mut summary = self.fail(request, run, Stage::Deploy, started, error);
                summary.duration_ms = clock.elapsed().as_millis() as u64;
                return summary;
            }
            Err(error) => {
                let mut summary = self.fail(request, run, Stage::Deploy, started, as_provider_error(kind, error));
                summary.duration_ms = clock.elapsed().as_millis() as u64;
                return summary;
            }
        };
        let duration_ms = clock.elapsed().as_millis() as u64;
        self.record(&mut run, Stage::Deploy, StageStatus::Ok, started, deployed.url.clone());

        let mut alias_url = None;
        if let Some(domain) = &request.alias {
            let started = self.start(&run, Stage::Alias);
            let outcome = match (&deployed.url, caps.alias_domains) {
                (_, false) => Err(format!("{} does not support alias domains", kind.as_str())),
                (None, true) => Err("deploy returned no URL to alias".to_string()),
                (Some(url), true) => self
                    .provider
                    .alias(&request.dir, url, domain)
                    .await
                    .map_err(|error| error.to_string()),
            };
            match outcome {
                Ok(url) => {
                    self.record(&mut run, Stage::Alias, StageStatus::Ok, started, Some(url.clone()));
                    alias_url = Some(url);
                }
                Err(message) => {
                    warn!(provider = kind.as_str(), domain = %domain, "alias failed: {}", message);
                    run.warnings.push(format!("alias {} failed: {}", domain, message));
                    self.record(&mut run, Stage::Alias, StageStatus::Warning, started, Some(message));
                }
            }
        }

        let mut summary = self.summary(request, run);
        summary.ok = true;
        summary.url = deployed.url;
        summary.logs_url = deployed.logs_url;
        summary.alias_url = alias_url;
        summary.duration_ms = duration_ms;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::{Orchestrator, PipelineRequest, Stage, StageEvent, StageStatus};
    use crate::context::RuntimeContext;
    use crate::errors::ErrorCode;
    use crate::models::{EnvTarget, ProjectRef, ProviderKind};
    use crate::providers::noop::{NoopBehavior, NoopProvider};
    use std::sync::{Arc, Mutex};

    fn request(dir: &std::path::Path) -> PipelineRequest {
        let mut request = PipelineRequest::new(ProviderKind::Noop, dir, EnvTarget::Preview);
        request.project = ProjectRef {
            slug: Some("shop".to_string()),
            ..ProjectRef::default()
        };
        request
    }

    #[tokio::test]
    async fn successful_run_reports_urls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = Orchestrator::new(Arc::new(NoopProvider::default()), Arc::new(RuntimeContext::default()));
        let summary = orchestrator.run(&request(dir.path())).await;
        assert!(summary.ok);
        assert_eq!(summary.url.as_deref(), Some("https://shop-preview.virtual.app"));
        assert_eq!(summary.logs_url.as_deref(), Some("https://virtual.dev/provider/logs/shop"));
        let stages: Vec<Stage> = summary.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![Stage::Detect, Stage::Auth, Stage::Build, Stage::Deploy]);
    }

    #[tokio::test]
    async fn deploy_failure_is_never_ok_and_keeps_partial_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = NoopProvider::with_behavior(NoopBehavior {
            fail_deploy: Some("Error: upstream exploded".to_string()),
            ..NoopBehavior::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(provider), Arc::new(RuntimeContext::default()));
        let summary = orchestrator.run(&request(dir.path())).await;
        assert!(!summary.ok);
        let error = summary.error.expect("error payload");
        assert_eq!(error.code, ErrorCode::UnknownProviderError);
        assert_eq!(summary.url.as_deref(), Some("https://shop-preview.virtual.app"));
        assert_eq!(summary.stages.last().map(|s| s.status), Some(StageStatus::Failed));
    }

    #[tokio::test]
    async fn unsuccessful_deploy_result_is_classified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = NoopProvider::with_behavior(NoopBehavior {
            reject_deploy: Some("Error: Cannot find module 'left-pad'".to_string()),
            ..NoopBehavior::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(provider), Arc::new(RuntimeContext::default()));
        let summary = orchestrator.run(&request(dir.path())).await;
        assert!(!summary.ok);
        assert_eq!(summary.url.as_deref(), Some("https://shop-preview.virtual.app"));
        let error = summary.error.expect("error payload");
        assert_eq!(error.code, ErrorCode::ModuleNotFound);
        assert!(error.remedy.is_some());
        assert_eq!(error.detail.as_deref(), Some("Error: Cannot find module 'left-pad'"));
    }

    #[tokio::test]
    async fn auth_failure_gets_one_login_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = NoopProvider::with_behavior(NoopBehavior {
            require_login: true,
            ..NoopBehavior::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(provider), Arc::new(RuntimeContext::default()));
        let summary = orchestrator.run(&request(dir.path())).await;
        assert!(summary.ok);
        assert!(summary.warnings.iter().any(|w| w.contains("attempting login")));

        let provider = NoopProvider::with_behavior(NoopBehavior {
            require_login: true,
            ..NoopBehavior::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(provider), Arc::new(RuntimeContext::default()));
        let mut ci = request(dir.path());
        ci.login_on_auth_failure = false;
        let summary = orchestrator.run(&ci).await;
        assert!(!summary.ok);
        assert_eq!(summary.error.map(|e| e.code), Some(ErrorCode::AuthRequired));
    }

    #[tokio::test]
    async fn alias_failure_degrades_to_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = NoopProvider::with_behavior(NoopBehavior {
            fail_alias: true,
            ..NoopBehavior::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(provider), Arc::new(RuntimeContext::default()));
        let mut req = request(dir.path());
        req.alias = Some("shop.example.com".to_string());
        let summary = orchestrator.run(&req).await;
        assert!(summary.ok);
        assert_eq!(summary.alias_url, None);
        assert_eq!(summary.stages.last().map(|s| s.status), Some(StageStatus::Warning));
    }

    #[tokio::test]
    async fn dry_run_plans_without_deploying() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(NoopProvider::default());
        let events: Arc<Mutex<Vec<StageEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let orchestrator = Orchestrator::new(provider.clone(), Arc::new(RuntimeContext::default()))
            .with_events(Arc::new(move |event: &StageEvent| {
                sink.lock().expect("events lock").push(event.clone());
            }));
        let mut req = request(dir.path());
        req.dry_run = true;
        let summary = orchestrator.run(&req).await;
        assert!(summary.ok);
        assert_eq!(provider.deploy_count(), 0);
        assert!(summary.stages.iter().all(|s| s.status == StageStatus::Planned));
        assert_eq!(events.lock().expect("events lock").len(), 1);
    }
}
