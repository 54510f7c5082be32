use crate::config::{EnvPolicy, ProjectConfig, ProjectsConfig};
use crate::context::{lock_unpoisoned, RuntimeContext};
use crate::envsync::{EnvReconciler, EnvReport, EnvSource, SyncOptions};
use crate::errors::AppResult;
use crate::graph;
use crate::models::{EnvTarget, ProjectRef, ProviderKind};
use crate::pipeline::{Orchestrator, PipelineRequest, PipelineSummary};
use crate::providers::Provider;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::{self, JoinSet};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub name: String,
    pub provider: ProviderKind,
}

#[derive(Debug, Default)]
struct Slots {
    global: usize,
    per_provider: HashMap<ProviderKind, usize>,
}

/// Bounded worker pool: at most `global_limit` jobs at once and at most
/// `per_provider_limit` of them against the same provider.
#[derive(Debug, Clone)]
pub struct Scheduler {
    slots: Arc<Mutex<Slots>>,
    global_limit: usize,
    per_provider_limit: usize,
}

struct SlotGuard {
    scheduler: Scheduler,
    provider: ProviderKind,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.release_slot(self.provider);
    }
}

impl Scheduler {
    pub fn new(global_limit: usize, per_provider_limit: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            global_limit: global_limit.max(1),
            per_provider_limit: per_provider_limit.max(1),
        }
    }

    fn try_reserve_slot(&self, provider: ProviderKind) -> bool {
        let mut slots = lock_unpoisoned(&self.slots);
        if slots.global >= self.global_limit {
            return false;
        }
        let running = slots.per_provider.get(&provider).copied().unwrap_or(0);
        if running >= self.per_provider_limit {
            return false;
        }
        slots.global += 1;
        slots.per_provider.insert(provider, running + 1);
        true
    }

    fn release_slot(&self, provider: ProviderKind) {
        let mut slots = lock_unpoisoned(&self.slots);
        slots.global = slots.global.saturating_sub(1);
        if let Some(entry) = slots.per_provider.get_mut(&provider) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// Runs every job of one layer under the limits; results come back in input order.
    /// A job that panicked is returned with `None`.
    pub async fn run_layer<T, F, Fut>(&self, jobs: Vec<ScheduledJob>, work: F) -> Vec<(ScheduledJob, Option<T>)>
    where
        F: Fn(ScheduledJob) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let total = jobs.len();
        let mut pending: VecDeque<(usize, ScheduledJob)> = jobs.into_iter().enumerate().collect();
        let mut finished: Vec<Option<(ScheduledJob, Option<T>)>> = (0..total).map(|_| None).collect();
        let mut in_flight: HashMap<task::Id, (usize, ScheduledJob)> = HashMap::new();
        let mut running = JoinSet::new();

        while !pending.is_empty() || !running.is_empty() {
            let mut blocked = VecDeque::new();
            while let Some((position, job)) = pending.pop_front() {
                if !self.try_reserve_slot(job.provider) {
                    blocked.push_back((position, job));
                    continue;
                }
                tracing::debug!(project = %job.name, provider = job.provider.as_str(), "starting scheduled job");
                let guard = SlotGuard {
                    scheduler: self.clone(),
                    provider: job.provider,
                };
                let future = work(job.clone());
                let handle = running.spawn(async move {
                    let _guard = guard;
                    future.await
                });
                in_flight.insert(handle.id(), (position, job));
            }
            pending = blocked;

            let (id, output) = match running.join_next_with_id().await {
                Some(Ok((id, output))) => (id, Some(output)),
                Some(Err(error)) => {
                    tracing::error!(error = %error, "scheduled job panicked");
                    (error.id(), None)
                }
                None => break,
            };
            if let Some((position, job)) = in_flight.remove(&id) {
                finished[position] = Some((job, output));
            }
        }

        finished.into_iter().flatten().collect()
    }
}

pub type ProviderFactory = Arc<dyn Fn(ProviderKind) -> Arc<dyn Provider> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MultiRunOptions {
    pub target: EnvTarget,
    pub concurrency: usize,
    pub sync_env: bool,
    pub env_only: bool,
    pub dry_run: bool,
    pub optimize_writes: bool,
    pub policy: EnvPolicy,
    pub login_on_auth_failure: bool,
}

impl Default for MultiRunOptions {
    fn default() -> Self {
        Self {
            target: EnvTarget::Preview,
            concurrency: crate::config::DEFAULT_CONCURRENCY,
            sync_env: false,
            env_only: false,
            dry_run: false,
            optimize_writes: false,
            policy: EnvPolicy::default(),
            login_on_auth_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOutcome {
    pub name: String,
    pub provider: ProviderKind,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProjectOutcome {
    fn new(name: &str, provider: ProviderKind) -> Self {
        Self {
            name: name.to_string(),
            provider,
            ok: false,
            env: None,
            pipeline: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiRunReport {
    pub ok: bool,
    pub layers: Vec<Vec<String>>,
    pub projects: Vec<ProjectOutcome>,
}

struct ProjectJob {
    project: ProjectConfig,
    dir: PathBuf,
    env_source: Option<EnvSource>,
    fail_on_add: bool,
    fail_on_remove: bool,
}

/// Runs the selected projects layer by layer under the pool limits.
///
/// The dependency graph is checked before anything runs. A project whose
/// dependency failed in an earlier layer is reported as failed without running.
pub async fn run_projects(
    config: &ProjectsConfig,
    selected: Vec<ProjectConfig>,
    options: &MultiRunOptions,
    factory: ProviderFactory,
    ctx: Arc<RuntimeContext>,
) -> AppResult<MultiRunReport> {
    let known: HashSet<&str> = config.projects.iter().map(|project| project.name.as_str()).collect();
    let layers = graph::layers(&selected, &known)?;
    let layer_names: Vec<Vec<String>> = layers
        .iter()
        .map(|layer| layer.iter().map(|project| project.name.clone()).collect())
        .collect();
    info!(projects = selected.len(), layers = layers.len(), "starting multi-project run");

    let scheduler = Scheduler::new(options.concurrency, options.concurrency);
    let mut failed: HashSet<String> = HashSet::new();
    let mut outcomes = Vec::new();

    for layer in layers {
        let mut runnable = Vec::new();
        let mut jobs = HashMap::new();
        for project in layer {
            let provider = project.provider_kind()?;
            if let Some(upstream) = project.depends_on.iter().find(|name| failed.contains(name.as_str())) {
                warn!(project = %project.name, dependency = %upstream, "skipping project after dependency failure");
                let mut outcome = ProjectOutcome::new(&project.name, provider);
                outcome.error = Some(format!("dependency '{}' failed", upstream));
                failed.insert(project.name.clone());
                outcomes.push(outcome);
                continue;
            }
            let policy = config.resolve_policy(&project, &options.policy);
            let dir = config.project_dir(&project);
            let env_source = project.env_file(options.target).map(|file| EnvSource {
                file: dir.join(file),
                mapping: None,
                only: policy.only.clone(),
                ignore: policy.ignore.clone(),
            });
            runnable.push(ScheduledJob {
                name: project.name.clone(),
                provider,
            });
            jobs.insert(
                project.name.clone(),
                Arc::new(ProjectJob {
                    project,
                    dir,
                    env_source,
                    fail_on_add: policy.fail_on_add,
                    fail_on_remove: policy.fail_on_remove,
                }),
            );
        }

        let results = scheduler
            .run_layer(runnable, |scheduled| {
                let job = jobs.get(&scheduled.name).cloned();
                let provider = factory(scheduled.provider);
                let ctx = ctx.clone();
                let options = options.clone();
                async move {
                    match job {
                        Some(job) => run_project(&job, scheduled.provider, provider, ctx, &options).await,
                        None => ProjectOutcome::new(&scheduled.name, scheduled.provider),
                    }
                }
            })
            .await;

        for (scheduled, outcome) in results {
            let outcome = outcome.unwrap_or_else(|| {
                let mut outcome = ProjectOutcome::new(&scheduled.name, scheduled.provider);
                outcome.error = Some("project task aborted".to_string());
                outcome
            });
            if !outcome.ok {
                failed.insert(outcome.name.clone());
            }
            outcomes.push(outcome);
        }
    }

    Ok(MultiRunReport {
        ok: failed.is_empty(),
        layers: layer_names,
        projects: outcomes,
    })
}

async fn run_project(
    job: &ProjectJob,
    kind: ProviderKind,
    provider: Arc<dyn Provider>,
    ctx: Arc<RuntimeContext>,
    options: &MultiRunOptions,
) -> ProjectOutcome {
    let mut outcome = ProjectOutcome::new(&job.project.name, kind);
    let project_ref = ProjectRef {
        slug: Some(job.project.name.clone()),
        ..ProjectRef::default()
    };

    match env_step(job, &project_ref, provider.clone(), ctx.clone(), options).await {
        Ok(Some(report)) => {
            let gated = !report.ok();
            if gated {
                outcome.error = Some(report.violations.join("; "));
            }
            outcome.env = Some(report);
            if gated {
                return outcome;
            }
        }
        Ok(None) => {}
        Err(error) => {
            outcome.error = Some(error.to_string());
            return outcome;
        }
    }

    if options.env_only {
        outcome.ok = true;
        return outcome;
    }

    let mut request = PipelineRequest::new(kind, job.dir.clone(), options.target);
    request.project = project_ref;
    request.build_command = job.project.build_command.clone();
    request.dry_run = options.dry_run;
    request.login_on_auth_failure = options.login_on_auth_failure;
    let summary = Orchestrator::new(provider, ctx).run(&request).await;
    outcome.ok = summary.ok;
    outcome.error = summary.error.as_ref().map(|error| error.message.clone());
    outcome.pipeline = Some(summary);
    outcome
}

async fn env_step(
    job: &ProjectJob,
    project: &ProjectRef,
    provider: Arc<dyn Provider>,
    ctx: Arc<RuntimeContext>,
    options: &MultiRunOptions,
) -> AppResult<Option<EnvReport>> {
    let Some(source) = &job.env_source else {
        return Ok(None);
    };
    if !provider.capabilities().env_contexts.contains(&options.target) {
        info!(project = %job.project.name, "provider has no env store for this target; skipping env step");
        return Ok(None);
    }
    let sync = SyncOptions {
        dry_run: options.dry_run,
        optimize_writes: options.optimize_writes,
        fail_on_add: job.fail_on_add,
        fail_on_remove: job.fail_on_remove,
    };
    let reconciler = EnvReconciler::new(provider, ctx);
    let local = reconciler.load_local(source)?;
    let targets = [options.target];
    let report = if options.sync_env {
        reconciler.sync(&job.dir, project, &targets, &local, &sync).await?
    } else {
        reconciler.check(&job.dir, project, &targets, &local, &sync).await?
    };
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::{run_projects, MultiRunOptions, ProviderFactory, ScheduledJob, Scheduler};
    use crate::config::ProjectsConfig;
    use crate::context::RuntimeContext;
    use crate::errors::AppResult;
    use crate::models::{
        BuildInputs, BuildResult, CapabilitySet, ConfigInputs, DeployInputs, DeployResult, DetectionHint, ProjectRef,
        ProviderKind,
    };
    use crate::providers::noop::NoopProvider;
    use crate::providers::Provider;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn counting_factory(calls: Arc<AtomicUsize>) -> ProviderFactory {
        Arc::new(move |_: ProviderKind| {
            calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(NoopProvider::default()) as Arc<dyn Provider>
        })
    }

    struct PanickingProvider;

    #[async_trait]
    impl Provider for PanickingProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Vercel
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::default()
        }

        async fn detect(&self, _dir: &Path) -> AppResult<DetectionHint> {
            panic!("detector crashed")
        }

        async fn validate_auth(&self, _dir: &Path) -> AppResult<()> {
            panic!("auth check crashed")
        }

        async fn link(&self, _dir: &Path, project: &ProjectRef) -> AppResult<ProjectRef> {
            Ok(project.clone())
        }

        async fn build(&self, _inputs: &BuildInputs) -> AppResult<BuildResult> {
            panic!("build crashed")
        }

        async fn deploy(&self, _inputs: &DeployInputs) -> AppResult<DeployResult> {
            panic!("deploy crashed")
        }

        async fn generate_config(&self, _inputs: &ConfigInputs) -> AppResult<PathBuf> {
            panic!("generate crashed")
        }
    }

    fn job(name: &str, provider: ProviderKind) -> ScheduledJob {
        ScheduledJob {
            name: name.to_string(),
            provider,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_limits() {
        let scheduler = Scheduler::new(2, 1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = vec![
            job("a", ProviderKind::Vercel),
            job("b", ProviderKind::Vercel),
            job("c", ProviderKind::Noop),
            job("d", ProviderKind::Cloudflare),
        ];

        let results = scheduler
            .run_layer(jobs, |job| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    job.name.to_uppercase()
                }
            })
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let names: Vec<Option<String>> = results.into_iter().map(|(_, output)| output).collect();
        assert_eq!(
            names,
            vec![Some("A".to_string()), Some("B".to_string()), Some("C".to_string()), Some("D".to_string())]
        );
    }

    #[tokio::test]
    async fn per_provider_limit_serialises_same_provider_jobs() {
        let scheduler = Scheduler::new(4, 1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = vec![job("a", ProviderKind::Noop), job("b", ProviderKind::Noop)];
        scheduler
            .run_layer(jobs, |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicked_job_keeps_its_slot_in_the_results() {
        let scheduler = Scheduler::new(2, 2);
        let jobs = vec![job("ok", ProviderKind::Noop), job("boom", ProviderKind::Noop)];
        let results = scheduler
            .run_layer(jobs, |job| async move {
                if job.name == "boom" {
                    panic!("job crashed");
                }
                job.name.len()
            })
            .await;

        let shape: Vec<(String, Option<usize>)> = results.into_iter().map(|(job, output)| (job.name, output)).collect();
        assert_eq!(shape, vec![("ok".to_string(), Some(2)), ("boom".to_string(), None)]);

        let after = scheduler.run_layer(vec![job("next", ProviderKind::Noop)], |_| async { 1 }).await;
        assert_eq!(after[0].1, Some(1));
    }

    #[tokio::test]
    async fn panicked_project_fails_the_run_and_skips_dependents() {
        let root = tempfile::tempdir().expect("tempdir");
        for name in ["api", "web"] {
            std::fs::create_dir_all(root.path().join(name)).expect("project dir");
        }
        let raw = r#"{ "projects": [
            { "name": "api", "path": "api", "provider": "vercel" },
            { "name": "web", "path": "web", "provider": "noop", "dependsOn": ["api"] }
        ] }"#;
        let config = ProjectsConfig::parse(raw, root.path().to_path_buf()).expect("config");
        let factory: ProviderFactory = Arc::new(|kind: ProviderKind| match kind {
            ProviderKind::Vercel => Arc::new(PanickingProvider) as Arc<dyn Provider>,
            _ => Arc::new(NoopProvider::default()) as Arc<dyn Provider>,
        });

        let report = run_projects(
            &config,
            config.select(&[], &[]).expect("all"),
            &MultiRunOptions::default(),
            factory,
            Arc::new(RuntimeContext::default()),
        )
        .await
        .expect("report");

        assert!(!report.ok);
        assert_eq!(report.projects.len(), 2);
        assert_eq!(report.projects[0].name, "api");
        assert!(!report.projects[0].ok);
        assert_eq!(report.projects[0].error.as_deref(), Some("project task aborted"));
        assert_eq!(report.projects[1].error.as_deref(), Some("dependency 'api' failed"));
        assert!(report.projects[1].pipeline.is_none());
    }

    #[tokio::test]
    async fn cycle_fails_before_any_project_runs() {
        let raw = r#"{ "projects": [
            { "name": "a", "path": "a", "provider": "noop", "dependsOn": ["b"] },
            { "name": "b", "path": "b", "provider": "noop", "dependsOn": ["a"] }
        ] }"#;
        let config = ProjectsConfig::parse(raw, std::path::PathBuf::from(".")).expect("config");
        let calls = Arc::new(AtomicUsize::new(0));
        let selected = config.select(&[], &[]).expect("all");
        let err = run_projects(
            &config,
            selected,
            &MultiRunOptions::default(),
            counting_factory(calls.clone()),
            Arc::new(RuntimeContext::default()),
        )
        .await
        .expect_err("cycle");
        assert!(err.to_string().contains("dependency cycle"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gated_env_failure_skips_dependents() {
        let root = tempfile::tempdir().expect("tempdir");
        for name in ["api", "web", "docs"] {
            std::fs::create_dir_all(root.path().join(name)).expect("project dir");
        }
        std::fs::write(root.path().join("api/.env.preview"), "API_TOKEN=abcdef\n").expect("env file");
        let raw = r#"{
          "policy": { "failOnAdd": true },
          "projects": [
            { "name": "api", "path": "api", "provider": "noop", "envFilePreview": ".env.preview" },
            { "name": "web", "path": "web", "provider": "noop", "dependsOn": ["api"] },
            { "name": "docs", "path": "docs", "provider": "noop" }
          ]
        }"#;
        let config = ProjectsConfig::parse(raw, root.path().to_path_buf()).expect("config");
        let selected = config.select(&[], &[]).expect("all");
        let report = run_projects(
            &config,
            selected,
            &MultiRunOptions::default(),
            counting_factory(Arc::new(AtomicUsize::new(0))),
            Arc::new(RuntimeContext::default()),
        )
        .await
        .expect("report");

        assert!(!report.ok);
        assert_eq!(report.layers, vec![vec!["api".to_string(), "docs".to_string()], vec!["web".to_string()]]);
        let by_name = |name: &str| report.projects.iter().find(|p| p.name == name).expect("outcome");
        let api = by_name("api");
        assert!(!api.ok);
        assert!(api.error.as_deref().unwrap_or_default().contains("API_TOKEN"));
        assert!(api.pipeline.is_none());
        assert!(by_name("docs").ok);
        assert_eq!(by_name("web").error.as_deref(), Some("dependency 'api' failed"));
    }

    #[tokio::test]
    async fn env_only_skips_the_pipeline() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("site")).expect("project dir");
        std::fs::write(root.path().join("site/.env"), "PUBLIC_NAME=shop\n").expect("env file");
        let raw = r#"{ "projects": [
            { "name": "site", "path": "site", "provider": "noop", "envFilePreview": ".env" }
        ] }"#;
        let config = ProjectsConfig::parse(raw, root.path().to_path_buf()).expect("config");
        let options = MultiRunOptions {
            env_only: true,
            sync_env: true,
            ..MultiRunOptions::default()
        };
        let report = run_projects(
            &config,
            config.select(&[], &[]).expect("all"),
            &options,
            counting_factory(Arc::new(AtomicUsize::new(0))),
            Arc::new(RuntimeContext::default()),
        )
        .await
        .expect("report");
        assert!(report.ok);
        let site = &report.projects[0];
        assert!(site.pipeline.is_none());
        let env = site.env.as_ref().expect("env report");
        assert_eq!(env.targets[0].written, vec!["PUBLIC_NAME".to_string()]);
    }
}
