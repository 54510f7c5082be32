use super::cache::cache_key;
use super::diff::{diff_env, DiffResult};
use super::dotenv::load_env_file;
use super::expand::expand_with;
use super::filter::KeyFilter;
use super::mapping::KeyMapping;
use crate::context::RuntimeContext;
use crate::errors::{AppError, AppResult};
use crate::models::{EnvTarget, ProjectRef};
use crate::providers::{EnvScope, Provider};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Where local values come from and which of them take part.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    pub file: PathBuf,
    pub mapping: Option<PathBuf>,
    pub only: Vec<String>,
    pub ignore: Vec<String>,
}

impl EnvSource {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    /// parse, expand, map, then filter.
    pub fn load_with<F>(&self, process_env: F) -> AppResult<BTreeMap<String, String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = load_env_file(&self.file)?;
        let expanded = expand_with(&raw, process_env);
        let mapped = match &self.mapping {
            Some(path) => KeyMapping::load(path)?.apply(&expanded),
            None => expanded,
        };
        Ok(KeyFilter::new(&self.only, &self.ignore)?.apply(&mapped))
    }

    pub fn load(&self) -> AppResult<BTreeMap<String, String>> {
        self.load_with(|name| std::env::var(name).ok())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub optimize_writes: bool,
    pub fail_on_add: bool,
    pub fail_on_remove: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    pub target: EnvTarget,
    #[serde(flatten)]
    pub diff: DiffResult,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub written: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<String>,
}

impl TargetReport {
    fn new(target: EnvTarget, diff: DiffResult) -> Self {
        Self {
            target,
            diff,
            written: Vec::new(),
            skipped: Vec::new(),
            planned: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvReport {
    pub provider: String,
    pub dry_run: bool,
    pub targets: Vec<TargetReport>,
    /// CI gate failures; any entry turns the exit code to 1.
    pub violations: Vec<String>,
}

impl EnvReport {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }
}

fn gate(report: &TargetReport, options: &SyncOptions) -> Vec<String> {
    let mut violations = Vec::new();
    if options.fail_on_add && !report.diff.added.is_empty() {
        violations.push(format!(
            "{}: keys missing remotely: {}",
            report.target.as_str(),
            report.diff.added.join(", ")
        ));
    }
    if options.fail_on_remove && !report.diff.removed.is_empty() {
        violations.push(format!(
            "{}: keys only present remotely: {}",
            report.target.as_str(),
            report.diff.removed.join(", ")
        ));
    }
    violations
}

/// Diffs and writes env values between a local file and a provider's remote store.
pub struct EnvReconciler {
    provider: Arc<dyn Provider>,
    ctx: Arc<RuntimeContext>,
}

impl EnvReconciler {
    pub fn new(provider: Arc<dyn Provider>, ctx: Arc<RuntimeContext>) -> Self {
        Self { provider, ctx }
    }

    /// Loads local values and teaches the redactor their secrets.
    pub fn load_local(&self, source: &EnvSource) -> AppResult<BTreeMap<String, String>> {
        let entries = source.load()?;
        self.ctx.absorb_secrets(&entries);
        info!(file = %source.file.display(), keys = entries.len(), "loaded local env");
        Ok(entries)
    }

    fn ensure_target(&self, target: EnvTarget) -> AppResult<()> {
        if self.provider.capabilities().env_contexts.contains(&target) {
            return Ok(());
        }
        Err(AppError::Cli(format!(
            "{} has no {} environment store",
            self.provider.kind().as_str(),
            target.as_str()
        )))
    }

    fn key_for(&self, project: &ProjectRef, target: EnvTarget) -> String {
        cache_key(self.provider.kind(), target, project.display_name())
    }

    async fn fetch_remote(
        &self,
        scope: EnvScope<'_>,
        use_cache: bool,
    ) -> AppResult<BTreeMap<String, String>> {
        let key = self.key_for(scope.project, scope.target);
        if use_cache {
            if let Some(cached) = self.ctx.env_cache().get(&key) {
                tracing::debug!(key = %key, "using cached remote env snapshot");
                return Ok(cached);
            }
        }
        let remote = self.provider.list_env(scope).await?;
        self.ctx.env_cache().put(&key, remote.clone());
        Ok(remote)
    }

    pub async fn diff(
        &self,
        dir: &Path,
        project: &ProjectRef,
        target: EnvTarget,
        local: &BTreeMap<String, String>,
    ) -> AppResult<DiffResult> {
        self.ensure_target(target)?;
        let scope = EnvScope { dir, project, target };
        let remote = self.fetch_remote(scope, false).await?;
        Ok(diff_env(local, &remote))
    }

    /// Diff every target and apply the CI gates without writing anything.
    pub async fn check(
        &self,
        dir: &Path,
        project: &ProjectRef,
        targets: &[EnvTarget],
        local: &BTreeMap<String, String>,
        options: &SyncOptions,
    ) -> AppResult<EnvReport> {
        let mut report = self.empty_report(true);
        for &target in targets {
            let diff = self.diff(dir, project, target, local).await?;
            let target_report = TargetReport::new(target, diff);
            report.violations.extend(gate(&target_report, options));
            report.targets.push(target_report);
        }
        Ok(report)
    }

    pub async fn sync(
        &self,
        dir: &Path,
        project: &ProjectRef,
        targets: &[EnvTarget],
        local: &BTreeMap<String, String>,
        options: &SyncOptions,
    ) -> AppResult<EnvReport> {
        let mut report = self.empty_report(options.dry_run);
        for &target in targets {
            self.ensure_target(target)?;
            let scope = EnvScope { dir, project, target };
            let remote = self.fetch_remote(scope, options.optimize_writes).await?;
            let mut target_report = TargetReport::new(target, diff_env(local, &remote));
            let key = self.key_for(project, target);

            for (name, value) in local {
                if options.dry_run {
                    info!(target = target.as_str(), key = %name, "would set env value");
                    target_report.planned.push(name.clone());
                    continue;
                }
                if options.optimize_writes && remote.get(name) == Some(value) {
                    target_report.skipped.push(name.clone());
                    continue;
                }
                if let Err(error) = self.provider.remove_env(scope, name).await {
                    warn!(target = target.as_str(), key = %name, "remove before set failed: {}", error);
                }
                self.provider.set_env(scope, name, value).await?;
                self.ctx.env_cache().record_write(&key, name, value);
                target_report.written.push(name.clone());
            }

            info!(
                provider = self.provider.kind().as_str(),
                target = target.as_str(),
                written = target_report.written.len(),
                skipped = target_report.skipped.len(),
                planned = target_report.planned.len(),
                "env sync finished"
            );
            report.violations.extend(gate(&target_report, options));
            report.targets.push(target_report);
        }
        Ok(report)
    }

    fn empty_report(&self, dry_run: bool) -> EnvReport {
        EnvReport {
            provider: self.provider.kind().as_str().to_string(),
            dry_run,
            targets: Vec::new(),
            violations: Vec::new(),
        }
    }
}
