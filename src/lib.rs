pub mod config;
pub mod context;
pub mod diagnostics;
pub mod doctor;
pub mod envsync;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod redaction;
pub mod release;
pub mod report;
pub mod scheduler;

use crate::config::{EnvPolicy, ProjectsConfig, Settings, SettingsOverrides, DEFAULT_CONFIG_FILE};
use crate::context::RuntimeContext;
use crate::doctor::{run_doctor, DoctorOptions};
use crate::envsync::{validate_env, EnvReconciler, EnvRules, EnvSource, SyncOptions};
use crate::errors::{AppError, AppResult};
use crate::executor::stream::StreamKind;
use crate::executor::Executor;
use crate::models::{CapabilitySet, ConfigInputs, EnvTarget, ProjectRef, ProviderKind};
use crate::pipeline::{EnvSyncRequest, Orchestrator, PipelineRequest, StageEvent};
use crate::providers::detect::detect_project;
use crate::providers::Provider;
use crate::release::{ReleaseAction, ReleaseManager, ReleaseRequest};
use crate::report::OutputMode;
use crate::scheduler::{MultiRunOptions, ProviderFactory};
use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Debug, Parser)]
#[command(name = "launchpad", version, about = "Deploy web projects through their hosting provider CLIs")]
pub struct Cli {
    /// Print one JSON result object on stdout
    #[arg(long, global = true)]
    pub json: bool,
    /// Print stage events as JSON lines, then the result object
    #[arg(long, global = true, conflicts_with = "json")]
    pub ndjson: bool,
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Non-interactive mode: no login prompts
    #[arg(long, global = true, env = "LAUNCHPAD_FORCE_CI", value_parser = FalseyValueParser::new())]
    pub ci: bool,
    #[arg(long = "ci-env", hide = true, global = true, env = "CI", value_parser = FalseyValueParser::new())]
    pub ci_env: bool,
    #[arg(long, hide = true, global = true, env = "GITHUB_ACTIONS", value_parser = FalseyValueParser::new())]
    pub github_actions: bool,
    /// Directory for a daily-rolling JSON log
    #[arg(long, global = true, value_name = "DIR")]
    pub log_file: Option<PathBuf>,
    #[command(flatten)]
    pub tuning: TuningArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum ProviderMode {
    Live,
    Virtual,
}

#[derive(Debug, Clone, Args)]
pub struct TuningArgs {
    #[arg(long, global = true, env = "LAUNCHPAD_RETRIES")]
    pub retries: Option<u32>,
    #[arg(long, global = true, env = "LAUNCHPAD_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,
    #[arg(long, global = true, env = "LAUNCHPAD_BASE_DELAY_MS")]
    pub base_delay_ms: Option<u64>,
    #[arg(long, global = true, env = "LAUNCHPAD_DEPLOY_TIMEOUT_MS")]
    pub deploy_timeout_ms: Option<u64>,
    /// 0 disables the idle watchdog
    #[arg(long, global = true, env = "LAUNCHPAD_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: Option<u64>,
    /// Append every provider command to an NDJSON fixture file
    #[arg(long, global = true, value_name = "FILE", env = "LAUNCHPAD_RECORD_FIXTURES")]
    pub record_fixtures: Option<PathBuf>,
    /// Answer provider commands from an NDJSON fixture file
    #[arg(long, global = true, value_name = "FILE", env = "LAUNCHPAD_REPLAY_FIXTURES")]
    pub replay_fixtures: Option<PathBuf>,
    #[arg(long, global = true, value_enum, ignore_case = true, env = "LAUNCHPAD_PROVIDER_MODE")]
    pub provider_mode: Option<ProviderMode>,
    #[arg(long, global = true, value_name = "CMD", env = "LAUNCHPAD_VERCEL_BIN")]
    pub vercel_bin: Option<String>,
    #[arg(long, global = true, value_name = "CMD", env = "LAUNCHPAD_WRANGLER_BIN")]
    pub wrangler_bin: Option<String>,
    #[arg(long, global = true, value_name = "CMD", env = "LAUNCHPAD_GH_PAGES_BIN")]
    pub gh_pages_bin: Option<String>,
}

impl TuningArgs {
    fn binaries(&self) -> BTreeMap<ProviderKind, String> {
        [
            (ProviderKind::Vercel, &self.vercel_bin),
            (ProviderKind::Cloudflare, &self.wrangler_bin),
            (ProviderKind::GithubPages, &self.gh_pages_bin),
        ]
        .into_iter()
        .filter_map(|(kind, bin)| bin.clone().map(|bin| (kind, bin)))
        .collect()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Detect, authenticate, build and deploy one project
    Up(UpArgs),
    /// Compare or push environment values
    #[command(subcommand)]
    Env(EnvCommand),
    /// Run every configured project in dependency order
    Run(RunArgs),
    /// List providers and their capabilities
    Providers,
    /// Write the provider's config file
    Generate(GenerateArgs),
    /// Stream runtime logs
    Logs(LogsArgs),
    /// Check Node.js, git and provider CLIs and logins
    Doctor(DoctorArgs),
    /// Point the production alias at a preview deployment
    Promote(PromoteArgs),
    /// Point the production alias back at an earlier deployment
    Rollback(RollbackArgs),
}

#[derive(Debug, Clone, Args)]
pub struct EnvFilterArgs {
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub ignore: Vec<String>,
    /// YAML or JSON key mapping (rename / transform)
    #[arg(long = "map")]
    pub mapping: Option<PathBuf>,
    #[arg(long)]
    pub optimize_writes: bool,
    #[arg(long)]
    pub fail_on_add: bool,
    #[arg(long)]
    pub fail_on_remove: bool,
}

#[derive(Debug, Clone, Args)]
pub struct UpArgs {
    pub provider: String,
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long, default_value = "preview")]
    pub env: EnvTarget,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub org: Option<String>,
    #[arg(long)]
    pub alias: Option<String>,
    #[arg(long)]
    pub sync_env: bool,
    /// Env file synced by --sync-env (default: .env.<target>, then .env)
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    #[arg(long)]
    pub no_build: bool,
    #[arg(long)]
    pub local_build: bool,
    #[arg(long)]
    pub build_command: Option<String>,
    #[arg(long)]
    pub dry_run: bool,
    #[command(flatten)]
    pub filter: EnvFilterArgs,
}

#[derive(Debug, Subcommand)]
pub enum EnvCommand {
    /// Show what differs between the env file and the provider
    Diff(EnvArgs),
    /// Write local values to the provider
    Sync(EnvArgs),
    /// Check an env file against builtin or file schemas
    Validate(ValidateArgs),
}

#[derive(Debug, Clone, Args)]
pub struct EnvArgs {
    pub provider: String,
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long)]
    pub file: Option<PathBuf>,
    #[arg(long, default_value = "preview")]
    pub env: EnvTarget,
    /// Overrides --env with several targets
    #[arg(long, value_delimiter = ',')]
    pub targets: Vec<EnvTarget>,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub dry_run: bool,
    #[command(flatten)]
    pub filter: EnvFilterArgs,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[arg(long, value_delimiter = ',', conflicts_with = "all")]
    pub projects: Vec<String>,
    #[arg(long, value_delimiter = ',', conflicts_with = "all")]
    pub tags: Vec<String>,
    #[arg(long)]
    pub all: bool,
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long)]
    pub sync_env: bool,
    /// Only run the env step
    #[arg(long)]
    pub env_only: bool,
    #[arg(long, default_value = "preview")]
    pub env: EnvTarget,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub ignore: Vec<String>,
    #[arg(long)]
    pub optimize_writes: bool,
    #[arg(long)]
    pub fail_on_add: bool,
    #[arg(long)]
    pub fail_on_remove: bool,
}

#[derive(Debug, Clone, Args)]
pub struct GenerateArgs {
    pub provider: String,
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Args)]
pub struct LogsArgs {
    pub provider: String,
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub follow: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ValidateArgs {
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long, default_value = ".env")]
    pub file: PathBuf,
    /// Comma-separated `builtin:<name>` entries and schema files
    #[arg(long)]
    pub schema: String,
}

#[derive(Debug, Clone, Args)]
pub struct DoctorArgs {
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    /// Providers whose checks must pass
    #[arg(long, value_delimiter = ',')]
    pub provider: Vec<String>,
    /// Optional checks fail the run too
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Clone, Args)]
pub struct PromoteArgs {
    pub provider: String,
    #[arg(long)]
    pub alias: String,
    /// Deployment URL or id (default: latest ready preview)
    #[arg(long)]
    pub from: Option<String>,
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub org: Option<String>,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct RollbackArgs {
    pub provider: String,
    #[arg(long, required_unless_present = "to")]
    pub alias: Option<String>,
    /// Deployment URL or id (default: previous production deployment)
    #[arg(long)]
    pub to: Option<String>,
    #[arg(long, default_value = ".")]
    pub path: PathBuf,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub org: Option<String>,
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        if self.ndjson {
            OutputMode::Ndjson
        } else if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            retries: self.tuning.retries,
            base_delay_ms: self.tuning.base_delay_ms,
            timeout_ms: self.tuning.timeout_ms,
            deploy_timeout_ms: self.tuning.deploy_timeout_ms,
            idle_timeout_ms: self.tuning.idle_timeout_ms,
            concurrency: match &self.command {
                Command::Run(args) => args.concurrency,
                _ => None,
            },
            record_fixtures: self.tuning.record_fixtures.clone(),
            replay_fixtures: self.tuning.replay_fixtures.clone(),
            virtual_mode: self.tuning.provider_mode == Some(ProviderMode::Virtual),
            ci: self.ci || self.ci_env || self.github_actions,
            binaries: self.tuning.binaries(),
        }
    }
}

/// stderr logging (JSON in structured modes) plus an optional rolling file.
pub fn init_tracing(mode: OutputMode, verbose: bool, log_dir: Option<&Path>) -> AppResult<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr = if mode.is_structured() {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    };

    let file = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "launchpad.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(fmt::layer().json().with_writer(non_blocking).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .with(filter)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

struct App {
    settings: Settings,
    ctx: Arc<RuntimeContext>,
    executor: Executor,
    mode: OutputMode,
}

impl App {
    fn new(cli: &Cli) -> AppResult<Self> {
        let settings = Settings::default().apply_overrides(&cli.overrides())?;
        let mode = cli.output_mode();
        let ctx = Arc::new(RuntimeContext::new(mode, settings.ci, settings.cache_ttl));
        let executor = match (&settings.replay_fixtures, &settings.record_fixtures) {
            (Some(path), _) => Executor::replaying(ctx.clone(), path)?,
            (None, Some(path)) => Executor::recording(ctx.clone(), path)?,
            (None, None) => Executor::live(ctx.clone()),
        };
        tracing::debug!(ci = settings.ci, virtual_mode = settings.virtual_mode, "settings resolved");
        Ok(Self {
            settings,
            ctx,
            executor,
            mode,
        })
    }

    fn factory(&self) -> ProviderFactory {
        let executor = self.executor.clone();
        let options = self.settings.provider_options();
        let virtual_mode = self.settings.virtual_mode;
        Arc::new(move |kind| providers::resolve(kind, executor.clone(), options.clone(), virtual_mode))
    }

    fn provider(&self, id: &str) -> AppResult<(ProviderKind, Arc<dyn Provider>)> {
        let kind: ProviderKind = id.parse()?;
        Ok((kind, (self.factory())(kind)))
    }
}

fn project_ref(project: Option<String>, org: Option<String>) -> ProjectRef {
    ProjectRef {
        project_id: None,
        org_id: org,
        slug: project,
    }
}

/// `.env.<target>` when present, otherwise `.env`.
fn default_env_file(dir: &Path, target: EnvTarget) -> PathBuf {
    let specific = dir.join(format!(".env.{}", target.as_str()));
    if specific.is_file() {
        specific
    } else {
        dir.join(".env")
    }
}

fn env_source(dir: &Path, file: Option<&Path>, target: EnvTarget, filter: &EnvFilterArgs) -> EnvSource {
    EnvSource {
        file: file.map(|file| dir.join(file)).unwrap_or_else(|| default_env_file(dir, target)),
        mapping: filter.mapping.clone(),
        only: filter.only.clone(),
        ignore: filter.ignore.clone(),
    }
}

async fn cmd_up(app: &App, args: &UpArgs) -> AppResult<bool> {
    let (kind, provider) = app.provider(&args.provider)?;
    let mut request = PipelineRequest::new(kind, &args.path, args.env);
    request.project = project_ref(args.project.clone(), args.org.clone());
    request.alias = args.alias.clone();
    request.no_build = args.no_build;
    request.local_build = args.local_build;
    request.build_command = args.build_command.clone();
    request.dry_run = args.dry_run;
    request.login_on_auth_failure = !app.ctx.is_ci();
    if args.sync_env {
        request.env_sync = Some(EnvSyncRequest {
            source: env_source(&args.path, args.env_file.as_deref(), args.env, &args.filter),
            options: SyncOptions {
                dry_run: args.dry_run,
                optimize_writes: args.filter.optimize_writes,
                fail_on_add: args.filter.fail_on_add,
                fail_on_remove: args.filter.fail_on_remove,
            },
        });
    }

    let mut orchestrator = Orchestrator::new(provider, app.ctx.clone());
    if app.mode == OutputMode::Ndjson {
        orchestrator = orchestrator.with_events(Arc::new(|event: &StageEvent| report::emit_event(event)));
    }
    let summary = orchestrator.run(&request).await;
    report::emit(app.mode, &summary, || report::render_pipeline(&summary))?;
    Ok(summary.ok)
}

async fn cmd_env(app: &App, command: &EnvCommand) -> AppResult<bool> {
    let (args, write) = match command {
        EnvCommand::Diff(args) => (args, false),
        EnvCommand::Sync(args) => (args, true),
        EnvCommand::Validate(args) => return cmd_env_validate(app, args),
    };
    let (_, provider) = app.provider(&args.provider)?;
    let targets = if args.targets.is_empty() {
        vec![args.env]
    } else {
        args.targets.clone()
    };
    let source = env_source(&args.path, args.file.as_deref(), targets[0], &args.filter);
    let options = SyncOptions {
        dry_run: args.dry_run,
        optimize_writes: args.filter.optimize_writes,
        fail_on_add: args.filter.fail_on_add,
        fail_on_remove: args.filter.fail_on_remove,
    };
    let project = project_ref(args.project.clone(), None);

    let reconciler = EnvReconciler::new(provider, app.ctx.clone());
    let local = reconciler.load_local(&source)?;
    let report = if write {
        reconciler.sync(&args.path, &project, &targets, &local, &options).await?
    } else {
        reconciler.check(&args.path, &project, &targets, &local, &options).await?
    };
    report::emit(app.mode, &report, || report::render_env(&report))?;
    Ok(report.ok())
}

async fn cmd_run(app: &App, args: &RunArgs) -> AppResult<bool> {
    let config = ProjectsConfig::load(&args.config)?;
    let selected = if args.all {
        config.select(&[], &[])?
    } else {
        config.select(&args.projects, &args.tags)?
    };
    let non_empty = |values: &Vec<String>| (!values.is_empty()).then(|| values.clone());
    let options = MultiRunOptions {
        target: args.env,
        concurrency: app.settings.concurrency,
        sync_env: args.sync_env,
        env_only: args.env_only,
        dry_run: args.dry_run,
        optimize_writes: args.optimize_writes,
        policy: EnvPolicy {
            env_only: non_empty(&args.only),
            env_ignore: non_empty(&args.ignore),
            fail_on_add: args.fail_on_add.then_some(true),
            fail_on_remove: args.fail_on_remove.then_some(true),
        },
        login_on_auth_failure: !app.ctx.is_ci(),
    };
    let report = scheduler::run_projects(&config, selected, &options, app.factory(), app.ctx.clone()).await?;
    report::emit(app.mode, &report, || report::render_multi(&report))?;
    Ok(report.ok)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderInfo {
    id: &'static str,
    capabilities: CapabilitySet,
}

fn cmd_providers(app: &App) -> AppResult<bool> {
    let factory = app.factory();
    let providers: Vec<ProviderInfo> = ProviderKind::ALL
        .iter()
        .map(|&kind| ProviderInfo {
            id: kind.as_str(),
            capabilities: factory(kind).capabilities(),
        })
        .collect();
    report::emit(app.mode, &providers, || {
        let rows: Vec<(String, CapabilitySet)> = providers
            .iter()
            .map(|info| (info.id.to_string(), info.capabilities.clone()))
            .collect();
        report::render_providers(&rows)
    })?;
    Ok(true)
}

async fn cmd_generate(app: &App, args: &GenerateArgs) -> AppResult<bool> {
    let (_, provider) = app.provider(&args.provider)?;
    let detection = match detect_project(&args.path) {
        Ok(hint) => hint,
        Err(_) => provider.detect(&args.path).await?,
    };
    let path = provider
        .generate_config(&ConfigInputs {
            dir: args.path.clone(),
            overwrite: args.overwrite,
            detection,
        })
        .await?;
    let result = serde_json::json!({ "ok": true, "path": path });
    report::emit(app.mode, &result, || format!("wrote {}", path.display()))?;
    Ok(true)
}

async fn cmd_logs(app: &App, args: &LogsArgs) -> AppResult<bool> {
    let (kind, provider) = app.provider(&args.provider)?;
    if args.follow && !provider.capabilities().logs_follow {
        return Err(AppError::Cli(format!("{} cannot follow logs", kind.as_str())));
    }
    let project = project_ref(args.project.clone(), None);
    let mut handle = provider.stream_logs(&args.path, &project, args.follow).await?;
    let canceller = handle.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    while let Some(chunk) = handle.next_chunk().await {
        if app.mode.is_structured() {
            report::emit_line(&serde_json::to_string(&chunk)?)?;
        } else if chunk.stream == StreamKind::Stderr {
            eprint!("{}", app.ctx.redact(&chunk.data));
        } else {
            let mut stdout = std::io::stdout().lock();
            write!(stdout, "{}", app.ctx.redact(&chunk.data))?;
            stdout.flush()?;
        }
    }
    let result = handle.wait().await;
    interrupt.abort();
    let summary = serde_json::json!({ "ok": result.succeeded, "exitCode": result.exit_code });
    report::emit(app.mode, &summary, || match result.reason {
        Some(reason) => format!("log stream ended: {:?}", reason),
        None => String::new(),
    })?;
    Ok(result.succeeded)
}

fn cmd_env_validate(app: &App, args: &ValidateArgs) -> AppResult<bool> {
    let (rules, schema_files) = EnvRules::compose(&args.schema, &args.path)?;
    let file = args.path.join(&args.file);
    let entries = EnvSource::new(file.clone()).load()?;
    let mut report = validate_env(&file, &entries, &rules)?;
    report.schema_files = schema_files;
    report::emit(app.mode, &report, || report::render_validation(&report))?;
    Ok(report.ok)
}

async fn cmd_doctor(app: &App, args: &DoctorArgs) -> AppResult<bool> {
    let providers = args
        .provider
        .iter()
        .map(|id| id.parse::<ProviderKind>())
        .collect::<AppResult<Vec<_>>>()?;
    let options = DoctorOptions {
        dir: args.path.clone(),
        providers,
        strict: args.strict,
        binaries: app.settings.binaries.clone(),
    };
    let report = run_doctor(&app.executor, &app.factory(), &options).await;
    report::emit(app.mode, &report, || report::render_doctor(&report))?;
    Ok(report.ok)
}

async fn cmd_release(app: &App, command: &Command) -> AppResult<bool> {
    let (provider_id, request, action) = match command {
        Command::Promote(args) => (
            &args.provider,
            ReleaseRequest {
                dir: args.path.clone(),
                project: project_ref(args.project.clone(), args.org.clone()),
                alias: Some(args.alias.clone()),
                reference: args.from.clone(),
                dry_run: args.dry_run,
            },
            ReleaseAction::Promote,
        ),
        Command::Rollback(args) => (
            &args.provider,
            ReleaseRequest {
                dir: args.path.clone(),
                project: project_ref(args.project.clone(), args.org.clone()),
                alias: args.alias.clone(),
                reference: args.to.clone(),
                dry_run: args.dry_run,
            },
            ReleaseAction::Rollback,
        ),
        _ => return Err(AppError::Internal("not a release command".to_string())),
    };
    let (_, provider) = app.provider(provider_id)?;
    if !request.dry_run {
        provider.validate_auth(&request.dir).await?;
    }
    let manager = ReleaseManager::new(provider)?;
    let summary = match action {
        ReleaseAction::Promote => manager.promote(&request).await?,
        ReleaseAction::Rollback => manager.rollback(&request).await?,
    };
    report::emit(app.mode, &summary, || report::render_release(&summary))?;
    Ok(summary.ok)
}

async fn dispatch(app: &App, command: &Command) -> AppResult<bool> {
    match command {
        Command::Up(args) => cmd_up(app, args).await,
        Command::Env(command) => cmd_env(app, command).await,
        Command::Run(args) => cmd_run(app, args).await,
        Command::Providers => cmd_providers(app),
        Command::Generate(args) => cmd_generate(app, args).await,
        Command::Logs(args) => cmd_logs(app, args).await,
        Command::Doctor(args) => cmd_doctor(app, args).await,
        Command::Promote(_) | Command::Rollback(_) => cmd_release(app, command).await,
    }
}

/// Runs one CLI invocation; exit code 1 on any failure or gated diff.
pub async fn run(cli: Cli) -> ExitCode {
    let mode = cli.output_mode();
    let outcome = match App::new(&cli) {
        Ok(app) => dispatch(&app, &cli.command).await,
        Err(error) => Err(error),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) => {
            tracing::error!(code = error.code(), "{}", error);
            if let Err(write_error) = report::emit_error(mode, &error) {
                tracing::warn!(error = %write_error, "failed to write error result");
            }
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{default_env_file, Cli, Command, EnvCommand};
    use crate::config::Settings;
    use crate::models::{EnvTarget, ProviderKind};
    use std::path::PathBuf;
    use std::time::Duration;
    use crate::report::OutputMode;
    use clap::Parser;

    #[test]
    fn parses_up_with_global_flags() {
        let cli = Cli::try_parse_from([
            "launchpad", "up", "vercel", "--env", "prod", "--alias", "shop.example.com", "--json", "--retries", "0",
        ])
        .expect("parse");
        assert_eq!(cli.output_mode(), OutputMode::Json);
        assert_eq!(cli.tuning.retries, Some(0));
        match cli.command {
            Command::Up(args) => {
                assert_eq!(args.env, EnvTarget::Production);
                assert_eq!(args.alias.as_deref(), Some("shop.example.com"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_env_targets_and_filters() {
        let cli = Cli::try_parse_from([
            "launchpad",
            "env",
            "diff",
            "noop",
            "--targets",
            "preview,production",
            "--only",
            "PUBLIC_*,API_*",
            "--fail-on-add",
        ])
        .expect("parse");
        match cli.command {
            Command::Env(EnvCommand::Diff(args)) => {
                assert_eq!(args.targets, vec![EnvTarget::Preview, EnvTarget::Production]);
                assert_eq!(args.filter.only, vec!["PUBLIC_*".to_string(), "API_*".to_string()]);
                assert!(args.filter.fail_on_add);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn json_and_ndjson_conflict() {
        assert!(Cli::try_parse_from(["launchpad", "providers", "--json", "--ndjson"]).is_err());
        assert!(Cli::try_parse_from(["launchpad", "run", "--all", "--projects", "web"]).is_err());
    }

    #[test]
    fn settings_come_from_launchpad_variables() {
        std::env::set_var("LAUNCHPAD_DEPLOY_TIMEOUT_MS", "45000");
        std::env::set_var("LAUNCHPAD_GH_PAGES_BIN", "/opt/gh-pages");
        let cli = Cli::try_parse_from(["launchpad", "doctor", "--provider", "github-pages"]);
        std::env::remove_var("LAUNCHPAD_DEPLOY_TIMEOUT_MS");
        std::env::remove_var("LAUNCHPAD_GH_PAGES_BIN");

        let cli = cli.expect("parse");
        let settings = Settings::default().apply_overrides(&cli.overrides()).expect("settings");
        assert_eq!(settings.deploy_timeout, Duration::from_secs(45));
        assert_eq!(
            settings.binaries.get(&ProviderKind::GithubPages).map(String::as_str),
            Some("/opt/gh-pages")
        );
    }

    #[test]
    fn tuning_flags_are_typed() {
        let cli = Cli::try_parse_from(["launchpad", "providers", "--provider-mode", "VIRTUAL", "--ci"]).expect("parse");
        let settings = Settings::default().apply_overrides(&cli.overrides()).expect("settings");
        assert!(settings.virtual_mode);
        assert!(settings.ci);

        assert!(Cli::try_parse_from(["launchpad", "providers", "--timeout-ms", "soon"]).is_err());
        assert!(Cli::try_parse_from(["launchpad", "providers", "--provider-mode", "staging"]).is_err());
    }

    #[test]
    fn parses_validate_doctor_and_release_commands() {
        let cli = Cli::try_parse_from([
            "launchpad", "env", "validate", "--file", ".env.local", "--schema", "builtin:stripe,env.schema.json",
        ])
        .expect("validate");
        match cli.command {
            Command::Env(EnvCommand::Validate(args)) => {
                assert_eq!(args.file, PathBuf::from(".env.local"));
                assert_eq!(args.schema, "builtin:stripe,env.schema.json");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["launchpad", "doctor", "--provider", "vercel,cloudflare", "--strict"]).expect("doctor");
        match cli.command {
            Command::Doctor(args) => {
                assert_eq!(args.provider, vec!["vercel".to_string(), "cloudflare".to_string()]);
                assert!(args.strict);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["launchpad", "promote", "vercel"]).is_err());
        assert!(Cli::try_parse_from(["launchpad", "rollback", "vercel"]).is_err());
        let cli = Cli::try_parse_from(["launchpad", "rollback", "vercel", "--to", "dpl_42"]).expect("rollback");
        match cli.command {
            Command::Rollback(args) => {
                assert_eq!(args.to.as_deref(), Some("dpl_42"));
                assert!(args.alias.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn env_file_prefers_target_specific() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(default_env_file(dir.path(), EnvTarget::Production), dir.path().join(".env"));
        std::fs::write(dir.path().join(".env.production"), "A=1\n").expect("write");
        assert_eq!(
            default_env_file(dir.path(), EnvTarget::Production),
            dir.path().join(".env.production")
        );
    }
}
