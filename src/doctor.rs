use crate::executor::{CommandSpec, Executor};
use crate::models::ProviderKind;
use crate::providers::cloudflare::WRANGLER_CANDIDATES;
use crate::providers::github_pages::GH_PAGES_CANDIDATES;
use crate::providers::toolcheck::{extract_semver, inspect_tool, version_at_least, ToolProfile};
use crate::scheduler::ProviderFactory;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const MIN_NODE_VERSION: &str = "18.17.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub message: String,
    /// Optional checks are reported but only fail the run under `--strict`.
    pub required: bool,
}

impl DoctorCheck {
    fn new(name: impl Into<String>, ok: bool, message: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            ok,
            message: message.into(),
            required,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Default)]
pub struct DoctorOptions {
    pub dir: PathBuf,
    /// Providers the user asked about; their checks become required.
    pub providers: Vec<ProviderKind>,
    pub strict: bool,
    pub binaries: BTreeMap<ProviderKind, String>,
}

fn candidates(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::Vercel => &["vercel"],
        ProviderKind::Cloudflare => &WRANGLER_CANDIDATES,
        ProviderKind::GithubPages => &GH_PAGES_CANDIDATES,
        ProviderKind::Noop => &[],
    }
}

/// Checks the toolchain, each provider CLI and its login state.
pub async fn run_doctor(executor: &Executor, factory: &ProviderFactory, options: &DoctorOptions) -> DoctorReport {
    let dir = options.dir.as_path();
    let mut checks = Vec::new();

    let node = executor.version_of("node", dir).await;
    checks.push(match node.as_deref().and_then(extract_semver) {
        Some(version) if version_at_least(&version, MIN_NODE_VERSION) => {
            DoctorCheck::new(format!("node >= {}", MIN_NODE_VERSION), true, version, true)
        }
        Some(version) => DoctorCheck::new(
            format!("node >= {}", MIN_NODE_VERSION),
            false,
            format!("found {}; upgrade Node.js", version),
            true,
        ),
        None => DoctorCheck::new(format!("node >= {}", MIN_NODE_VERSION), false, "not installed or not on PATH", true),
    });

    checks.push(match executor.version_of("git", dir).await {
        Some(version) => DoctorCheck::new("git", true, version, true),
        None => DoctorCheck::new("git", false, "not installed or not on PATH", true),
    });

    let selected: Vec<ProviderKind> = if options.providers.is_empty() {
        ProviderKind::ALL.iter().copied().filter(|kind| *kind != ProviderKind::Noop).collect()
    } else {
        options.providers.clone()
    };
    for kind in selected {
        let required = options.providers.contains(&kind);
        checks.extend(provider_checks(executor, factory, options, kind, required).await);
    }

    let ok = checks.iter().all(|check| check.ok || !(check.required || options.strict));
    tracing::info!(ok, checks = checks.len(), "doctor finished");
    DoctorReport { ok, checks }
}

async fn first_installed(executor: &Executor, options: &DoctorOptions, kind: ProviderKind) -> Option<ToolProfile> {
    let dir = options.dir.as_path();
    if let Some(binary) = options.binaries.get(&kind) {
        return Some(inspect_tool(executor, kind, binary, dir).await);
    }
    let mut last = None;
    for candidate in candidates(kind) {
        let profile = inspect_tool(executor, kind, candidate, dir).await;
        if profile.installed {
            return Some(profile);
        }
        last = Some(profile);
    }
    last
}

async fn provider_checks(
    executor: &Executor,
    factory: &ProviderFactory,
    options: &DoctorOptions,
    kind: ProviderKind,
    required: bool,
) -> Vec<DoctorCheck> {
    let dir = options.dir.as_path();
    let mut checks = Vec::new();

    if let Some(profile) = first_installed(executor, options, kind).await {
        let name = format!("{} cli", kind.as_str());
        if !profile.installed {
            checks.push(DoctorCheck::new(name, false, "not installed or not on PATH", required));
            return checks;
        }
        let mut message = format!("{} {}", profile.binary, profile.version.as_deref().unwrap_or("(unknown version)"));
        for note in &profile.notes {
            message.push_str("; ");
            message.push_str(note);
        }
        checks.push(DoctorCheck::new(name, true, message, required));
    }

    if kind == ProviderKind::GithubPages {
        let result = executor
            .run_buffered(&CommandSpec::new("git remote get-url origin", dir))
            .await;
        let origin = result.stdout.trim();
        checks.push(if result.succeeded && !origin.is_empty() {
            DoctorCheck::new("git origin remote", true, origin, required)
        } else {
            DoctorCheck::new(
                "git origin remote",
                false,
                "missing (set with: git remote add origin <url>)",
                required,
            )
        });
        return checks;
    }

    let provider = factory(kind);
    checks.push(match provider.validate_auth(dir).await {
        Ok(()) => DoctorCheck::new(format!("{} auth", kind.as_str()), true, "logged in", required),
        Err(error) => {
            let message = match error.provider_error() {
                Some(inner) => match &inner.remedy {
                    Some(remedy) => format!("{} ({})", inner.message, remedy),
                    None => inner.message.clone(),
                },
                None => error.to_string(),
            };
            DoctorCheck::new(format!("{} auth", kind.as_str()), false, message, required)
        }
    });

    if kind == ProviderKind::Vercel {
        let linked = dir.join(".vercel").join("project.json").is_file();
        checks.push(DoctorCheck::new(
            "vercel link",
            linked,
            if linked { "linked" } else { "not linked (run: vercel link)" },
            false,
        ));
    }
    checks
}
