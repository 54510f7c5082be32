use crate::context::lock_unpoisoned;
use crate::models::ProviderKind;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    Config,
    Env,
    Dependency,
    Platform,
    Build,
    Runtime,
}

pub struct HintRule {
    pub id: &'static str,
    pub scope: Option<ProviderKind>,
    pub pattern: Regex,
    pub kind: HintKind,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub id: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    pub kind: HintKind,
    pub message: &'static str,
}

fn rule(
    id: &'static str,
    scope: Option<ProviderKind>,
    pattern: &str,
    kind: HintKind,
    message: &'static str,
) -> HintRule {
    HintRule {
        id,
        scope,
        pattern: Regex::new(&format!("(?i){}", pattern)).expect("valid hint regex"),
        kind,
        message,
    }
}

static RULES: Lazy<Vec<HintRule>> = Lazy::new(|| {
    vec![
        rule(
            "pnpm-approve-builds",
            None,
            r"Ignored build scripts:",
            HintKind::Dependency,
            "pnpm blocked postinstall scripts. Run `pnpm approve-builds` or list the packages under pnpm.trustedDependencies in package.json.",
        ),
        rule(
            "env-missing",
            None,
            r"(Missing required (environment )?variables?|not found in process\.env|Environment variable .+ is required|ReferenceError: process is not defined)",
            HintKind::Env,
            "Missing environment variables. Compare with `launchpad env diff <provider>` and apply with `launchpad env sync <provider> --file .env`.",
        ),
        rule(
            "fs-watch-limit",
            None,
            r"ENOSPC: System limit for number of file watchers reached|inotify watch limits reached",
            HintKind::Platform,
            "File watcher limit reached. Raise the inotify watch limit (fs.inotify.max_user_watches) or build in CI.",
        ),
        rule(
            "cf-wrangler-output-dir",
            Some(ProviderKind::Cloudflare),
            r"pages_build_output_dir\s+.*not found|Cannot find output directory",
            HintKind::Config,
            "wrangler.toml: set pages_build_output_dir to the directory your build writes (for Next on Pages: .vercel/output/static).",
        ),
        rule(
            "cf-nodejs-compat",
            Some(ProviderKind::Cloudflare),
            r"ReferenceError:\s*require\s+is\s+not\s+defined|node:.* module not found",
            HintKind::Runtime,
            "wrangler.toml: add compatibility_flags = [\"nodejs_compat\"].",
        ),
        rule(
            "gh-next-export-missing",
            Some(ProviderKind::GithubPages),
            r"No static files found in 'out'|ENOENT.*out/_next/static",
            HintKind::Build,
            "Next.js on GitHub Pages needs a static export: set output: \"export\" in next.config and build to out/.",
        ),
    ]
});

pub fn rules() -> &'static [HintRule] {
    RULES.as_slice()
}

/// Scans output for known advisory patterns, emitting each rule at most once per process.
#[derive(Debug, Default)]
pub struct HintEngine {
    emitted: Mutex<HashSet<&'static str>>,
    collected: Mutex<Vec<Hint>>,
}

impl HintEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&self, provider: Option<ProviderKind>, text: &str) -> Vec<Hint> {
        let mut fresh = Vec::new();
        for candidate in rules() {
            if let (Some(scope), Some(current)) = (candidate.scope, provider) {
                if scope != current {
                    continue;
                }
            }
            if !candidate.pattern.is_match(text) {
                continue;
            }
            if !lock_unpoisoned(&self.emitted).insert(candidate.id) {
                continue;
            }
            let hint = Hint {
                id: candidate.id,
                provider,
                kind: candidate.kind,
                message: candidate.message,
            };
            tracing::info!(hint = hint.id, kind = ?hint.kind, "hint: {}", hint.message);
            lock_unpoisoned(&self.collected).push(hint.clone());
            fresh.push(hint);
        }
        fresh
    }

    pub fn emitted(&self) -> Vec<Hint> {
        lock_unpoisoned(&self.collected).clone()
    }

    pub fn reset(&self) {
        lock_unpoisoned(&self.emitted).clear();
        lock_unpoisoned(&self.collected).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::HintEngine;
    use crate::models::ProviderKind;

    #[test]
    fn emits_each_rule_once() {
        let engine = HintEngine::new();
        let first = engine.scan(None, "WARN  Ignored build scripts: esbuild");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "pnpm-approve-builds");

        let second = engine.scan(Some(ProviderKind::Vercel), "Ignored build scripts: sharp");
        assert!(second.is_empty());
        assert_eq!(engine.emitted().len(), 1);
    }

    #[test]
    fn scoped_rules_only_fire_for_their_provider() {
        let engine = HintEngine::new();
        let line = "Error: Cannot find output directory";
        assert!(engine.scan(Some(ProviderKind::Vercel), line).is_empty());
        let hits = engine.scan(Some(ProviderKind::Cloudflare), line);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "cf-wrangler-output-dir");
    }

    #[test]
    fn unscoped_scan_considers_every_rule() {
        let engine = HintEngine::new();
        let hits = engine.scan(None, "No static files found in 'out'");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn reset_allows_reemission() {
        let engine = HintEngine::new();
        assert_eq!(engine.scan(None, "Missing required environment variables: DB_URL").len(), 1);
        engine.reset();
        assert!(engine.emitted().is_empty());
        assert_eq!(engine.scan(None, "missing required variable X").len(), 1);
    }
}
