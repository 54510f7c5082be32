use crate::diagnostics::hints::{Hint, HintEngine};
use crate::envsync::cache::RemoteEnvCache;
use crate::models::ProviderKind;
use crate::redaction::Redactor;
use crate::report::OutputMode;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every component for the lifetime of one invocation.
///
/// Created once in the CLI entry point and handed to the executor, providers and
/// reconciler as an `Arc`. Tests build their own instance or call [`reset`](Self::reset).
#[derive(Debug)]
pub struct RuntimeContext {
    hints: HintEngine,
    redactor: RwLock<Redactor>,
    env_cache: RemoteEnvCache,
    output: OutputMode,
    ci: bool,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(OutputMode::Human, false, DEFAULT_CACHE_TTL)
    }
}

impl RuntimeContext {
    pub fn new(output: OutputMode, ci: bool, cache_ttl: Duration) -> Self {
        Self {
            hints: HintEngine::new(),
            redactor: RwLock::new(Redactor::new()),
            env_cache: RemoteEnvCache::new(cache_ttl),
            output,
            ci,
        }
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output
    }

    pub fn is_ci(&self) -> bool {
        self.ci
    }

    pub fn hints(&self) -> &HintEngine {
        &self.hints
    }

    pub fn scan_output(&self, provider: Option<ProviderKind>, text: &str) -> Vec<Hint> {
        self.hints.scan(provider, text)
    }

    pub fn env_cache(&self) -> &RemoteEnvCache {
        &self.env_cache
    }

    pub fn redact(&self, text: &str) -> String {
        match self.redactor.read() {
            Ok(redactor) => redactor.redact_str(text),
            Err(poisoned) => poisoned.into_inner().redact_str(text),
        }
    }

    pub fn absorb_secrets(&self, entries: &BTreeMap<String, String>) {
        let mut redactor = self.redactor.write().unwrap_or_else(PoisonError::into_inner);
        redactor.absorb_env(entries);
    }

    pub fn reset(&self) {
        self.hints.reset();
        self.env_cache.clear();
        let mut redactor = self.redactor.write().unwrap_or_else(PoisonError::into_inner);
        *redactor = Redactor::new();
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeContext;
    use std::collections::BTreeMap;

    #[test]
    fn reset_clears_hints_and_secrets() {
        let ctx = RuntimeContext::default();
        let mut env = BTreeMap::new();
        env.insert("TOKEN_VALUE".to_string(), "s3cr3t-value".to_string());
        ctx.absorb_secrets(&env);
        assert_eq!(ctx.redact("x s3cr3t-value y"), "x [REDACTED] y");
        assert_eq!(ctx.scan_output(None, "Ignored build scripts: esbuild").len(), 1);

        ctx.reset();
        assert_eq!(ctx.redact("x s3cr3t-value y"), "x s3cr3t-value y");
        assert!(ctx.hints().emitted().is_empty());
    }
}
