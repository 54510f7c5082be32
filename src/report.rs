use crate::doctor::DoctorReport;
use crate::envsync::{EnvReport, ValidationReport};
use crate::errors::{AppError, AppResult};
use crate::models::CapabilitySet;
use crate::pipeline::{PipelineSummary, StageEvent, StageStatus};
use crate::release::{ReleaseAction, ReleaseSummary};
use crate::scheduler::MultiRunReport;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::io::Write;

/// How results reach stdout. Logs always go to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Human,
    Json,
    Ndjson,
}

impl OutputMode {
    pub fn is_structured(self) -> bool {
        !matches!(self, Self::Human)
    }
}

/// Serialises `value` as the terminal object, tagged `"final": true`.
pub fn final_value<T: Serialize>(value: &T) -> AppResult<Value> {
    Ok(match serde_json::to_value(value)? {
        Value::Object(mut map) => {
            map.insert("final".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "result": other, "final": true }),
    })
}

pub fn error_value(error: &AppError) -> Value {
    let detail = match error.provider_error() {
        Some(inner) => serde_json::to_value(inner).unwrap_or_else(|_| json!({ "message": inner.message })),
        None => json!({ "code": error.code(), "message": error.to_string() }),
    };
    json!({ "ok": false, "error": detail, "final": true })
}

pub fn emit_line(line: &str) -> AppResult<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}

/// Writes the terminal result: one JSON line in structured modes, text otherwise.
pub fn emit<T: Serialize>(mode: OutputMode, value: &T, human: impl FnOnce() -> String) -> AppResult<()> {
    match mode {
        OutputMode::Human => emit_line(human().trim_end()),
        OutputMode::Json | OutputMode::Ndjson => emit_line(&serde_json::to_string(&final_value(value)?)?),
    }
}

pub fn emit_error(mode: OutputMode, error: &AppError) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            eprintln!("{}", render_error(error).trim_end());
            Ok(())
        }
        OutputMode::Json | OutputMode::Ndjson => emit_line(&error_value(error).to_string()),
    }
}

/// One stage transition as an ndjson line.
pub fn emit_event(event: &StageEvent) {
    match serde_json::to_string(event) {
        Ok(line) => {
            if let Err(error) = emit_line(&line) {
                tracing::warn!(error = %error, "failed to write stage event");
            }
        }
        Err(error) => tracing::warn!(error = %error, "failed to encode stage event"),
    }
}

pub fn render_error(error: &AppError) -> String {
    let mut out = String::new();
    match error.provider_error() {
        Some(inner) => {
            let _ = writeln!(out, "error [{}] {}: {}", inner.code, inner.provider, inner.message);
            if let Some(remedy) = &inner.remedy {
                let _ = writeln!(out, "  remedy: {}", remedy);
            }
            if let Some(logs_url) = &inner.logs_url {
                let _ = writeln!(out, "  logs: {}", logs_url);
            }
        }
        None => {
            let _ = writeln!(out, "error: {}", error);
        }
    }
    out
}

fn status_mark(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Planned => "·",
        StageStatus::Ok => "✓",
        StageStatus::Skipped => "-",
        StageStatus::Warning => "!",
        StageStatus::Failed => "✗",
    }
}

pub fn render_pipeline(summary: &PipelineSummary) -> String {
    let mut out = String::new();
    for stage in &summary.stages {
        let _ = write!(out, "{} {:<8} {:>6}ms", status_mark(stage.status), stage.stage.as_str(), stage.duration_ms);
        if let Some(message) = &stage.message {
            let _ = write!(out, "  {}", message);
        }
        out.push('\n');
    }
    for warning in &summary.warnings {
        let _ = writeln!(out, "warning: {}", warning);
    }
    for hint in &summary.hints {
        let _ = writeln!(out, "hint: {}", hint.message);
    }
    if summary.ok {
        let _ = writeln!(
            out,
            "deployed to {} ({})",
            summary.provider.as_str(),
            summary.target.as_str()
        );
    } else if let Some(error) = &summary.error {
        let _ = writeln!(out, "error [{}]: {}", error.code, error.message);
        if let Some(remedy) = &error.remedy {
            let _ = writeln!(out, "  remedy: {}", remedy);
        }
    }
    if let Some(url) = &summary.url {
        let _ = writeln!(out, "  url: {}", url);
    }
    if let Some(alias) = &summary.alias_url {
        let _ = writeln!(out, "  alias: {}", alias);
    }
    if let Some(logs) = &summary.logs_url {
        let _ = writeln!(out, "  logs: {}", logs);
    }
    out
}

pub fn render_env(report: &EnvReport) -> String {
    let mut out = String::new();
    for target in &report.targets {
        let _ = writeln!(out, "[{}] {}", report.provider, target.target.as_str());
        if target.diff.is_clean() {
            let _ = writeln!(out, "  in sync");
        }
        for key in &target.diff.added {
            let _ = writeln!(out, "  + {}", key);
        }
        for key in &target.diff.removed {
            let _ = writeln!(out, "  - {}", key);
        }
        for entry in &target.diff.changed {
            let _ = writeln!(out, "  ~ {}", entry.key);
        }
        if !target.written.is_empty() {
            let _ = writeln!(out, "  wrote {}", target.written.join(", "));
        }
        if !target.skipped.is_empty() {
            let _ = writeln!(out, "  unchanged {}", target.skipped.join(", "));
        }
        if !target.planned.is_empty() {
            let _ = writeln!(out, "  would write {}", target.planned.join(", "));
        }
    }
    for violation in &report.violations {
        let _ = writeln!(out, "error: {}", violation);
    }
    out
}

pub fn render_multi(report: &MultiRunReport) -> String {
    let mut out = String::new();
    for (index, layer) in report.layers.iter().enumerate() {
        let _ = writeln!(out, "layer {}: {}", index + 1, layer.join(", "));
    }
    for project in &report.projects {
        let url = project.pipeline.as_ref().and_then(|summary| summary.url.as_deref());
        let _ = write!(out, "{} {} ({})", if project.ok { "✓" } else { "✗" }, project.name, project.provider.as_str());
        if let Some(url) = url {
            let _ = write!(out, "  {}", url);
        }
        if let Some(error) = &project.error {
            let _ = write!(out, "  {}", error);
        }
        out.push('\n');
    }
    out
}

pub fn render_providers(providers: &[(String, CapabilitySet)]) -> String {
    let mut out = String::new();
    for (id, caps) in providers {
        let envs: Vec<&str> = caps.env_contexts.iter().map(|target| target.as_str()).collect();
        let _ = writeln!(
            out,
            "{:<13} linking={} local-build={} remote-build={} env=[{}] logs-follow={} alias={}",
            id,
            caps.project_linking,
            caps.local_build,
            caps.remote_build,
            envs.join(","),
            caps.logs_follow,
            caps.alias_domains
        );
    }
    out
}

pub fn render_doctor(report: &DoctorReport) -> String {
    let mut out = String::new();
    for check in &report.checks {
        let mark = match (check.ok, check.required) {
            (true, _) => "✓",
            (false, true) => "✗",
            (false, false) => "!",
        };
        let _ = writeln!(out, "{} {:<18} {}", mark, check.name, check.message);
    }
    let _ = writeln!(out, "{}", if report.ok { "ready to deploy" } else { "fix the ✗ items above" });
    out
}

pub fn render_validation(report: &ValidationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}: {} required", report.file.display(), report.required.len());
    for key in &report.missing {
        let _ = writeln!(out, "  missing  {}", key);
    }
    for violation in &report.violations {
        let _ = writeln!(out, "  invalid  {}", violation);
    }
    if !report.unknown.is_empty() {
        let _ = writeln!(out, "  unknown  {}", report.unknown.join(", "));
    }
    let _ = writeln!(out, "{}", if report.ok { "env is valid" } else { "env is invalid" });
    out
}

pub fn render_release(summary: &ReleaseSummary) -> String {
    let verb = match summary.action {
        ReleaseAction::Promote => "promote",
        ReleaseAction::Rollback => "rollback",
    };
    let mut out = String::new();
    if !summary.plan.is_empty() {
        let _ = writeln!(out, "{} plan ({}):", verb, summary.provider.as_str());
        for step in &summary.plan {
            let _ = writeln!(out, "  - {}", step);
        }
        return out;
    }
    if let Some(from) = &summary.from {
        let _ = writeln!(out, "{} {}", verb, from);
    }
    match (&summary.alias_url, summary.needs_alias) {
        (Some(url), _) => {
            let _ = writeln!(out, "production alias now serves {}", url);
        }
        (None, true) => {
            let _ = writeln!(out, "pass --alias <domain> to repoint production");
        }
        (None, false) => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{error_value, final_value, render_error};
    use crate::errors::{AppError, ErrorCode, ProviderError};
    use serde_json::json;

    #[test]
    fn terminal_objects_are_tagged_final() {
        let value = final_value(&json!({ "ok": true })).expect("value");
        assert_eq!(value, json!({ "ok": true, "final": true }));
        let value = final_value(&vec![1, 2]).expect("value");
        assert_eq!(value["final"], json!(true));
        assert_eq!(value["result"], json!([1, 2]));
    }

    #[test]
    fn provider_errors_keep_code_and_remedy() {
        let error: AppError = ProviderError::new(ErrorCode::AuthRequired, "vercel", "Not logged in to Vercel.")
            .with_remedy("Run: vercel login")
            .into();
        let value = error_value(&error);
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("AUTH_REQUIRED"));
        assert_eq!(value["error"]["remedy"], json!("Run: vercel login"));

        let text = render_error(&error);
        assert!(text.contains("error [AUTH_REQUIRED] vercel: Not logged in to Vercel."));
        assert!(text.contains("remedy: Run: vercel login"));
    }
}
