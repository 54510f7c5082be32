#![cfg(unix)]

use launchpad_lib::context::RuntimeContext;
use launchpad_lib::errors::ErrorCode;
use launchpad_lib::executor::Executor;
use launchpad_lib::models::{EnvTarget, ProviderKind};
use launchpad_lib::pipeline::{Orchestrator, PipelineRequest, Stage, StageStatus};
use launchpad_lib::providers::{resolve, ProviderOptions};
use std::sync::Arc;

fn mock_provider(mode: &str, ctx: Arc<RuntimeContext>) -> Arc<dyn launchpad_lib::providers::Provider> {
    let script = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/mock-vercel.sh");
    let mut options = ProviderOptions::default();
    options.retry.retries = 0;
    options
        .binaries
        .insert(ProviderKind::Vercel, format!("MOCK_VERCEL_MODE={} bash {}", mode, script));
    resolve(ProviderKind::Vercel, Executor::live(ctx), options, false)
}

fn local_build_request(dir: &std::path::Path) -> PipelineRequest {
    let mut request = PipelineRequest::new(ProviderKind::Vercel, dir, EnvTarget::Preview);
    request.local_build = true;
    request.login_on_auth_failure = false;
    request
}

#[tokio::test]
async fn mock_cli_deploy_reports_urls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(RuntimeContext::default());
    let orchestrator = Orchestrator::new(mock_provider("ok", ctx.clone()), ctx);

    let summary = orchestrator.run(&local_build_request(dir.path())).await;

    assert!(summary.ok, "unexpected failure: {:?}", summary.error);
    assert_eq!(summary.url.as_deref(), Some("https://mock-site-abc123.vercel.app"));
    assert_eq!(summary.logs_url.as_deref(), Some("https://vercel.com/mock/mock-site/dpl_123"));
    assert!(dir.path().join(".vercel/project.json").is_file());
    let stages: Vec<Stage> = summary.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec![Stage::Detect, Stage::Auth, Stage::Link, Stage::Build, Stage::Deploy]);
}

#[tokio::test]
async fn build_success_then_deploy_failure_is_classified() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(RuntimeContext::default());
    let orchestrator = Orchestrator::new(mock_provider("deploy-fail", ctx.clone()), ctx);

    let summary = orchestrator.run(&local_build_request(dir.path())).await;

    assert!(!summary.ok);
    let build = summary.stages.iter().find(|s| s.stage == Stage::Build).expect("build stage");
    assert_eq!(build.status, StageStatus::Ok);
    let error = summary.error.as_ref().expect("error payload");
    assert_eq!(error.code, ErrorCode::ModuleNotFound);
    assert_eq!(summary.url.as_deref(), Some("https://mock-site-abc123.vercel.app"));
    let json = serde_json::to_value(&summary).expect("serialize");
    assert_eq!(json["ok"], serde_json::json!(false));
    assert_eq!(json["error"]["code"], serde_json::json!("MODULE_NOT_FOUND"));
}

#[tokio::test]
async fn logged_out_cli_fails_auth_with_remedy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(RuntimeContext::default());
    let orchestrator = Orchestrator::new(mock_provider("logged-out", ctx.clone()), ctx);

    let summary = orchestrator.run(&local_build_request(dir.path())).await;

    assert!(!summary.ok);
    let error = summary.error.expect("error payload");
    assert_eq!(error.code, ErrorCode::AuthRequired);
    assert_eq!(error.remedy.as_deref(), Some("Run: vercel login"));
    assert_eq!(summary.stages.last().map(|s| s.stage), Some(Stage::Auth));
}
