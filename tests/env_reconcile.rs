use launchpad_lib::context::RuntimeContext;
use launchpad_lib::envsync::{diff_env, EnvReconciler, EnvSource, SyncOptions};
use launchpad_lib::models::{EnvTarget, ProjectRef};
use launchpad_lib::providers::noop::{EnvWrite, NoopProvider};
use std::collections::BTreeMap;
use std::sync::Arc;

fn write(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write file");
    path
}

#[tokio::test]
async fn expanded_values_diff_against_remote() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), ".env", "A=1\nB=${A}2\n");
    let provider = Arc::new(NoopProvider::default());
    provider.seed(EnvTarget::Preview, &[("B", "12"), ("C", "x")]);
    let reconciler = EnvReconciler::new(provider, Arc::new(RuntimeContext::default()));

    let local = reconciler.load_local(&EnvSource::new(file)).expect("local");
    let report = reconciler
        .check(
            dir.path(),
            &ProjectRef::default(),
            &[EnvTarget::Preview],
            &local,
            &SyncOptions {
                fail_on_remove: true,
                ..SyncOptions::default()
            },
        )
        .await
        .expect("check");

    let diff = &report.targets[0].diff;
    assert_eq!(diff.added, vec!["A".to_string()]);
    assert_eq!(diff.removed, vec!["C".to_string()]);
    assert!(diff.changed.is_empty());
    assert_eq!(report.violations, vec!["preview: keys only present remotely: C".to_string()]);
    assert!(!report.ok());
}

#[tokio::test]
async fn mapping_and_filters_shape_what_gets_synced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(
        dir.path(),
        ".env",
        "PUBLIC_A=  padded  \nPUBLIC_SECRET=hunter22\nPRIVATE_X=1\nOLD_NAME=value\n",
    );
    let mapping = write(
        dir.path(),
        "mapping.yaml",
        "rename:\n  OLD_NAME: PUBLIC_RENAMED\ntransform:\n  PUBLIC_A: trim\n",
    );
    let provider = Arc::new(NoopProvider::default());
    let reconciler = EnvReconciler::new(provider.clone(), Arc::new(RuntimeContext::default()));
    let source = EnvSource {
        mapping: Some(mapping),
        only: vec!["PUBLIC_*".to_string()],
        ignore: vec!["PUBLIC_SECRET".to_string()],
        ..EnvSource::new(file)
    };

    let local = reconciler.load_local(&source).expect("local");
    assert_eq!(local.keys().cloned().collect::<Vec<_>>(), vec!["PUBLIC_A", "PUBLIC_RENAMED"]);

    let report = reconciler
        .sync(
            dir.path(),
            &ProjectRef::default(),
            &[EnvTarget::Production],
            &local,
            &SyncOptions::default(),
        )
        .await
        .expect("sync");
    assert!(report.ok());
    let remote = provider.remote(EnvTarget::Production);
    assert_eq!(remote.get("PUBLIC_A").map(String::as_str), Some("padded"));
    assert_eq!(remote.get("PUBLIC_RENAMED").map(String::as_str), Some("value"));
    assert!(provider
        .writes()
        .iter()
        .all(|write| !matches!(write, EnvWrite::Set { key, .. } if key == "PUBLIC_SECRET")));
}

#[tokio::test]
async fn applying_a_diff_leaves_only_removals() {
    let local: BTreeMap<String, String> = [("A", "1"), ("B", "2")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let provider = Arc::new(NoopProvider::default());
    provider.seed(EnvTarget::Preview, &[("B", "old"), ("C", "x")]);
    let before = diff_env(&local, &provider.remote(EnvTarget::Preview));
    assert_eq!(before.added, vec!["A".to_string()]);
    assert_eq!(before.changed.len(), 1);

    let reconciler = EnvReconciler::new(provider.clone(), Arc::new(RuntimeContext::default()));
    reconciler
        .sync(
            std::path::Path::new("."),
            &ProjectRef::default(),
            &[EnvTarget::Preview],
            &local,
            &SyncOptions::default(),
        )
        .await
        .expect("sync");

    let after = diff_env(&local, &provider.remote(EnvTarget::Preview));
    assert!(after.added.is_empty());
    assert!(after.changed.is_empty());
    assert_eq!(after.removed, before.removed);
}
