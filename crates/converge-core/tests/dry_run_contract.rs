//! Architectural Contract Test: Dry Run Isolation
//!
//! This test verifies that applying with a dry-run provider never reaches
//! the persistent state store.
//!
//! Constraints verified:
//! - Simulated creates, updates and destroys are not committed
//! - A live run after a dry run plans exactly what it would have planned
//!   without the dry run
//! - Outputs of a dry run resolve against the simulated results
//!
//! If this test fails, a dry run can make the state lie about reality.

mod common;

use common::*;
use converge_core::state::FileStateStore;
use converge_core::traits::StateStore;
use converge_core::{OperationKind, Reconciler};
use std::sync::Arc;

#[tokio::test]
async fn dry_run_apply_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let (fake, provider) = fake_provider();
    fake.set_dry_run(true);

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&path).await.unwrap());
    let (reconciler, _events) =
        Reconciler::new(provider.clone(), store.clone(), &fast_config()).unwrap();
    let desired = desired(three_tier());

    let summary = reconciler.apply(&desired).await.unwrap();
    assert!(summary.report.is_converged(), "{}", summary.report);
    assert_eq!(fake.calls_of("create").len(), 3);
    assert!(summary.outputs["web_ip"].is_available());

    assert!(store.load().await.unwrap().is_empty());
    assert!(!path.exists(), "dry run must not write the state file");
    assert!(!dir.path().join("state.json.lock").exists());
    assert!(fake.vms().is_empty());

    // The same store, now live, still sees nothing under management
    fake.set_dry_run(false);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&path).await.unwrap());
    let (reconciler, _events) = Reconciler::new(provider, store, &fast_config()).unwrap();
    let plan = reconciler.plan(&desired).await.unwrap();
    assert_eq!(plan.summary().create, 3, "plan after dry run: {:?}", plan.kinds());
}

#[tokio::test]
async fn dry_run_keeps_existing_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let (fake, provider) = fake_provider();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&path).await.unwrap());
    let (reconciler, _events) =
        Reconciler::new(provider, store.clone(), &fast_config()).unwrap();

    reconciler
        .apply(&desired(three_tier()))
        .await
        .unwrap()
        .report
        .into_result()
        .unwrap();
    let before = store.load().await.unwrap();

    // Resize web and drop cache, but only pretend
    let mut doc = three_tier();
    doc["resources"][1]["attributes"]["memory"] = serde_json::json!(4096);
    doc["resources"].as_array_mut().unwrap().remove(2);
    let changed = desired(doc);

    fake.set_dry_run(true);
    let summary = reconciler.apply(&changed).await.unwrap();
    assert!(summary.report.is_converged(), "{}", summary.report);
    assert_eq!(fake.calls_of("update").len(), 1);
    assert_eq!(fake.calls_of("destroy").len(), 1);

    assert_eq!(store.load().await.unwrap(), before);
    assert_eq!(fake.vms().len(), 3);

    fake.set_dry_run(false);
    let plan = reconciler.plan(&changed).await.unwrap();
    let kinds = plan.kinds();
    assert!(kinds.contains(&("web", OperationKind::UpdateInPlace)), "{:?}", kinds);
    assert!(kinds.contains(&("cache", OperationKind::Destroy)), "{:?}", kinds);
    assert!(kinds.contains(&("db", OperationKind::NoOp)), "{:?}", kinds);
}
