//! Architectural Contract Test: Dependency Ordering
//!
//! Constraints verified:
//! - A dependency is committed before any operation of its dependents starts
//! - References are resolved from committed records at execution time
//! - Siblings run concurrently, bounded by `max_concurrency`
//! - Invalid graphs fail before any provider call

mod common;

use common::*;
use converge_core::state::MemoryStateStore;
use converge_core::traits::StateStore;
use converge_core::{DesiredState, Error, Reconciler, RunEvent};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn dependency_commits_before_dependent_starts() {
    let (fake, provider) = fake_provider();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let (reconciler, mut events) = Reconciler::new(provider, store, &fast_config()).unwrap();

    let summary = reconciler.apply(&desired(three_tier())).await.unwrap();
    assert!(summary.report.is_converged());

    let db = summary.plan.for_resource("db").unwrap().index;
    let web = summary.plan.for_resource("web").unwrap();
    assert!(db < web.index);
    assert_eq!(web.wait_for, vec![db]);

    let events = drain(&mut events);
    let committed_db = events
        .iter()
        .position(|e| matches!(e, RunEvent::OperationCommitted { resource, .. } if resource == "db"))
        .expect("db committed");
    let started_web = events
        .iter()
        .position(|e| matches!(e, RunEvent::OperationStarted { resource, .. } if resource == "web"))
        .expect("web started");
    assert!(committed_db < started_web, "events: {:?}", events);

    let creates = fake.calls_of("create");
    let db_pos = creates.iter().position(|c| c == "create db").unwrap();
    let web_pos = creates.iter().position(|c| c == "create web").unwrap();
    assert!(db_pos < web_pos);
}

#[tokio::test]
async fn references_resolve_to_committed_values() {
    let (fake, provider) = fake_provider();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let (reconciler, _events) = Reconciler::new(provider, store, &fast_config()).unwrap();

    let desired = desired(serde_json::json!({
        "resources": [
            { "kind": "virtual_machine", "name": "db", "attributes": { "cores": 2 } },
            {
                "kind": "virtual_machine",
                "name": "web",
                "attributes": {
                    "db_host": "${db.address}",
                    "db_cores": "${db.cores}",
                    "banner": "db is ${db.id} at ${db.address}"
                }
            }
        ]
    }));

    reconciler.apply(&desired).await.unwrap().report.into_result().unwrap();

    let (db_id, db) = fake.vm_named("db").unwrap();
    let (_, web) = fake.vm_named("web").unwrap();
    let db_address = format!("10.0.0.{}", db_id.parse::<u64>().unwrap() - 90);

    assert_eq!(web.attributes["db_host"].as_str(), Some(db_address.as_str()));
    // A whole-string reference keeps the referenced type
    assert_eq!(web.attributes["db_cores"], db.attributes["cores"]);
    assert_eq!(
        web.attributes["banner"].as_str(),
        Some(format!("db is {} at {}", db_id, db_address).as_str())
    );
}

#[tokio::test]
async fn siblings_run_concurrently_within_limit() {
    let (fake, provider) = fake_provider();
    fake.set_latency(Duration::from_millis(30));
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

    let mut config = fast_config();
    config.executor.max_concurrency = 2;
    let (reconciler, _events) = Reconciler::new(provider, store, &config).unwrap();

    let resources: Vec<_> = (0..5)
        .map(|i| {
            serde_json::json!({
                "kind": "virtual_machine",
                "name": format!("node{}", i),
                "attributes": { "cores": 1 }
            })
        })
        .collect();
    let desired = desired(serde_json::json!({ "resources": resources }));

    let summary = reconciler.apply(&desired).await.unwrap();

    assert!(summary.report.is_converged());
    assert_eq!(fake.max_in_flight(), 2);
}

#[tokio::test]
async fn cycle_is_rejected_before_any_call() {
    let err = DesiredState::from_json_str(
        &serde_json::json!({
            "resources": [
                { "kind": "virtual_machine", "name": "a", "attributes": { "peer": "${b.address}" } },
                { "kind": "virtual_machine", "name": "b", "attributes": { "peer": "${c.address}" } },
                { "kind": "virtual_machine", "name": "c", "attributes": { "peer": "${a.address}" } },
                { "kind": "virtual_machine", "name": "d", "attributes": {} }
            ]
        })
        .to_string(),
    )
    .unwrap_err();

    match err {
        Error::Validation { resources, .. } => {
            assert_eq!(resources, vec!["a", "b", "c"]);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn unsupported_kind_fails_before_mutation() {
    let (fake, provider) = fake_provider();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let (reconciler, _events) = Reconciler::new(provider, store, &fast_config()).unwrap();

    let desired = desired(serde_json::json!({
        "resources": [{ "kind": "load_balancer", "name": "lb", "attributes": {} }]
    }));

    let err = reconciler.apply(&desired).await.unwrap_err();
    assert!(err.is_planning_error());
    assert!(fake.calls().is_empty());
}
