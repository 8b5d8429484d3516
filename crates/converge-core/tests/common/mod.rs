//! Test doubles and common utilities for architecture contract tests
//!
//! `FakeProvider` keeps its "infrastructure" in memory, records every call,
//! and can be scripted to fail or to report resources as not yet ready.

#![allow(dead_code)]

use async_trait::async_trait;
use converge_core::config::{ConvergeConfig, ProviderConfig, RetryConfig, StateStoreConfig};
use converge_core::diff::AttributeChange;
use converge_core::error::{Error, Result};
use converge_core::state::{MemoryStateStore, StateLock};
use converge_core::traits::{Provider, ProvisionedResource, StateRecord, StateStore};
use converge_core::value::{AttrValue, Attributes};
use converge_core::{DesiredState, RunEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// How a scripted call fails
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Fail transiently this many times, then succeed
    Transient(usize),
    /// Fail permanently every time
    Permanent,
}

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub name: String,
    pub kind: String,
    pub source: Option<String>,
    pub attributes: Attributes,
    /// Remaining `get` calls before the VM reports ready
    pub polls_until_ready: usize,
}

#[derive(Default)]
struct Inner {
    vms: BTreeMap<String, FakeVm>,
    next_id: u64,
    calls: Vec<String>,
    failures: HashMap<(String, String), Failure>,
    failed_so_far: HashMap<(String, String), usize>,
}

/// In-memory provider with call recording and failure scripting
pub struct FakeProvider {
    inner: Mutex<Inner>,
    /// `get` calls a new VM needs before it is ready
    ready_after: AtomicUsize,
    /// Artificial latency of mutating calls
    latency: Mutex<Duration>,
    /// Latency overrides per op
    op_latency: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Record mutations without touching the VMs
    dry_run: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 100,
                ..Inner::default()
            }),
            ready_after: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            op_latency: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            dry_run: AtomicBool::new(false),
        }
    }

    /// Script `op` ("create", "update", "destroy", "get") on `name` to fail
    ///
    /// For "destroy" and "get", `name` is the provider id.
    pub fn fail(&self, op: &str, name: &str, failure: Failure) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert((op.to_string(), name.to_string()), failure);
    }

    /// New VMs report ready only after `polls` calls to `get`
    pub fn ready_after(&self, polls: usize) {
        self.ready_after.store(polls, Ordering::SeqCst);
    }

    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Latency of one op ("create", "update", "destroy") only
    pub fn set_op_latency(&self, op: &str, latency: Duration) {
        self.op_latency
            .lock()
            .unwrap()
            .insert(op.to_string(), latency);
    }

    /// Every call, as "op name-or-id"
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls whose op is `op`
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .collect()
    }

    /// Number of create, update and destroy calls
    pub fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !c.starts_with("get "))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// VMs currently "running", keyed by id
    pub fn vms(&self) -> BTreeMap<String, FakeVm> {
        self.inner.lock().unwrap().vms.clone()
    }

    pub fn vm_named(&self, name: &str) -> Option<(String, FakeVm)> {
        self.vms().into_iter().find(|(_, vm)| vm.name == name)
    }

    /// Finish booting every VM
    pub fn mark_all_ready(&self) {
        for vm in self.inner.lock().unwrap().vms.values_mut() {
            vm.polls_until_ready = 0;
        }
    }

    /// Remove a VM behind the reconciler's back
    pub fn delete_out_of_band(&self, id: &str) {
        self.inner.lock().unwrap().vms.remove(id);
    }

    fn record(&self, op: &str, target: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("{} {}", op, target));

        let key = (op.to_string(), target.to_string());
        match inner.failures.get(&key).copied() {
            None => Ok(()),
            Some(Failure::Permanent) => Err(Error::permanent(
                "fake",
                format!("{} {} rejected", op, target),
            )),
            Some(Failure::Transient(times)) => {
                let seen = inner.failed_so_far.entry(key).or_insert(0);
                if *seen < times {
                    *seen += 1;
                    Err(Error::transient("fake", format!("{} {} busy", op, target)))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn mutate<T>(&self, op: &str, f: impl FnOnce() -> T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = self
            .op_latency
            .lock()
            .unwrap()
            .get(op)
            .copied()
            .unwrap_or_else(|| *self.latency.lock().unwrap());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = f();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn observed(id: &str, vm: &FakeVm) -> ProvisionedResource {
        let mut attributes = vm.attributes.clone();
        let octet: u64 = id.parse::<u64>().unwrap_or(100) - 90;
        attributes.insert("address".to_string(), AttrValue::from(format!("10.0.0.{}", octet)));
        attributes.insert("status".to_string(), AttrValue::from("running"));
        ProvisionedResource::new(id, attributes, vm.polls_until_ready == 0)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn create(
        &self,
        kind: &str,
        name: &str,
        source: Option<&str>,
        attributes: &Attributes,
    ) -> Result<ProvisionedResource> {
        self.mutate("create", || {
            self.record("create", name)?;
            let mut inner = self.inner.lock().unwrap();

            if self.dry_run.load(Ordering::SeqCst) {
                let vm = FakeVm {
                    name: name.to_string(),
                    kind: kind.to_string(),
                    source: source.map(str::to_string),
                    attributes: attributes.clone(),
                    polls_until_ready: 0,
                };
                return Ok(Self::observed(&format!("dry-run-{}", name), &vm));
            }

            if let Some((id, vm)) = inner.vms.iter().find(|(_, vm)| vm.name == name) {
                return Ok(Self::observed(id, vm));
            }

            let id = inner.next_id.to_string();
            inner.next_id += 1;
            let vm = FakeVm {
                name: name.to_string(),
                kind: kind.to_string(),
                source: source.map(str::to_string),
                attributes: attributes.clone(),
                polls_until_ready: self.ready_after.load(Ordering::SeqCst),
            };
            let observed = Self::observed(&id, &vm);
            inner.vms.insert(id, vm);
            Ok(observed)
        })
        .await
    }

    async fn update(
        &self,
        _kind: &str,
        id: &str,
        changes: &[AttributeChange],
    ) -> Result<ProvisionedResource> {
        self.mutate("update", || {
            self.record("update", id)?;
            let mut inner = self.inner.lock().unwrap();
            if self.dry_run.load(Ordering::SeqCst) {
                let vm = inner
                    .vms
                    .get(id)
                    .ok_or_else(|| Error::permanent("fake", format!("no VM {}", id)))?;
                return Ok(Self::observed(id, vm));
            }
            let vm = inner
                .vms
                .get_mut(id)
                .ok_or_else(|| Error::permanent("fake", format!("no VM {}", id)))?;
            for change in changes {
                match &change.new {
                    Some(value) => {
                        vm.attributes.insert(change.name.clone(), value.clone());
                    }
                    None => {
                        vm.attributes.remove(&change.name);
                    }
                }
            }
            Ok(Self::observed(id, vm))
        })
        .await
    }

    async fn destroy(&self, _kind: &str, id: &str) -> Result<()> {
        self.mutate("destroy", || {
            self.record("destroy", id)?;
            if !self.dry_run.load(Ordering::SeqCst) {
                self.inner.lock().unwrap().vms.remove(id);
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, _kind: &str, id: &str) -> Result<Option<ProvisionedResource>> {
        self.record("get", id)?;
        let mut inner = self.inner.lock().unwrap();
        let Some(vm) = inner.vms.get_mut(id) else {
            return Ok(None);
        };
        vm.polls_until_ready = vm.polls_until_ready.saturating_sub(1);
        Ok(Some(Self::observed(id, vm)))
    }

    fn supports_kind(&self, kind: &str) -> bool {
        kind == "virtual_machine"
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }
}

/// Memory store whose `put` fails for one resource
pub struct CommitFailingStore {
    pub inner: MemoryStateStore,
    fail_put: String,
}

impl CommitFailingStore {
    pub fn new(inner: MemoryStateStore, fail_put: &str) -> Self {
        Self {
            inner,
            fail_put: fail_put.to_string(),
        }
    }
}

#[async_trait]
impl StateStore for CommitFailingStore {
    async fn load(&self) -> Result<BTreeMap<String, StateRecord>> {
        self.inner.load().await
    }

    async fn get(&self, name: &str) -> Result<Option<StateRecord>> {
        self.inner.get(name).await
    }

    async fn put(&self, record: &StateRecord) -> Result<()> {
        if record.name == self.fail_put {
            return Err(Error::state_store(format!("disk full writing {}", record.name)));
        }
        self.inner.put(record).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner.list().await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn lock(&self, holder: &str, stale_after: Duration) -> Result<StateLock> {
        self.inner.lock(holder, stale_after).await
    }
}

/// Provider handle shared between the test and the reconciler
pub fn fake_provider() -> (Arc<FakeProvider>, Arc<dyn Provider>) {
    let fake = Arc::new(FakeProvider::new());
    let provider: Arc<dyn Provider> = fake.clone();
    (fake, provider)
}

/// Configuration with millisecond backoffs
pub fn fast_config() -> ConvergeConfig {
    let mut config = ConvergeConfig::new(
        ProviderConfig::Custom {
            factory: "fake".to_string(),
            config: serde_json::json!({}),
        },
        StateStoreConfig::Memory,
    );
    config.executor.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2.0,
        attempt_timeout_secs: 5,
    };
    config.executor.readiness = RetryConfig {
        max_attempts: 5,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2.0,
        attempt_timeout_secs: 5,
    };
    config
}

/// Parse a desired-state document, panicking on validation errors
pub fn desired(json: serde_json::Value) -> DesiredState {
    DesiredState::from_json_str(&json.to_string()).expect("valid desired state")
}

/// `web` depends on `db` through a reference; `cache` is independent
pub fn three_tier() -> serde_json::Value {
    serde_json::json!({
        "resources": [
            {
                "kind": "virtual_machine",
                "name": "db",
                "source": "template-A",
                "attributes": { "cores": 2, "memory": 4096 }
            },
            {
                "kind": "virtual_machine",
                "name": "web",
                "source": "template-A",
                "attributes": {
                    "cores": 2,
                    "memory": 2048,
                    "db_host": "${db.address}"
                }
            },
            {
                "kind": "virtual_machine",
                "name": "cache",
                "source": "template-A",
                "attributes": { "cores": 1, "memory": 1024 }
            }
        ],
        "outputs": {
            "web_ip": "web.address",
            "db_ip": "db.address"
        }
    })
}

/// Drain every event currently buffered
pub fn drain(rx: &mut mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
