//! Minimal embedding example for converge-core
//!
//! This example uses converge-core as a library in a custom application:
//! an in-process provider, an in-memory state store, and a reconciler whose
//! lifecycle is fully managed by the application.

use converge_core::diff::AttributeChange;
use converge_core::traits::{Provider, ProvisionedResource, StateStore};
use converge_core::{
    AttrValue, Attributes, ConvergeConfig, DesiredState, MemoryStateStore, ProviderConfig,
    Reconciler, Result, StateStoreConfig, output,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hypervisor simulated in memory
struct EmbeddedProvider {
    vms: Mutex<BTreeMap<String, Attributes>>,
    next_id: AtomicU64,
}

impl EmbeddedProvider {
    fn new() -> Self {
        Self {
            vms: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(100),
        }
    }

    fn observed(id: &str, attributes: &Attributes) -> ProvisionedResource {
        let mut observed = attributes.clone();
        observed.insert(
            "address".to_string(),
            AttrValue::from(format!("192.168.10.{}", id)),
        );
        ProvisionedResource::new(id, observed, true)
    }
}

#[async_trait::async_trait]
impl Provider for EmbeddedProvider {
    async fn create(
        &self,
        _kind: &str,
        name: &str,
        source: Option<&str>,
        attributes: &Attributes,
    ) -> Result<ProvisionedResource> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        println!(
            "[Embedded] Cloning {} from {}",
            name,
            source.unwrap_or("<scratch>")
        );
        self.vms
            .lock()
            .unwrap()
            .insert(id.clone(), attributes.clone());
        Ok(Self::observed(&id, attributes))
    }

    async fn update(
        &self,
        _kind: &str,
        id: &str,
        changes: &[AttributeChange],
    ) -> Result<ProvisionedResource> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| converge_core::Error::permanent("embedded", format!("no VM {}", id)))?;
        for change in changes {
            println!("[Embedded] {} {}: {:?} -> {:?}", id, change.name, change.old, change.new);
            match &change.new {
                Some(value) => {
                    vm.insert(change.name.clone(), value.clone());
                }
                None => {
                    vm.remove(&change.name);
                }
            }
        }
        Ok(Self::observed(id, vm))
    }

    async fn destroy(&self, _kind: &str, id: &str) -> Result<()> {
        println!("[Embedded] Deleting {}", id);
        self.vms.lock().unwrap().remove(id);
        Ok(())
    }

    async fn get(&self, _kind: &str, id: &str) -> Result<Option<ProvisionedResource>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .get(id)
            .map(|attributes| Self::observed(id, attributes)))
    }

    fn supports_kind(&self, kind: &str) -> bool {
        kind == "virtual_machine"
    }

    fn provider_name(&self) -> &'static str {
        "embedded"
    }
}

fn lab(web_memory: i64) -> Result<DesiredState> {
    let document = serde_json::json!({
        "resources": [
            {
                "kind": "virtual_machine",
                "name": "db",
                "source": "debian-12",
                "attributes": { "cores": 2, "memory": 4096 }
            },
            {
                "kind": "virtual_machine",
                "name": "web",
                "source": "debian-12",
                "attributes": {
                    "cores": 2,
                    "memory": web_memory,
                    "description": "db at ${db.address}"
                }
            }
        ],
        "outputs": { "web_ip": "web.address" }
    });
    DesiredState::from_json_str(&document.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Embedded converge-core Example ===\n");

    let provider: Arc<dyn Provider> = Arc::new(EmbeddedProvider::new());
    let state_store = Arc::new(MemoryStateStore::new());

    let config = ConvergeConfig::new(
        ProviderConfig::Custom {
            factory: "embedded".to_string(),
            config: serde_json::json!({}),
        },
        StateStoreConfig::Memory,
    );

    println!("1. Creating reconciler...");
    let (reconciler, mut event_rx) = Reconciler::new(provider, state_store.clone(), &config)?;

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
        println!("Event listener stopped");
    });

    println!("2. Planning...");
    let plan = reconciler.plan(&lab(2048)?).await?;
    for op in plan.operations() {
        println!("   {}", op);
    }

    println!("\n3. Applying...");
    let summary = reconciler.apply(&lab(2048)?).await?;
    print!("{}", summary.report);
    println!("   outputs: {}", output::to_json(&summary.outputs));

    println!("\n4. Re-applying unchanged input (expect no changes)...");
    let summary = reconciler.apply(&lab(2048)?).await?;
    println!("   {}", summary.plan.summary());

    println!("\n5. Resizing web in place...");
    let summary = reconciler.apply(&lab(4096)?).await?;
    println!("   {}", summary.plan.summary());

    println!("\n6. State now holds {} record(s)", state_store.list().await?.len());

    drop(reconciler);
    let _ = event_listener.await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Reconciler lifecycle is fully controlled by the application");
    println!("- No global state");
    println!("- Provider and state store are custom (not the CLI defaults)");

    Ok(())
}
