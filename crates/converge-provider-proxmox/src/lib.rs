// # Proxmox VE Provider
//
// This crate provides a Proxmox VE provider implementation for the converge
// reconciler. It manages `virtual_machine` resources by cloning templates.
//
// ## Behavior
//
// - One logical action per call; failures go back to the executor
// - HTTP status codes classified as transient (429, 5xx, timeouts) or permanent
// - A VM left behind by an interrupted create is adopted by name
// - Readiness: the VM is running and its guest agent reports an IPv4 address
// - Destroying a VM that no longer exists succeeds
// - Dry-run mode: reads are performed, mutations are only logged
//
// ## Architectural Constraints
//
// ### Trust Level: Untrusted (Provider)
//
// **Allowed Capabilities**:
// - Perform HTTP/HTTPS API calls to the configured endpoint only
// - Wait for a task that the same call started on the node
// - Parse provider-specific responses
//
// **Forbidden Capabilities**:
// - Spawn tasks or threads
// - Retry or back off (owned by the executor's `RetryPolicy`)
// - Access the state store (owned by the executor)
// - Cache state beyond a single call
//
// ## Security Requirements
//
// - The token secret NEVER appears in logs or Debug output
// - Provider construction fails fast on an empty secret
//
// ## API Reference
//
// - Next free id: GET `/cluster/nextid`
// - List VMs: GET `/nodes/:node/qemu`
// - Clone: POST `/nodes/:node/qemu/:template/clone`
// - Configure: POST `/nodes/:node/qemu/:vmid/config`
// - Start / stop: POST `/nodes/:node/qemu/:vmid/status/{start,stop}`
// - Status: GET `/nodes/:node/qemu/:vmid/status/current`
// - Guest addresses: GET `/nodes/:node/qemu/:vmid/agent/network-get-interfaces`
// - Delete: DELETE `/nodes/:node/qemu/:vmid?purge=1`
// - Task status: GET `/nodes/:node/tasks/:upid/status`

use async_trait::async_trait;
use converge_core::config::ProviderConfig;
use converge_core::diff::AttributeChange;
use converge_core::traits::{Provider, ProviderFactory, ProvisionedResource};
use converge_core::value::{AttrValue, Attributes};
use converge_core::{Error, Registry, Result};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

/// Provider name used in errors and logs
const PROVIDER: &str = "proxmox";

/// The only resource kind this provider manages
const VIRTUAL_MACHINE: &str = "virtual_machine";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between task status polls
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a node task started by this provider
const TASK_DEADLINE: Duration = Duration::from_secs(600);

/// Config keys reported by the platform that are never part of a declaration
const IGNORED_CONFIG_KEYS: &[&str] = &["digest"];

/// Outcome of a single API call
#[derive(Debug)]
enum Reply {
    /// `data` member of a successful response
    Data(Value),
    /// The addressed VM does not exist
    Missing,
}

/// Proxmox VE provider
///
/// # Trust Level: Untrusted
///
/// This provider is isolated, stateless, and single-shot. All coordination
/// (retries, backoff, ordering) is owned by the executor.
///
/// # Dry-Run Mode
///
/// When `dry_run` is true, the provider will:
/// - Perform all GET requests (VM lookup, status)
/// - Log the intended mutation
/// - **NOT** clone, configure, start, stop or delete anything
///
/// # Security
///
/// The Debug implementation does NOT expose the token secret.
pub struct ProxmoxProvider {
    /// API base, e.g. `https://pve.example.com:8006/api2/json`
    api_base: String,

    /// API token id, `user@realm!tokenname`
    token_id: String,

    /// API token secret
    /// NEVER log this value
    token_secret: String,

    /// Node that hosts the managed VMs
    node: String,

    /// HTTP client for API requests
    client: reqwest::Client,

    /// Dry-run mode: if true, perform GET requests but skip mutations
    dry_run: bool,
}

// Hides the token secret
impl std::fmt::Debug for ProxmoxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxProvider")
            .field("api_base", &self.api_base)
            .field("token_id", &self.token_id)
            .field("token_secret", &"<REDACTED>")
            .field("node", &self.node)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl ProxmoxProvider {
    /// Create a new Proxmox provider
    ///
    /// # Parameters
    ///
    /// - `endpoint`: Base URL of the node or cluster, e.g. `https://pve:8006`
    /// - `token_id`: API token id (`user@realm!tokenname`)
    /// - `token_secret`: API token secret
    /// - `node`: Node that hosts the VMs
    /// - `insecure_tls`: Accept self-signed certificates
    /// - `dry_run`: If true, perform GET requests but skip mutations
    pub fn new(
        endpoint: &str,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
        node: impl Into<String>,
        insecure_tls: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let token_secret = token_secret.into();
        if token_secret.is_empty() {
            return Err(Error::config("Proxmox token secret cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: format!("{}/api2/json", endpoint.trim_end_matches('/')),
            token_id: token_id.into(),
            token_secret,
            node: node.into(),
            client,
            dry_run,
        })
    }

    fn qemu_path(&self, vmid: &str) -> String {
        format!("/nodes/{}/qemu/{}", self.node, vmid)
    }

    /// Perform one API request and unwrap the `data` member
    async fn api(
        &self,
        method: Method,
        path: &str,
        form: &[(String, String)],
        context: &str,
    ) -> Result<Reply> {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(
                "Authorization",
                format!("PVEAPIToken={}={}", self.token_id, self.token_secret),
            );
        if !form.is_empty() {
            request = request.form(form);
        }

        let response = request.send().await.map_err(|e| {
            // Connection failures and timeouts are transient
            Error::transient(PROVIDER, format!("{}: HTTP request failed: {}", context, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            if is_missing(status.as_u16(), &body) {
                return Ok(Reply::Missing);
            }
            return Err(classify(status.as_u16(), &body, context));
        }

        let json: Value = response.json().await.map_err(|e| {
            Error::transient(PROVIDER, format!("{}: failed to parse response: {}", context, e))
        })?;
        tracing::trace!("{} {} succeeded", method, path);
        Ok(Reply::Data(json.get("data").cloned().unwrap_or(Value::Null)))
    }

    /// Like [`Self::api`], treating a missing VM as an error
    async fn api_data(
        &self,
        method: Method,
        path: &str,
        form: &[(String, String)],
        context: &str,
    ) -> Result<Value> {
        match self.api(method, path, form, context).await? {
            Reply::Data(data) => Ok(data),
            Reply::Missing => Err(Error::permanent(
                PROVIDER,
                format!("{}: resource does not exist", context),
            )),
        }
    }

    /// Wait until a node task started by this call has stopped
    ///
    /// A task that ends with anything other than `OK` fails the call.
    async fn wait_task(&self, upid: &Value, context: &str) -> Result<()> {
        let Some(upid) = upid.as_str() else {
            // Some endpoints answer synchronously
            return Ok(());
        };
        let path = format!("/nodes/{}/tasks/{}/status", self.node, upid);
        let deadline = tokio::time::Instant::now() + TASK_DEADLINE;

        loop {
            let status = self.api_data(Method::GET, &path, &[], context).await?;
            if status["status"].as_str() == Some("stopped") {
                return match status["exitstatus"].as_str() {
                    Some("OK") => Ok(()),
                    other => Err(Error::permanent(
                        PROVIDER,
                        format!(
                            "{}: task {} failed: {}",
                            context,
                            upid,
                            other.unwrap_or("unknown exit status")
                        ),
                    )),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::transient(
                    PROVIDER,
                    format!("{}: task {} still running", context, upid),
                ));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    /// Find a VM by its platform-side name
    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let path = format!("/nodes/{}/qemu", self.node);
        let vms = self.api_data(Method::GET, &path, &[], "list VMs").await?;
        Ok(vms
            .as_array()
            .into_iter()
            .flatten()
            .filter(|vm| vm["template"].as_u64() != Some(1))
            .find(|vm| vm["name"].as_str() == Some(name))
            .and_then(|vm| vmid_of(&vm["vmid"])))
    }

    /// Resolve a clone source: a numeric VMID or a template name
    async fn template_id(&self, source: &str) -> Result<String> {
        if source.chars().all(|c| c.is_ascii_digit()) {
            return Ok(source.to_string());
        }
        let path = format!("/nodes/{}/qemu", self.node);
        let vms = self.api_data(Method::GET, &path, &[], "list templates").await?;
        vms.as_array()
            .into_iter()
            .flatten()
            .filter(|vm| vm["template"].as_u64() == Some(1))
            .find(|vm| vm["name"].as_str() == Some(source))
            .and_then(|vm| vmid_of(&vm["vmid"]))
            .ok_or_else(|| {
                Error::permanent(PROVIDER, format!("template `{}` not found on node {}", source, self.node))
            })
    }

    /// First IPv4 address reported by the guest agent
    ///
    /// The agent is unavailable while the guest boots, so any failure
    /// simply means "no address yet".
    async fn guest_address(&self, vmid: &str) -> Option<String> {
        let path = format!("{}/agent/network-get-interfaces", self.qemu_path(vmid));
        let reply = self.api(Method::GET, &path, &[], "guest agent").await.ok()?;
        let Reply::Data(data) = reply else {
            return None;
        };
        first_ipv4(&data)
    }

    async fn configure(&self, vmid: &str, form: Vec<(String, String)>, context: &str) -> Result<()> {
        if form.is_empty() {
            return Ok(());
        }
        let path = format!("{}/config", self.qemu_path(vmid));
        let upid = self.api_data(Method::POST, &path, &form, context).await?;
        self.wait_task(&upid, context).await
    }

    async fn start(&self, vmid: &str) -> Result<()> {
        let path = format!("{}/status/start", self.qemu_path(vmid));
        let upid = self.api_data(Method::POST, &path, &[], "start VM").await?;
        self.wait_task(&upid, "start VM").await
    }

    async fn observe(&self, vmid: &str) -> Result<Option<ProvisionedResource>> {
        let status_path = format!("{}/status/current", self.qemu_path(vmid));
        let status = match self.api(Method::GET, &status_path, &[], "VM status").await? {
            Reply::Data(status) => status,
            Reply::Missing => return Ok(None),
        };
        let config_path = format!("{}/config", self.qemu_path(vmid));
        let config = match self.api(Method::GET, &config_path, &[], "VM config").await? {
            Reply::Data(config) => config,
            Reply::Missing => return Ok(None),
        };

        let mut attributes = observed_config(&config);
        let running = status["status"].as_str() == Some("running");
        if let Some(state) = status["status"].as_str() {
            attributes.insert("status".to_string(), AttrValue::from(state));
        }
        attributes.insert("vmid".to_string(), AttrValue::from(vmid));

        let address = if running {
            self.guest_address(vmid).await
        } else {
            None
        };
        let ready = address.is_some();
        if let Some(address) = address {
            attributes.insert("address".to_string(), AttrValue::from(address));
        }

        Ok(Some(ProvisionedResource::new(vmid, attributes, ready)))
    }
}

#[async_trait]
impl Provider for ProxmoxProvider {
    /// Clone a template into a new VM, configure it and start it
    ///
    /// The VM is returned as not ready: the executor polls [`Provider::get`]
    /// until the guest agent reports an address.
    ///
    /// # API Calls
    ///
    /// ```http
    /// GET  /nodes/:node/qemu                      # adopt by name
    /// GET  /cluster/nextid
    /// POST /nodes/:node/qemu/:template/clone      # newid, name, full=1
    /// POST /nodes/:node/qemu/:vmid/config         # declared attributes
    /// POST /nodes/:node/qemu/:vmid/status/start
    /// ```
    async fn create(
        &self,
        kind: &str,
        name: &str,
        source: Option<&str>,
        attributes: &Attributes,
    ) -> Result<ProvisionedResource> {
        ensure_kind(kind)?;
        tracing::info!(
            "Creating VM {} from {} [mode: {}]",
            name,
            source.unwrap_or("<none>"),
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        if let Some(vmid) = self.find_by_name(name).await? {
            tracing::info!("Adopting existing VM {} ({})", name, vmid);
            return Ok(self
                .observe(&vmid)
                .await?
                .unwrap_or_else(|| ProvisionedResource::new(vmid, Attributes::new(), false)));
        }

        let source = source.ok_or_else(|| {
            Error::permanent(PROVIDER, format!("VM {} needs a source template", name))
        })?;
        let template = self.template_id(source).await?;
        let form = config_form(attributes);

        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would clone template {} as {} and set {:?}",
                template,
                name,
                form
            );
            let mut observed = attributes.clone();
            observed.insert("status".to_string(), AttrValue::from("running"));
            return Ok(ProvisionedResource::new(
                format!("dry-run-{}", name),
                observed,
                true,
            ));
        }

        let next = self
            .api_data(Method::GET, "/cluster/nextid", &[], "allocate VMID")
            .await?;
        let vmid = vmid_of(&next)
            .ok_or_else(|| Error::transient(PROVIDER, "allocate VMID: unexpected response"))?;

        let clone_form = vec![
            ("newid".to_string(), vmid.clone()),
            ("name".to_string(), name.to_string()),
            ("full".to_string(), "1".to_string()),
        ];
        let clone_path = format!("{}/clone", self.qemu_path(&template));
        let upid = self
            .api_data(Method::POST, &clone_path, &clone_form, "clone template")
            .await?;
        self.wait_task(&upid, "clone template").await?;

        self.configure(&vmid, form, "configure VM").await?;
        self.start(&vmid).await?;

        tracing::info!("VM {} created as {}", name, vmid);
        let mut observed = attributes.clone();
        observed.insert("vmid".to_string(), AttrValue::from(vmid.as_str()));
        Ok(ProvisionedResource::new(vmid, observed, false))
    }

    /// Apply the mutable attribute delta through the config endpoint
    ///
    /// Removed attributes are sent in the `delete` parameter.
    async fn update(
        &self,
        kind: &str,
        id: &str,
        changes: &[AttributeChange],
    ) -> Result<ProvisionedResource> {
        ensure_kind(kind)?;
        let form = update_form(changes);

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would update VM {} with {:?}", id, form);
            let observed = changes
                .iter()
                .filter_map(|c| c.new.clone().map(|v| (c.name.clone(), v)))
                .collect();
            return Ok(ProvisionedResource::new(id, observed, true));
        }

        tracing::info!("Updating VM {} ({} attribute(s))", id, changes.len());
        self.configure(id, form, "update VM").await?;

        self.observe(id).await?.ok_or_else(|| {
            Error::permanent(PROVIDER, format!("VM {} disappeared during update", id))
        })
    }

    /// Stop and delete a VM; a VM that is already gone counts as destroyed
    async fn destroy(&self, kind: &str, id: &str) -> Result<()> {
        ensure_kind(kind)?;

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would stop and delete VM {}", id);
            return Ok(());
        }

        tracing::info!("Destroying VM {}", id);
        let stop_path = format!("{}/status/stop", self.qemu_path(id));
        match self.api(Method::POST, &stop_path, &[], "stop VM").await? {
            Reply::Missing => {
                tracing::info!("VM {} already gone", id);
                return Ok(());
            }
            Reply::Data(upid) => self.wait_task(&upid, "stop VM").await?,
        }

        let delete_path = format!("{}?purge=1", self.qemu_path(id));
        match self.api(Method::DELETE, &delete_path, &[], "delete VM").await? {
            Reply::Missing => Ok(()),
            Reply::Data(upid) => self.wait_task(&upid, "delete VM").await,
        }
    }

    async fn get(&self, kind: &str, id: &str) -> Result<Option<ProvisionedResource>> {
        ensure_kind(kind)?;
        if id.starts_with("dry-run-") {
            return Ok(None);
        }
        self.observe(id).await
    }

    fn supports_kind(&self, kind: &str) -> bool {
        kind == VIRTUAL_MACHINE
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

fn ensure_kind(kind: &str) -> Result<()> {
    if kind == VIRTUAL_MACHINE {
        Ok(())
    } else {
        Err(Error::permanent(
            PROVIDER,
            format!("unsupported resource kind `{}`", kind),
        ))
    }
}

/// Whether an error response means the addressed VM does not exist
///
/// Proxmox answers 500 with "does not exist" for unknown VMIDs.
fn is_missing(status: u16, body: &str) -> bool {
    status == 404 || (status == 500 && body.contains("does not exist"))
}

/// Map an HTTP error status to a transient or permanent provider error
fn classify(status: u16, body: &str, context: &str) -> Error {
    match status {
        401 | 403 => Error::permanent(
            PROVIDER,
            format!(
                "{}: authentication failed: invalid API token or insufficient permissions. Status: {}",
                context, status
            ),
        ),
        429 => Error::transient(
            PROVIDER,
            format!("{}: rate limit exceeded. Status: {}", context, status),
        ),
        500..=599 => Error::transient(
            PROVIDER,
            format!("{}: server error (transient): {} - {}", context, status, body),
        ),
        _ => Error::permanent(
            PROVIDER,
            format!("{}: request rejected: {} - {}", context, status, body),
        ),
    }
}

/// VMIDs come back as numbers or strings depending on the endpoint
fn vmid_of(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Render an attribute as a Proxmox config value
///
/// Lists become comma-separated values, maps become `key=value` property
/// strings (e.g. `net0`).
fn config_value(value: &AttrValue) -> String {
    match value {
        AttrValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        AttrValue::Number(n) => n.to_string(),
        AttrValue::String(s) => s.clone(),
        AttrValue::List(items) => items
            .iter()
            .map(config_value)
            .collect::<Vec<_>>()
            .join(","),
        AttrValue::Map(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, config_value(v)))
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn config_form(attributes: &Attributes) -> Vec<(String, String)> {
    attributes
        .iter()
        .map(|(name, value)| (name.clone(), config_value(value)))
        .collect()
}

fn update_form(changes: &[AttributeChange]) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = changes
        .iter()
        .filter_map(|c| c.new.as_ref().map(|v| (c.name.clone(), config_value(v))))
        .collect();
    let removed: Vec<&str> = changes
        .iter()
        .filter(|c| c.new.is_none())
        .map(|c| c.name.as_str())
        .collect();
    if !removed.is_empty() {
        form.push(("delete".to_string(), removed.join(",")));
    }
    form
}

fn observed_config(config: &Value) -> Attributes {
    config
        .as_object()
        .into_iter()
        .flatten()
        .filter(|(key, _)| !IGNORED_CONFIG_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| {
            AttrValue::from_json(value.clone(), key)
                .ok()
                .map(|v| (key.clone(), v))
        })
        .collect()
}

/// First non-loopback IPv4 address in a `network-get-interfaces` reply
fn first_ipv4(data: &Value) -> Option<String> {
    data["result"]
        .as_array()?
        .iter()
        .flat_map(|iface| iface["ip-addresses"].as_array().into_iter().flatten())
        .filter(|addr| addr["ip-address-type"].as_str() == Some("ipv4"))
        .filter_map(|addr| addr["ip-address"].as_str())
        .find(|ip| !ip.starts_with("127."))
        .map(str::to_string)
}

/// Factory for creating Proxmox providers
pub struct ProxmoxProviderFactory;

impl ProviderFactory for ProxmoxProviderFactory {
    fn create(&self, config: &ProviderConfig) -> Result<Box<dyn Provider>> {
        match config {
            ProviderConfig::Proxmox {
                endpoint,
                token_id,
                token_secret,
                node,
                insecure_tls,
                dry_run,
            } => {
                config.validate()?;

                // CONVERGE_MODE=dry-run forces dry-run regardless of the config file
                let dry_run = *dry_run
                    || std::env::var("CONVERGE_MODE")
                        .unwrap_or_default()
                        .eq_ignore_ascii_case("dry-run");

                if dry_run {
                    tracing::warn!("Proxmox provider running in DRY-RUN mode - no changes will be made");
                }

                Ok(Box::new(ProxmoxProvider::new(
                    endpoint,
                    token_id.clone(),
                    token_secret.clone(),
                    node.clone(),
                    *insecure_tls,
                    dry_run,
                )?))
            }
            _ => Err(Error::config("Invalid config for Proxmox provider")),
        }
    }
}

/// Register the Proxmox provider with a registry
///
/// # Example
///
/// ```rust
/// use converge_core::Registry;
///
/// let registry = Registry::with_builtin_stores();
/// converge_provider_proxmox::register(&registry);
/// assert!(registry.has_provider("proxmox"));
/// ```
pub fn register(registry: &Registry) {
    registry.register_provider(PROVIDER, Box::new(ProxmoxProviderFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxmox_config(secret: &str) -> ProviderConfig {
        ProviderConfig::Proxmox {
            endpoint: "https://pve.example.com:8006".to_string(),
            token_id: "root@pam!converge".to_string(),
            token_secret: secret.to_string(),
            node: "pve1".to_string(),
            insecure_tls: false,
            dry_run: true,
        }
    }

    fn dry_run_provider() -> ProxmoxProvider {
        // Unroutable endpoint: any real request would fail
        ProxmoxProvider::new("http://127.0.0.1:9", "root@pam!t", "secret", "pve1", false, true)
            .unwrap()
    }

    #[test]
    fn test_factory_creation() {
        let provider = ProxmoxProviderFactory.create(&proxmox_config("s3cret"));
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().provider_name(), "proxmox");
    }

    #[test]
    fn test_factory_missing_secret() {
        assert!(ProxmoxProviderFactory.create(&proxmox_config("")).is_err());
    }

    #[test]
    fn test_factory_rejects_other_config() {
        let config = ProviderConfig::Custom {
            factory: "proxmox".to_string(),
            config: serde_json::json!({}),
        };
        assert!(ProxmoxProviderFactory.create(&config).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let result = ProxmoxProvider::new("https://pve:8006", "root@pam!t", "", "pve1", false, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_register() {
        let registry = Registry::with_builtin_stores();
        register(&registry);
        assert!(registry.has_provider("proxmox"));
        assert!(registry.create_provider(&proxmox_config("s3cret")).is_ok());
    }

    #[test]
    fn test_token_secret_not_exposed_in_debug() {
        let provider =
            ProxmoxProvider::new("https://pve:8006/", "root@pam!t", "secret_token_12345", "pve1", false, false)
                .unwrap();

        let debug_str = format!("{:?}", provider);
        assert!(!debug_str.contains("secret_token_12345"));
        assert!(debug_str.contains("ProxmoxProvider"));
        assert!(debug_str.contains("https://pve:8006/api2/json"));
    }

    #[test]
    fn test_status_classification() {
        let transient = |status| matches!(classify(status, "", "x"), Error::Provider { transient: true, .. });

        assert!(transient(429));
        assert!(transient(500));
        assert!(transient(503));
        assert!(!transient(400));
        assert!(!transient(401));
        assert!(!transient(403));
    }

    #[test]
    fn test_missing_vm_detection() {
        assert!(is_missing(404, ""));
        assert!(is_missing(500, "Configuration file 'nodes/pve1/qemu-server/123.conf' does not exist"));
        assert!(!is_missing(500, "can't lock file - got timeout"));
        assert!(!is_missing(400, "does not exist"));
    }

    #[test]
    fn test_supports_kind() {
        let provider = dry_run_provider();
        assert!(provider.supports_kind("virtual_machine"));
        assert!(!provider.supports_kind("dns_record"));
    }

    #[test]
    fn test_config_values() {
        let net: Attributes = [
            ("bridge".to_string(), AttrValue::from("vmbr0")),
            ("model".to_string(), AttrValue::from("virtio")),
        ]
        .into_iter()
        .collect();

        assert_eq!(config_value(&AttrValue::from(true)), "1");
        assert_eq!(config_value(&AttrValue::from(4096_i64)), "4096");
        assert_eq!(config_value(&AttrValue::Map(net)), "bridge=vmbr0,model=virtio");
        assert_eq!(
            config_value(&AttrValue::List(vec![AttrValue::from("web"), AttrValue::from("prod")])),
            "web,prod"
        );
    }

    #[test]
    fn test_update_form_deletes_removed_attributes() {
        let changes = vec![
            AttributeChange {
                name: "memory".to_string(),
                old: Some(AttrValue::from(2048_i64)),
                new: Some(AttrValue::from(4096_i64)),
            },
            AttributeChange {
                name: "description".to_string(),
                old: Some(AttrValue::from("old")),
                new: None,
            },
            AttributeChange {
                name: "tags".to_string(),
                old: Some(AttrValue::from("a")),
                new: None,
            },
        ];

        assert_eq!(
            update_form(&changes),
            vec![
                ("memory".to_string(), "4096".to_string()),
                ("delete".to_string(), "description,tags".to_string()),
            ]
        );
    }

    #[test]
    fn test_first_ipv4_skips_loopback() {
        let reply = serde_json::json!({
            "result": [
                { "name": "lo", "ip-addresses": [
                    { "ip-address-type": "ipv4", "ip-address": "127.0.0.1" }
                ]},
                { "name": "eth0", "ip-addresses": [
                    { "ip-address-type": "ipv6", "ip-address": "fe80::1" },
                    { "ip-address-type": "ipv4", "ip-address": "10.0.0.12" }
                ]}
            ]
        });
        assert_eq!(first_ipv4(&reply).as_deref(), Some("10.0.0.12"));
        assert_eq!(first_ipv4(&serde_json::json!({ "result": [] })), None);
    }

    #[test]
    fn test_observed_config_drops_digest() {
        let config = serde_json::json!({ "cores": 2, "name": "web", "digest": "abc", "agent": null });
        let attributes = observed_config(&config);
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["cores"].as_i64(), Some(2));
        assert!(!attributes.contains_key("digest"));
    }

    #[test]
    fn test_vmid_parsing() {
        assert_eq!(vmid_of(&serde_json::json!(101)).as_deref(), Some("101"));
        assert_eq!(vmid_of(&serde_json::json!("102")).as_deref(), Some("102"));
        assert_eq!(vmid_of(&serde_json::json!(null)), None);
    }

    #[tokio::test]
    async fn test_dry_run_mutations_make_no_requests() {
        let provider = dry_run_provider();
        assert!(provider.is_dry_run());

        provider.destroy("virtual_machine", "123").await.unwrap();

        let changes = vec![AttributeChange {
            name: "cores".to_string(),
            old: Some(AttrValue::from(2_i64)),
            new: Some(AttrValue::from(4_i64)),
        }];
        let updated = provider.update("virtual_machine", "123", &changes).await.unwrap();
        assert_eq!(updated.id, "123");
        assert_eq!(updated.attributes["cores"].as_i64(), Some(4));

        let gone = provider.get("virtual_machine", "dry-run-web").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_permanent() {
        let provider = dry_run_provider();
        let err = provider.destroy("dns_record", "1").await.unwrap_err();
        assert!(matches!(err, Error::Provider { transient: false, .. }));
    }
}
