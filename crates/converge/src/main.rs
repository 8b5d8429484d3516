// # converge - Declarative Infrastructure Reconciler
//
// This binary is a THIN integration layer:
// - No diffing, ordering, or retry logic here (all of it lives in converge-core)
// - It reads configuration, registers providers, and prints results
//
// The converge binary is responsible for:
// 1. Reading configuration from flags / environment variables
// 2. Initializing logging and the runtime
// 3. Registering providers and state stores
// 4. Running plan / apply and reporting the outcome as an exit code
//
// ## Configuration
//
// Every flag can be set through its environment variable:
//
// ### Provider
// - `CONVERGE_PROVIDER_TYPE`: Provider type (proxmox)
// - `CONVERGE_PROXMOX_ENDPOINT`: API endpoint, e.g. https://pve:8006
// - `CONVERGE_PROXMOX_TOKEN_ID`: API token id (user@realm!name)
// - `CONVERGE_PROXMOX_TOKEN_SECRET`: API token secret
// - `CONVERGE_PROXMOX_NODE`: Node hosting the VMs
// - `CONVERGE_PROXMOX_INSECURE_TLS`: Accept self-signed certificates
// - `CONVERGE_DRY_RUN`: Log mutations instead of performing them
//
// ### State Store
// - `CONVERGE_STATE_STORE_TYPE`: Type of state store (file, memory)
// - `CONVERGE_STATE_PATH`: Path to the state file (for file store)
//
// ### Executor
// - `CONVERGE_MAX_CONCURRENCY`: Operations in flight at once
// - `CONVERGE_MAX_ATTEMPTS`: Attempts per provider call
// - `CONVERGE_REFRESH`: Refresh records from the provider before planning
//
// ### Other
// - `CONVERGE_CONFIG`: JSON configuration file (replaces the flags above)
// - `CONVERGE_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export CONVERGE_PROXMOX_ENDPOINT=https://pve.example.com:8006
// export CONVERGE_PROXMOX_TOKEN_ID='automation@pve!converge'
// export CONVERGE_PROXMOX_TOKEN_SECRET=...
// export CONVERGE_PROXMOX_NODE=pve1
// export CONVERGE_STATE_PATH=/var/lib/converge/state.json
//
// converge plan lab.json
// converge apply lab.json
// converge output lab.json
// ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use converge_core::output;
use converge_core::{
    AttrValue, ConvergeConfig, DesiredState, Provider, ProviderConfig, Reconciler, Registry,
    RunEvent, StateStore, StateStoreConfig,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different outcomes
///
/// - 0: Converged (or read-only command succeeded)
/// - 1: Configuration, validation or state error; nothing was changed
/// - 2: Partial apply or runtime error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvergeExitCode {
    /// Every operation committed
    Converged = 0,
    /// Configuration, validation or state error
    ConfigError = 1,
    /// Partial apply or unexpected failure
    RuntimeError = 2,
}

impl From<ConvergeExitCode> for ExitCode {
    fn from(code: ConvergeExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Declarative infrastructure reconciler
#[derive(Parser)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON configuration file; replaces the provider, state and executor flags
    #[arg(long, env = "CONVERGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Provider type
    #[arg(long, env = "CONVERGE_PROVIDER_TYPE", default_value = "proxmox", global = true)]
    provider: String,

    /// Proxmox API endpoint
    #[arg(long, env = "CONVERGE_PROXMOX_ENDPOINT", global = true)]
    proxmox_endpoint: Option<String>,

    /// Proxmox API token id
    #[arg(long, env = "CONVERGE_PROXMOX_TOKEN_ID", global = true)]
    proxmox_token_id: Option<String>,

    /// Proxmox API token secret
    #[arg(long, env = "CONVERGE_PROXMOX_TOKEN_SECRET", hide_env_values = true, global = true)]
    proxmox_token_secret: Option<String>,

    /// Proxmox node hosting the VMs
    #[arg(long, env = "CONVERGE_PROXMOX_NODE", global = true)]
    proxmox_node: Option<String>,

    /// Accept self-signed certificates
    #[arg(long, env = "CONVERGE_PROXMOX_INSECURE_TLS", global = true)]
    proxmox_insecure_tls: bool,

    /// Log mutations instead of performing them
    #[arg(long, env = "CONVERGE_DRY_RUN", global = true)]
    dry_run: bool,

    /// State store type
    #[arg(long, env = "CONVERGE_STATE_STORE_TYPE", value_enum, default_value_t = StoreKind::File, global = true)]
    state_store: StoreKind,

    /// Path to the state file
    #[arg(long, env = "CONVERGE_STATE_PATH", default_value = "converge.state.json", global = true)]
    state_path: PathBuf,

    /// Operations in flight at once
    #[arg(long, env = "CONVERGE_MAX_CONCURRENCY", global = true)]
    max_concurrency: Option<usize>,

    /// Attempts per provider call
    #[arg(long, env = "CONVERGE_MAX_ATTEMPTS", global = true)]
    max_attempts: Option<u32>,

    /// Refresh records from the provider before planning
    #[arg(long, env = "CONVERGE_REFRESH", global = true)]
    refresh: bool,

    /// Log level
    #[arg(long, env = "CONVERGE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    File,
    Memory,
}

#[derive(Subcommand)]
enum Command {
    /// Show the operations an apply would perform
    Plan {
        /// Desired-state document (JSON)
        desired: PathBuf,
    },

    /// Reconcile the infrastructure with the desired state
    Apply {
        /// Desired-state document (JSON)
        desired: PathBuf,
    },

    /// Print the outputs recorded in the state
    Output {
        /// Desired-state document (JSON)
        desired: PathBuf,
    },

    /// Inspect the state store
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Subcommand)]
enum StateCommand {
    /// List managed resources
    List,
}

impl Command {
    /// Only plan and apply talk to the provider
    fn needs_provider(&self) -> bool {
        matches!(self, Command::Plan { .. } | Command::Apply { .. })
    }
}

/// Configuration a subcommand runs with
#[derive(Debug)]
enum Setup {
    /// Plan and apply: provider, state store and executor
    Reconcile(ConvergeConfig),
    /// Output and state commands: the state store alone
    StateOnly(StateStoreConfig),
}

impl Setup {
    fn validate(&self) -> converge_core::Result<()> {
        match self {
            Setup::Reconcile(config) => config.validate(),
            Setup::StateOnly(state_store) => state_store.validate(),
        }
    }

    fn state_store(&self) -> &StateStoreConfig {
        match self {
            Setup::Reconcile(config) => &config.state_store,
            Setup::StateOnly(state_store) => state_store,
        }
    }
}

impl Cli {
    /// Configuration for the selected subcommand
    fn setup(&self) -> Result<Setup> {
        if self.command.needs_provider() {
            self.to_config().map(Setup::Reconcile)
        } else {
            self.state_store_config().map(Setup::StateOnly)
        }
    }

    fn read_config_file(path: &Path) -> Result<ConvergeConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid configuration file {}", path.display()))
    }

    fn state_store_config(&self) -> Result<StateStoreConfig> {
        if let Some(ref path) = self.config {
            return Ok(Self::read_config_file(path)?.state_store);
        }
        Ok(match self.state_store {
            StoreKind::File => StateStoreConfig::File {
                path: self.state_path.display().to_string(),
            },
            StoreKind::Memory => StateStoreConfig::Memory,
        })
    }

    /// Assemble the reconciler configuration
    fn to_config(&self) -> Result<ConvergeConfig> {
        if let Some(ref path) = self.config {
            return Self::read_config_file(path);
        }

        let provider = match self.provider.as_str() {
            "proxmox" => ProviderConfig::Proxmox {
                endpoint: required(&self.proxmox_endpoint, "CONVERGE_PROXMOX_ENDPOINT")?,
                token_id: required(&self.proxmox_token_id, "CONVERGE_PROXMOX_TOKEN_ID")?,
                token_secret: required(&self.proxmox_token_secret, "CONVERGE_PROXMOX_TOKEN_SECRET")?,
                node: required(&self.proxmox_node, "CONVERGE_PROXMOX_NODE")?,
                insecure_tls: self.proxmox_insecure_tls,
                dry_run: self.dry_run,
            },
            other => ProviderConfig::Custom {
                factory: other.to_string(),
                config: serde_json::json!({}),
            },
        };

        let mut config = ConvergeConfig::new(provider, self.state_store_config()?);
        if let Some(max_concurrency) = self.max_concurrency {
            config.executor.max_concurrency = max_concurrency;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.executor.retry.max_attempts = max_attempts;
        }
        config.executor.refresh = self.refresh;
        Ok(config)
    }
}

fn required(value: &Option<String>, var: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => anyhow::bail!("{} is required. Set it via: export {}=...", var, var),
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "CONVERGE_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

/// Map a failure to an exit code
///
/// Anything detected before a provider mutation is a configuration error.
fn exit_code_for(err: &anyhow::Error) -> ConvergeExitCode {
    use converge_core::Error;

    match err.downcast_ref::<Error>() {
        Some(e) if e.is_planning_error() => ConvergeExitCode::ConfigError,
        Some(Error::StateLocked { .. } | Error::Config(_) | Error::Json(_)) => {
            ConvergeExitCode::ConfigError
        }
        _ => ConvergeExitCode::RuntimeError,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Configuration validation error: {}", e);
            return ConvergeExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ConvergeExitCode::ConfigError.into();
    }

    let setup = match cli.setup() {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ConvergeExitCode::ConfigError.into();
        }
    };

    if let Err(e) = setup.validate() {
        eprintln!("Configuration validation error: {}", e);
        return ConvergeExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ConvergeExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run(cli.command, setup).await {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                exit_code_for(&e)
            }
        }
    });

    code.into()
}

/// Dispatch a subcommand
async fn run(command: Command, setup: Setup) -> Result<ConvergeExitCode> {
    let registry = Registry::with_builtin_stores();

    #[cfg(feature = "proxmox")]
    {
        info!("Registering Proxmox provider");
        converge_provider_proxmox::register(&registry);
    }

    let state_store: Arc<dyn StateStore> =
        Arc::from(registry.create_state_store(setup.state_store()).await?);
    info!("State store: {}", setup.state_store().type_name());

    match (command, &setup) {
        (Command::Plan { desired }, Setup::Reconcile(config)) => {
            let desired = load_desired(&desired).await?;
            let (reconciler, _events) = reconciler(&registry, config, state_store)?;
            let plan = reconciler.plan(&desired).await?;

            for op in plan.operations() {
                println!("{}", op);
                for change in &op.changes {
                    println!(
                        "    {}: {} -> {}",
                        change.name,
                        show(change.old.as_ref()),
                        show(change.new.as_ref())
                    );
                }
            }
            println!("Plan: {}", plan.summary());
            Ok(ConvergeExitCode::Converged)
        }

        (Command::Apply { desired }, Setup::Reconcile(config)) => {
            let desired = load_desired(&desired).await?;
            apply(&registry, config, state_store, &desired).await
        }

        (Command::Output { desired }, _) => {
            let desired = load_desired(&desired).await?;
            let records = state_store.load().await?;
            let outputs = output::from_state(desired.outputs(), &records);
            println!("{}", serde_json::to_string_pretty(&output::to_json(&outputs))?);
            Ok(ConvergeExitCode::Converged)
        }

        (Command::State(StateCommand::List), _) => {
            let records = state_store.load().await?;
            for record in records.values() {
                println!(
                    "{:<24} {:<18} {:<10} {}",
                    record.name,
                    record.kind,
                    record.id,
                    record.last_updated.to_rfc3339()
                );
            }
            info!("{} resource(s) in state", records.len());
            Ok(ConvergeExitCode::Converged)
        }

        (Command::Plan { .. } | Command::Apply { .. }, Setup::StateOnly(_)) => {
            anyhow::bail!("plan and apply need a provider configuration")
        }
    }
}

async fn load_desired(path: &Path) -> Result<DesiredState> {
    let desired = DesiredState::from_file(path).await?;
    info!(
        "Loaded {} declaration(s) from {}",
        desired.len(),
        path.display()
    );
    Ok(desired)
}

fn reconciler(
    registry: &Registry,
    config: &ConvergeConfig,
    state_store: Arc<dyn StateStore>,
) -> Result<(Reconciler, mpsc::Receiver<RunEvent>)> {
    let provider: Arc<dyn Provider> = Arc::from(registry.create_provider(&config.provider)?);
    info!("Provider: {}", provider.provider_name());
    Ok(Reconciler::new(provider, state_store, config)?)
}

/// Run an apply, cancelling new operations on SIGINT / SIGTERM
async fn apply(
    registry: &Registry,
    config: &ConvergeConfig,
    state_store: Arc<dyn StateStore>,
    desired: &DesiredState,
) -> Result<ConvergeExitCode> {
    let (reconciler, events) = reconciler(registry, config, state_store)?;
    let reporter = tokio::spawn(report_events(events));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                warn!(
                    "Received {}: finishing in-flight operations, starting no new ones",
                    signal
                );
                // Receiver gone means the run already ended
                let _ = cancel_tx.send(true);
            }
            Err(e) => error!("Signal handler error: {}", e),
        }
    });

    let result = reconciler.apply_with_cancel(desired, Some(cancel_rx)).await;
    interrupt.abort();

    // Closes the event channel so the reporter drains and exits
    drop(reconciler);
    if let Err(e) = reporter.await {
        warn!("Event reporter ended abnormally: {}", e);
    }

    let summary = result?;
    print!("{}", summary.report);
    println!("{}", serde_json::to_string_pretty(&output::to_json(&summary.outputs))?);

    match summary.report.into_result() {
        Ok(_) => {
            info!("Converged");
            Ok(ConvergeExitCode::Converged)
        }
        Err(e) => {
            error!("{}", e);
            Ok(ConvergeExitCode::RuntimeError)
        }
    }
}

/// Log run events as they arrive
async fn report_events(mut events: mpsc::Receiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::RunStarted {
                operations,
                changes,
            } => info!("Run started: {} operation(s), {} change(s)", operations, changes),
            RunEvent::OperationStarted { resource, kind, .. } => {
                info!("{}: {} started", resource, kind)
            }
            RunEvent::AttemptFailed {
                resource,
                attempt,
                error,
            } => warn!("{}: attempt {} failed: {}", resource, attempt, error),
            RunEvent::OperationCommitted { resource, kind } => {
                info!("{}: {} committed", resource, kind)
            }
            RunEvent::OperationFailed {
                resource,
                kind,
                error,
            } => error!("{}: {} failed: {}", resource, kind, error),
            RunEvent::ResourceSkipped {
                resource,
                blocked_by,
            } => warn!("{}: skipped, blocked by {}", resource, blocked_by),
            RunEvent::RunFinished {
                committed,
                failed,
                skipped,
                pending,
            } => info!(
                "Run finished: {} committed, {} failed, {} skipped, {} pending",
                committed, failed, skipped, pending
            ),
        }
    }
}

fn show(value: Option<&AttrValue>) -> String {
    value.map_or_else(|| "(none)".to_string(), ToString::to_string)
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_proxmox_flags_build_config() {
        let cli = parse(&[
            "converge",
            "--proxmox-endpoint",
            "https://pve:8006",
            "--proxmox-token-id",
            "root@pam!converge",
            "--proxmox-token-secret",
            "s3cret",
            "--proxmox-node",
            "pve1",
            "--max-concurrency",
            "8",
            "plan",
            "lab.json",
        ]);
        let config = cli.to_config().unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.provider.type_name(), "proxmox");
        assert_eq!(config.executor.max_concurrency, 8);
        assert!(matches!(config.state_store, StateStoreConfig::File { .. }));
    }

    #[test]
    fn test_missing_proxmox_endpoint_is_reported() {
        let cli = parse(&["converge", "--proxmox-node", "pve1", "apply", "lab.json"]);
        let err = cli.setup().unwrap_err();
        assert!(err.to_string().contains("CONVERGE_PROXMOX_ENDPOINT"));
    }

    #[test]
    fn test_state_commands_need_no_provider() {
        for args in [
            &["converge", "state", "list"][..],
            &["converge", "--state-path", "/tmp/lab.json", "output", "lab.json"][..],
        ] {
            let setup = parse(args).setup().unwrap();
            assert!(setup.validate().is_ok());
            assert!(
                matches!(setup, Setup::StateOnly(StateStoreConfig::File { .. })),
                "{:?}",
                setup
            );
        }
    }

    #[test]
    fn test_log_level_validation() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let locked = anyhow::Error::new(converge_core::Error::StateLocked {
            holder: "ci".to_string(),
            since: "2026-01-01T00:00:00Z".to_string(),
        });
        assert_eq!(exit_code_for(&locked), ConvergeExitCode::ConfigError);

        let invalid = anyhow::Error::new(converge_core::Error::validation("cycle", ["a", "b"]));
        assert_eq!(exit_code_for(&invalid), ConvergeExitCode::ConfigError);

        let provider = anyhow::Error::new(converge_core::Error::transient("proxmox", "busy"));
        assert_eq!(exit_code_for(&provider), ConvergeExitCode::RuntimeError);
    }

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ConvergeExitCode::Converged as u8, 0);
        assert_eq!(ConvergeExitCode::ConfigError as u8, 1);
        assert_eq!(ConvergeExitCode::RuntimeError as u8, 2);
    }
}
