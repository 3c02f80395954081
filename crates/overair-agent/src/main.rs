//! Host binary for the overair update agent.
//!
//! `run` resumes any persisted workflow, optionally feeds a deployment
//! document, and drives the pipeline until the device is idle or a reboot
//! is requested. `check` validates the configuration and trust store and
//! exits. Exit code is 0 on clean shutdown, non-zero on fatal init
//! failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use overair::config::AgentConfig;
use overair::facade::Agent;
use overair::handler::{HandlerContract, HandlerRegistration, HandlerRegistry, UpdateHandler};
use overair::plugin::{DeltaDownloadPlugin, PassthroughProcessor, PluginRegistry};
use overair::report::{JsonlReporter, ReportLog};
use overair::simulator::{SIMULATOR_UPDATE_TYPE, SimulatorHandler};
use overair::types::UpdateType;
use overair::workflow::WorkflowEngine;
use overair_cache::SourceCache;
use overair_trust::TrustStore;

const DEFAULT_CONFIG_PATH: &str = "/etc/adu/du-config.json";

#[derive(Parser)]
#[command(name = "overair-agent", about = "On-device update agent", version)]
struct Cli {
    /// Path to the agent configuration document.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resume persisted work, optionally process one deployment, and run
    /// until idle.
    Run {
        /// Deployment document to feed into the pipeline.
        #[arg(long)]
        deployment: Option<PathBuf>,
        /// Seconds between retry ticks.
        #[arg(long, default_value_t = 1)]
        tick_interval_secs: u64,
    },
    /// Validate configuration and trust store, then exit.
    Check,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run {
            deployment,
            tick_interval_secs,
        } => run(config, deployment.as_deref(), tick_interval_secs),
        Command::Check => check(config),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<AgentConfig> {
    match explicit {
        Some(path) => {
            AgentConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                AgentConfig::load(default)
                    .with_context(|| format!("loading {}", default.display()))
            } else {
                info!("no configuration at {DEFAULT_CONFIG_PATH}; using defaults");
                Ok(AgentConfig::default())
            }
        }
    }
}

fn load_trust(config: &AgentConfig) -> Result<TrustStore> {
    match TrustStore::load(&config.root_key_file) {
        Ok(store) => Ok(store),
        #[cfg(feature = "test-roots")]
        Err(e) => {
            warn!(
                "trust store unusable at {} ({e}); falling back to built-in test roots",
                config.root_key_file.display()
            );
            Ok(TrustStore::with_package(
                &config.root_key_file,
                overair_trust::test_roots::builtin_package(),
            ))
        }
        #[cfg(not(feature = "test-roots"))]
        Err(e) => Err(anyhow::anyhow!(
            "trust store unusable at {}: {e}",
            config.root_key_file.display()
        )),
    }
}

fn build_agent(config: AgentConfig, trust: TrustStore) -> Result<Agent> {
    let registry = Arc::new(HandlerRegistry::new(&config.extensions_dir));
    let simulator_type = UpdateType::new(SIMULATOR_UPDATE_TYPE);
    registry
        .register(
            &simulator_type,
            HandlerRegistration {
                lib_path: PathBuf::from("builtin:simulator"),
                contract: HandlerContract::V1,
            },
        )
        .context("registering simulator handler")?;
    registry.register_factory(
        &simulator_type,
        Box::new(|| Arc::new(SimulatorHandler::new()) as Arc<dyn UpdateHandler>),
    );

    let cache = SourceCache::new(&config.cache_dir);
    if let Err(e) = cache.evict_until_under(config.cache_size_cap_bytes) {
        warn!("source cache maintenance failed: {e}");
    }
    let mut plugins = PluginRegistry::new();
    plugins.register(
        "overair/delta:1",
        Arc::new(DeltaDownloadPlugin::new(cache, Box::new(PassthroughProcessor))),
    );

    let reporter = JsonlReporter::new(ReportLog::in_dir(&config.log_dir));
    let engine = WorkflowEngine::new(
        config,
        registry,
        Arc::new(plugins),
        Box::new(reporter),
    )
    .context("building workflow engine")?;

    Agent::start(engine, trust).context("starting agent")
}

fn run(config: AgentConfig, deployment: Option<&Path>, tick_interval_secs: u64) -> Result<()> {
    let trust = load_trust(&config)?;
    let agent = build_agent(config, trust)?;

    if let Some(path) = deployment {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("reading deployment document {}", path.display()))?;
        agent
            .on_desired_properties_changed(&document)
            .context("accepting deployment document")?;
        info!("deployment document enqueued");
    }

    let tick = Duration::from_secs(tick_interval_secs.max(1));
    loop {
        std::thread::sleep(tick);
        agent.tick().ok();

        if agent.reboot_requested() {
            info!("reboot requested by the active deployment; exiting for the host to reboot");
            break;
        }
        if agent.restart_requested() {
            info!("agent restart requested; exiting");
            break;
        }
        if agent.is_idle() {
            info!("pipeline idle; shutting down");
            break;
        }
    }

    agent.join();
    Ok(())
}

fn check(config: AgentConfig) -> Result<()> {
    let trust = load_trust(&config)?;
    println!(
        "configuration ok; trust store version {} with {} root key(s)",
        trust.current().protected.version,
        trust.current().protected.root_keys.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_config_is_fatal() {
        let td = tempfile::tempdir().expect("tempdir");
        assert!(load_config(Some(&td.path().join("absent.json"))).is_err());
    }

    #[test]
    fn absent_default_config_falls_back_to_defaults() {
        // The default path will not exist in the test environment.
        let config = load_config(None).expect("defaults");
        assert_eq!(config.max_verification_retries, 3);
    }

    #[test]
    fn missing_trust_store_is_fatal_without_test_roots() {
        let td = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::rebased_under(td.path());
        let result = load_trust(&config);
        #[cfg(feature = "test-roots")]
        assert!(result.is_ok());
        #[cfg(not(feature = "test-roots"))]
        assert!(result.is_err());
    }
}
