//! cdrlink-agent entry point: CLI argument parsing, configuration loading, signal handling, and
//! sequencing the [`Agent`]'s start/stop lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use cdrlink_agent::{config::AgentConfig, core::Agent, utils::setup_logging, Result};

#[derive(Parser)]
#[command(name = "cdrlink-agent")]
#[command(about = "Asterisk CDR/CEL aggregation and recording shipping agent")]
#[command(version = cdrlink_agent::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent (default when no subcommand is given)
    Start,
    /// Stop a running agent
    Stop,
    /// Check agent status
    Status,
    /// Validate configuration and exit
    ValidateConfig,
    /// Print the default configuration as TOML
    GenerateConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {}", e);
            eprintln!();
            eprintln!("cdrlink-agent requires at minimum:");
            eprintln!("  - api.key (CDRLINK_API__KEY)");
            eprintln!("  - api.base_url (CDRLINK_API__BASE_URL)");
            eprintln!("  - database.host / database.name (CDRLINK_DATABASE__HOST / __NAME)");
            eprintln!("  - cel_source.mode (CDRLINK_CEL_SOURCE__MODE = db | csv | ami)");
            std::process::exit(1);
        }
    };

    if let Some(level) = &cli.log_level {
        let mut logging = config.logging.clone();
        logging.level = level.clone();
        setup_logging(&logging)?;
    } else {
        setup_logging(&config.logging)?;
    }

    info!("starting {} v{}", cdrlink_agent::NAME, cdrlink_agent::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => run_agent(config).await,
        Some(Commands::Stop) => stop_agent().await,
        Some(Commands::Status) => show_status().await,
        Some(Commands::ValidateConfig) => validate_configuration(&config).await,
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()).await,
    }
}

fn load_configuration(cli: &Cli) -> Result<AgentConfig> {
    let config = AgentConfig::load(cli.config.as_deref())?;
    config.validate()?;
    Ok(config)
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    info!("initializing cdrlink agent");

    let mut agent = Agent::new(config)?;
    let mut event_rx = agent
        .take_event_receiver()
        .ok_or_else(|| cdrlink_agent::Error::internal("failed to get agent event receiver"))?;

    // A database outage or invalid CEL mode surfaces here as a fatal startup error (§6 exit
    // code 1); everything after this point is a long-running background task.
    if let Err(e) = agent.start().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }

    let agent = Arc::new(tokio::sync::Mutex::new(agent));
    let agent_shutdown = Arc::clone(&agent);

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_agent_event(event).await;
        }
    });

    let shutdown_task = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("shutdown signal received, draining and stopping");
                let mut agent = agent_shutdown.lock().await;
                if let Err(e) = agent.stop().await {
                    error!(error = %e, "error during shutdown");
                }
            }
            Err(err) => {
                error!(error = %err, "unable to listen for shutdown signal");
            }
        }
    });

    tokio::select! {
        _ = event_task => {
            info!("event handling task completed");
        }
        _ = shutdown_task => {
            info!("shutdown task completed");
        }
    }

    let mut agent = agent.lock().await;
    if agent.is_running().await {
        agent.stop().await?;
    }

    info!("cdrlink agent shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => Ok(()),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}

async fn handle_agent_event(event: cdrlink_agent::core::gateway::AgentEvent) {
    use cdrlink_agent::core::gateway::AgentEvent;

    match event {
        AgentEvent::Started => info!("agent started successfully"),
        AgentEvent::Stopped => info!("agent stopped"),
        AgentEvent::SubsystemError { subsystem, message } => {
            error!(subsystem = %subsystem, message = %message, "subsystem error");
        }
    }
}

async fn stop_agent() -> Result<()> {
    println!("stop command not implemented (send SIGTERM/SIGINT to the running process)");
    Ok(())
}

async fn show_status() -> Result<()> {
    println!("status command not implemented (no control socket in this build)");
    Ok(())
}

async fn validate_configuration(config: &AgentConfig) -> Result<()> {
    config.validate()?;
    println!("configuration is valid");
    println!("  hostname:        {}", config.hostname());
    println!("  database driver: {:?}", config.database.driver);
    println!("  CEL source:      {:?}", config.cel_source);
    println!("  shipping mode:   {:?}", config.shipping.mode);
    println!("  shipping xport:  {:?}", config.shipping.transport);
    println!("  recording roots: {:?}", config.recording.root_paths);
    println!("  metrics enabled: {}", config.metrics.enabled);
    Ok(())
}

async fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| cdrlink_agent::Error::internal(format!("failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("default configuration written to: {}", path.display());
        }
        None => println!("{}", toml_content),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_config_generation_succeeds() {
        assert!(generate_default_config(None).await.is_ok());
    }

    #[tokio::test]
    async fn validating_a_configured_default_succeeds() {
        let mut config = AgentConfig::default();
        config.api.key = "sk_t1_test".to_string();
        assert!(validate_configuration(&config).await.is_ok());
    }
}
