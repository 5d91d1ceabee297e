//! cdrlink-diag: standalone checks for everything the agent needs healthy before it will run --
//! configuration, the CDR/CEL database, AMI connectivity, and the local state store -- without
//! starting the Aggregator or Shipper.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use sqlx::any::AnyPoolOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use cdrlink_agent::config::AgentConfig;
use cdrlink_agent::shipper::rate_limit::is_recognized_key;
use cdrlink_agent::store::Store;

#[derive(Parser)]
#[command(name = "cdrlink-diag")]
#[command(about = "Diagnostics for the cdrlink-agent deployment")]
#[command(version = cdrlink_agent::VERSION)]
struct DiagCli {
    #[command(subcommand)]
    command: DiagCommands,

    /// Configuration file path (TOML); same resolution order as cdrlink-agent
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum DiagCommands {
    /// Print the resolved configuration and flag anything validate() would reject
    Config,

    /// Connect to the CDR/CEL database and report round-trip latency
    Db,

    /// Log in to the configured AMI connection and report the banner
    Ami,

    /// Open the local state store and summarize its contents
    Store,

    /// List recordings the Recording Tracker still considers pending
    Recordings,

    /// Run every check above and print a combined pass/fail summary
    Report,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let cli = DiagCli::parse();
    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command {
        DiagCommands::Config => check_config(&config),
        DiagCommands::Db => check_database(&config).await,
        DiagCommands::Ami => check_ami(&config).await,
        DiagCommands::Store => check_store(&config).await,
        DiagCommands::Recordings => check_recordings(&config).await,
        DiagCommands::Report => run_report(&config).await,
    }
}

fn check_config(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "Configuration".bold().blue());
    match config.validate() {
        Ok(()) => println!("  {}", "valid".green()),
        Err(e) => println!("  {} {}", "invalid:".red(), e),
    }
    println!("  hostname:        {}", config.hostname());
    println!("  database driver: {:?}", config.database.driver);
    println!("  database host:   {}:{}", config.database.host, config.database.port);
    println!("  CEL source:      {:?}", config.cel_source);
    println!("  AMI configured:  {}", config.recording_ami_config().is_some());
    println!("  shipping mode:   {:?} / {:?}", config.shipping.mode, config.shipping.transport);
    println!("  API key format:  {}", if is_recognized_key(&config.api.key) { "recognized".green() } else { "opaque (no local rate limit)".yellow() });
    println!("  recording roots: {:?}", config.recording.root_paths);
    println!("  store path:      {}", config.store.primary_path);
    println!("  metrics enabled: {}", config.metrics.enabled);
    Ok(())
}

async fn check_database(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "CDR/CEL database".bold().blue());
    sqlx::any::install_default_drivers();

    let started = std::time::Instant::now();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.dsn())
        .await;

    match pool {
        Ok(pool) => {
            let query = format!("SELECT COUNT(*) FROM {}", config.database.cdr_table);
            match sqlx::query(&query).fetch_one(&pool).await {
                Ok(_) => println!(
                    "  {} connected in {:?}, {} is readable",
                    "PASS".green().bold(),
                    started.elapsed(),
                    config.database.cdr_table
                ),
                Err(e) => println!(
                    "  {} connected but {} query failed: {}",
                    "WARN".yellow().bold(),
                    config.database.cdr_table,
                    e
                ),
            }
        }
        Err(e) => println!("  {} {}", "FAIL".red().bold(), e),
    }
    Ok(())
}

async fn check_ami(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "AMI connection".bold().blue());

    let ami_config = match config.recording_ami_config() {
        Some(c) => c,
        None => {
            println!("  {} no AMI connection configured", "SKIP".dimmed());
            return Ok(());
        }
    };

    let started = std::time::Instant::now();
    match TcpStream::connect((ami_config.host.as_str(), ami_config.port)).await {
        Ok(stream) => {
            let mut reader = BufReader::new(stream);
            let mut banner = String::new();
            reader.read_line(&mut banner).await?;

            let login = format!(
                "Action: Login\r\nUsername: {}\r\nSecret: {}\r\nEvents: off\r\n\r\n",
                ami_config.username, ami_config.secret
            );
            reader.get_mut().write_all(login.as_bytes()).await?;

            let mut response = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await?;
                if n == 0 || line.trim().is_empty() {
                    break;
                }
                response.push_str(&line);
            }

            if response.to_lowercase().contains("success") {
                println!(
                    "  {} logged in to {}:{} in {:?}",
                    "PASS".green().bold(),
                    ami_config.host,
                    ami_config.port,
                    started.elapsed()
                );
            } else {
                println!("  {} login rejected: {}", "FAIL".red().bold(), response.trim());
            }
        }
        Err(e) => println!("  {} {}:{} unreachable: {}", "FAIL".red().bold(), ami_config.host, ami_config.port, e),
    }
    Ok(())
}

async fn check_store(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "Local state store".bold().blue());
    let store = Store::open(&config.store).await;

    let errored = store.calls_with_errors().await?;
    println!("  path:               {}", config.store.primary_path);
    println!("  calls with errors:  {}", if errored.is_empty() { "0".green() } else { errored.len().to_string().yellow() });
    for state in errored.iter().take(5) {
        println!(
            "    {} error_count={} last_error={}",
            state.linkedid.dimmed(),
            state.error_count,
            state.last_error.as_deref().unwrap_or("-")
        );
    }
    if errored.len() > 5 {
        println!("    ... and {} more", errored.len() - 5);
    }
    Ok(())
}

async fn check_recordings(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "Pending recordings".bold().blue());
    let store = Store::open(&config.store).await;
    let pending = store.pending_recordings().await?;
    let eligible = store.upload_eligible_recordings(chrono::Utc::now()).await?;

    println!("  awaiting stability/upload: {}", pending.len());
    println!("  upload-eligible now:       {}", eligible.len());
    for r in pending.iter().take(10) {
        println!(
            "    {} linkedid={} size={} stable_count={}",
            r.filename.cyan(),
            r.linkedid.as_deref().unwrap_or("-"),
            r.file_size,
            r.size_stable_count
        );
    }
    Ok(())
}

async fn run_report(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "cdrlink-diag report".bold().underline());
    println!();
    check_config(config)?;
    println!();
    check_database(config).await?;
    println!();
    check_ami(config).await?;
    println!();
    check_store(config).await?;
    println!();
    check_recordings(config).await?;
    Ok(())
}
