//! `apicall`: boots the dispatch engine in-process (`start`), or talks to
//! a running instance's REST surface for management commands.

use std::process::ExitCode;
use std::sync::Arc;

use apicall_dispatch_engine::config::ApicallConfig;
use apicall_dispatch_engine::engine::Engine;
use apicall_dispatch_engine::models::{Project, Trunk};
use apicall_switch_core::TcpConnector;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::Tabled;
use tracing::error;

#[derive(Parser)]
#[command(name = "apicall")]
#[command(about = "Outbound IVR call dispatch engine")]
#[command(version)]
struct Cli {
    /// Base URL of a running instance's REST API, for every subcommand
    /// except `start`.
    #[arg(long, default_value = "http://127.0.0.1:8088", global = true)]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the engine in-process: connect to the database and switch,
    /// spawn the sweeper/reaper/event handler, and serve the REST API.
    Start,
    /// Manage projects.
    Proyecto {
        #[command(subcommand)]
        action: ProyectoAction,
    },
    /// Manage trunks.
    Troncal {
        #[command(subcommand)]
        action: TroncalAction,
    },
    /// Print a running instance's pool/tracker snapshot.
    Status,
}

#[derive(Subcommand)]
enum ProyectoAction {
    Add {
        name: String,
        #[arg(long)]
        caller_id: String,
        #[arg(long)]
        prompt_audio: String,
        #[arg(long, default_value_t = 0)]
        prompt_duration_secs: i64,
        #[arg(long, default_value = "1")]
        expected_digit: char,
        #[arg(long)]
        transfer_destination: String,
    },
    List,
    Delete {
        id: i64,
    },
}

#[derive(Subcommand)]
enum TroncalAction {
    Add {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 5060)]
        port: u16,
        #[arg(long, default_value_t = 30)]
        max_channels: u32,
    },
    List,
    Delete {
        id: i64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "apicall=info".to_string()))
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Start => run_start(),
        other => run_client_command(&cli.api_url, other),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run_start() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_start())
}

async fn async_start() -> anyhow::Result<()> {
    let config = ApicallConfig::load()?;
    let connector = Arc::new(TcpConnector {
        host: config.switch.host.clone(),
        port: config.switch.port,
        username: config.switch.username.clone(),
        secret: config.switch.secret.clone(),
    });

    let mut engine = Engine::new(config, connector).await?;
    engine.start().await?;
    println!("{}", "apicall is running, press Ctrl+C to stop".green());
    engine.run_until_signal().await?;
    Ok(())
}

fn run_client_command(api_url: &str, command: &Commands) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_client_command(api_url, command))
}

async fn async_client_command(api_url: &str, command: &Commands) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    match command {
        Commands::Start => unreachable!("handled separately"),
        Commands::Proyecto { action } => proyecto_command(&client, api_url, action).await,
        Commands::Troncal { action } => troncal_command(&client, api_url, action).await,
        Commands::Status => status_command(&client, api_url).await,
    }
}

#[derive(Tabled)]
struct ProjectRow {
    id: i64,
    name: String,
    caller_id: String,
    expected_digit: char,
}

async fn proyecto_command(client: &reqwest::Client, api_url: &str, action: &ProyectoAction) -> anyhow::Result<()> {
    match action {
        ProyectoAction::Add {
            name,
            caller_id,
            prompt_audio,
            prompt_duration_secs,
            expected_digit,
            transfer_destination,
        } => {
            let project = Project {
                id: 0,
                name: name.clone(),
                caller_id: caller_id.clone(),
                prompt_audio: prompt_audio.clone(),
                prompt_duration_secs: *prompt_duration_secs,
                expected_digit: *expected_digit,
                transfer_destination: transfer_destination.clone(),
                preferred_trunk: None,
                dial_prefix: String::new(),
                authorized_ips: Vec::new(),
                max_retries: 3,
                retry_backoff_secs: 60,
                amd_enabled: false,
                smart_cid_enabled: false,
            };
            let id: i64 = client
                .post(format!("{api_url}/api/v1/proyectos"))
                .json(&project)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{} project {id}", "created".green());
        }
        ProyectoAction::List => {
            let projects: Vec<Project> = client
                .get(format!("{api_url}/api/v1/proyectos"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let rows: Vec<ProjectRow> = projects
                .into_iter()
                .map(|p| ProjectRow {
                    id: p.id,
                    name: p.name,
                    caller_id: p.caller_id,
                    expected_digit: p.expected_digit,
                })
                .collect();
            println!("{}", tabled::Table::new(rows));
        }
        ProyectoAction::Delete { id } => {
            client
                .delete(format!("{api_url}/api/v1/proyectos/{id}"))
                .send()
                .await?
                .error_for_status()?;
            println!("{} project {id}", "deleted".yellow());
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct TrunkRow {
    id: i64,
    name: String,
    host: String,
    active: bool,
    max_channels: u32,
}

async fn troncal_command(client: &reqwest::Client, api_url: &str, action: &TroncalAction) -> anyhow::Result<()> {
    match action {
        TroncalAction::Add {
            name,
            host,
            port,
            max_channels,
        } => {
            let trunk = Trunk {
                id: 0,
                name: name.clone(),
                host: host.clone(),
                port: *port,
                username: String::new(),
                secret: String::new(),
                context: "apicall-ivr".to_string(),
                caller_id_override: None,
                active: true,
                max_channels: *max_channels,
            };
            let id: i64 = client
                .post(format!("{api_url}/api/v1/troncales"))
                .json(&trunk)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{} trunk {id}", "created".green());
        }
        TroncalAction::List => {
            let trunks: Vec<Trunk> = client
                .get(format!("{api_url}/api/v1/troncales"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let rows: Vec<TrunkRow> = trunks
                .into_iter()
                .map(|t| TrunkRow {
                    id: t.id,
                    name: t.name,
                    host: t.host,
                    active: t.active,
                    max_channels: t.max_channels,
                })
                .collect();
            println!("{}", tabled::Table::new(rows));
        }
        TroncalAction::Delete { id } => {
            client
                .delete(format!("{api_url}/api/v1/troncales/{id}"))
                .send()
                .await?
                .error_for_status()?;
            println!("{} trunk {id}", "deleted".yellow());
        }
    }
    Ok(())
}

async fn status_command(client: &reqwest::Client, api_url: &str) -> anyhow::Result<()> {
    let stats: serde_json::Value = client
        .get(format!("{api_url}/api/v1/stats"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
