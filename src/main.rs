use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agentflow_core::config::AppConfig;
use agentflow_core::traits::Catalog;
use agentflow_core::types::{ExecutionStatus, ExecutionTarget};
use agentflow_engine::{Engine, RetentionSweeper};
use agentflow_gateway::{GatewayServer, StreamEvent, SubscriberRegistry};
use agentflow_llm::OpenAiAgent;
use agentflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "agentflow", version, about = "Run agent workflows and stream their progress")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway with an in-process worker pool
    Serve,
    /// Run one agent or workflow to completion, printing its logs
    Run {
        /// Workflow id from the catalog
        #[arg(long, conflicts_with = "agent", required_unless_present = "agent")]
        workflow: Option<String>,
        /// Agent id from the catalog
        #[arg(long)]
        agent: Option<String>,
        /// Input data as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long, default_value = "cli")]
        requester: String,
    },
    /// Show current configuration
    Config,
    /// Delete execution logs older than the retention window
    Cleanup {
        /// Override `retention.max_age_days`
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agentflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "agentflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Serve => serve(config).await?,
        Commands::Run {
            workflow,
            agent,
            input,
            requester,
        } => {
            let target = match (workflow, agent) {
                (Some(id), _) => ExecutionTarget::Workflow(id),
                (None, Some(id)) => ExecutionTarget::Agent(id),
                (None, None) => anyhow::bail!("one of --workflow or --agent is required"),
            };
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;
            run_once(config, target, input, &requester).await?;
        }
        Commands::Cleanup { max_age_days } => {
            let store = open_store(&config).await?;
            let mut retention = config.retention.clone();
            if let Some(days) = max_age_days {
                retention.max_age_days = days;
            }
            let sweeper = RetentionSweeper::new(&retention, store, CancellationToken::new())?;
            let removed = sweeper.sweep_once().await?;
            println!("Removed {} log entries older than {} days", removed, retention.max_age_days);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Open the database and upsert the configured agents and workflows.
async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let db_path = config.database_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );

    for agent in &config.agents {
        store.upsert_agent(agent).await?;
    }
    for workflow in &config.workflows {
        store.upsert_workflow(workflow).await?;
    }
    info!(
        db = %db_path.display(),
        agents = config.agents.len(),
        workflows = config.workflows.len(),
        "Catalog loaded"
    );
    Ok(store)
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let cancel = CancellationToken::new();

    let registry = Arc::new(SubscriberRegistry::new(&config.stream, store.clone()));
    let executor = Arc::new(OpenAiAgent::new(config.model.clone()));
    let engine = Engine::start(
        &config.engine,
        store.clone(),
        store.clone(),
        executor,
        Some(registry.clone()),
        cancel.child_token(),
    );
    engine.recover().await?;

    if config.retention.enabled {
        let sweeper = RetentionSweeper::new(&config.retention, store.clone(), cancel.clone())?;
        tokio::spawn(async move {
            sweeper.run().await;
        });
    }

    // Graceful shutdown on Ctrl-C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    let server = GatewayServer::new(config.gateway.clone(), engine.lifecycle(), registry);
    let served = server.run(cancel.clone()).await;
    cancel.cancel();
    engine.shutdown().await;
    served
}

async fn run_once(
    config: AppConfig,
    target: ExecutionTarget,
    input: serde_json::Value,
    requester: &str,
) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let registry = Arc::new(SubscriberRegistry::new(&config.stream, store.clone()));
    let executor = Arc::new(OpenAiAgent::new(config.model.clone()));
    let engine = Engine::start(
        &config.engine,
        store.clone(),
        store.clone(),
        executor,
        Some(registry.clone()),
        CancellationToken::new(),
    );
    let lifecycle = engine.lifecycle();

    let execution = lifecycle.submit(target, input, requester).await?;
    eprintln!("Execution {}", execution.id);

    // Ctrl-C cancels the execution rather than killing the process
    let cancel_id = execution.id;
    let cancel_lifecycle = lifecycle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        if let Err(e) = cancel_lifecycle.cancel(&cancel_id).await {
            error!(error = %e, "Cancel failed");
        }
    });

    let mut events = registry.subscribe(execution.id);
    let mut status = ExecutionStatus::Pending;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::ExecutionState { data } => {
                if data.status != status {
                    eprintln!("[{}]", data.status);
                    status = data.status;
                }
            }
            StreamEvent::Log { data } => {
                eprintln!(
                    "  #{:<3} {:<10} {}",
                    data.step_number,
                    data.log_type.as_str(),
                    truncate(&data.log_data.to_string(), 120)
                );
            }
            StreamEvent::ExecutionComplete { data } => {
                status = data.status;
                if let Some(output) = &data.output_data {
                    println!("{}", serde_json::to_string_pretty(output)?);
                }
                if let Some(message) = &data.error_message {
                    eprintln!("Error: {}", message);
                }
                eprintln!(
                    "[{}] tokens={} cost=${:.4}",
                    data.status, data.total_tokens, data.total_cost
                );
            }
            StreamEvent::Error { message } => anyhow::bail!(message),
        }
    }

    engine.shutdown().await;
    if status != ExecutionStatus::Success {
        anyhow::bail!("execution finished with status {}", status);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
