//! Tandem - multi-agent task orchestration runtime
//!
//! Thin front-ends over the core Manager:
//! - `tandem serve` - HTTP/WebSocket façade
//! - `tandem ask` - one-shot task from the terminal
//! - `tandem agents` - list the registered agent roster

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tandem_core::storage::SqliteStore;
use tandem_core::{EventBus, Manager, RuntimeConfig, Settings};

mod ask;

/// Tandem - multi-agent task orchestration runtime
#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Drive LLM task loops with tools, sub-agents, and an event bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },

    /// Run a single task to completion and print the result
    Ask {
        /// The user input to hand to the agent
        text: String,

        /// Agent uuid to drive (see `tandem agents`)
        #[arg(long, default_value = "basic")]
        agent: String,

        /// Working directory for the task (defaults to the current dir)
        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// List registered agents
    Agents,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tandem")
}

async fn boot_manager() -> Result<Arc<Manager>> {
    let cfg = Arc::new(RuntimeConfig::from_env());
    let settings = Settings::load_default()?;
    let store = Arc::new(SqliteStore::open(&data_dir().join("tandem.db"))?);
    let bus = Arc::new(EventBus::new());
    Manager::boot(store, bus, cfg, settings).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_filter = if RuntimeConfig::from_env().debug_mode {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let manager = boot_manager().await?;
            let config = tandem_server::ServerConfig {
                port,
                ..Default::default()
            };
            tandem_server::start_server(manager, config).await?;
        }
        Commands::Ask {
            text,
            agent,
            workdir,
        } => {
            let manager = boot_manager().await?;
            let workdir = match workdir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            ask::run(manager, &text, &agent, &workdir).await?;
        }
        Commands::Agents => {
            let manager = boot_manager().await?;
            for agent in manager.store().find_agents()? {
                println!("{:<12} {}", agent.uuid, agent.role);
            }
        }
    }

    Ok(())
}
