//! agentchain CLI, the main entry point.
//!
//! Commands:
//! - `onboard` : write the default config file
//! - `serve`   : scheduler plus HTTP API
//! - `worker`  : scheduler only
//! - `run`     : start one chain and wait for its answer
//! - `agents`  : list registered agents
//! - `chains`  : dump stored chains or the delegation tree

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "agentchain",
    about = "agentchain: multi-agent chain orchestration engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Onboard,

    /// Start the scheduler and the HTTP API
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Start the scheduler without the HTTP API
    Worker,

    /// Create a root chain and print its final answer
    Run {
        /// Agent that owns the root chain
        #[arg(short, long, default_value = "project_manager")]
        agent: String,

        /// The user's request
        message: String,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },

    /// List registered agents and their tools
    Agents,

    /// Print stored chains as JSON
    Chains {
        /// Print the delegation tree instead of the flat list
        #[arg(long)]
        tree: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Worker => commands::worker::run().await?,
        Commands::Run {
            agent,
            message,
            timeout,
        } => commands::run::run(&agent, &message, timeout).await?,
        Commands::Agents => commands::agents::run().await?,
        Commands::Chains { tree } => commands::chains::run(tree).await?,
    }

    Ok(())
}
