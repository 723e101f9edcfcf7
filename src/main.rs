use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use picoclaw::{agent, config, gateway, logging, migrate};

/// PicoClaw - ultra-lightweight personal AI agent gateway.
#[derive(Parser, Debug)]
#[command(name = "picoclaw")]
#[command(version = picoclaw::VERSION)]
#[command(about = "Bridge chat platforms to an AI agent.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway: connect enabled channels and serve /health
    Gateway {
        /// Config file path (default: ~/.picoclaw/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a single agent turn from the terminal
    Agent {
        /// The message to send to the agent
        #[arg(short, long)]
        message: String,

        /// Config file path (default: ~/.picoclaw/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Migrate config and workspace from another assistant installation
    Migrate {
        /// Print the plan without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Migration source (default: openclaw)
        #[arg(long, default_value = "openclaw")]
        from: String,

        /// Re-copy workspace files only, overwriting the destination
        #[arg(long)]
        refresh: bool,

        /// Overwrite existing destination files without backups
        #[arg(long)]
        force: bool,

        /// Source home directory (default: ~/.openclaw)
        #[arg(long)]
        source_home: Option<PathBuf>,

        /// Target home directory (default: ~/.picoclaw)
        #[arg(long)]
        target_home: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway { config: config_path } => {
            logging::init(Some(&picoclaw::util::picoclaw_home().join("gateway.log")));
            let path = config_path.unwrap_or_else(config::default_config_path);
            let cfg = config::load_config(&path)?;
            gateway::run_gateway(cfg).await
        }
        Commands::Agent {
            message,
            config: config_path,
        } => {
            logging::init(None);
            let path = config_path.unwrap_or_else(config::default_config_path);
            let cfg = config::load_config(&path)?;
            let handler = agent::AgentHandler::new(cfg.agents.defaults.model.clone());
            let reply = handler.run_once(&message).await?;
            println!("{reply}");
            Ok(())
        }
        Commands::Migrate {
            dry_run,
            from,
            refresh,
            force,
            source_home,
            target_home,
        } => {
            logging::init(None);
            let opts = migrate::Options {
                dry_run,
                force,
                refresh,
                source: from,
                source_home,
                target_home,
            };
            let result = migrate::run(&opts)?;
            if !result.errors.is_empty() {
                anyhow::bail!("migration finished with {} errors", result.errors.len());
            }
            Ok(())
        }
    }
}
