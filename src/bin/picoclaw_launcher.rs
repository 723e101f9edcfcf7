use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use picoclaw::{config, launcher, logging};

/// PicoClaw launcher - supervises the gateway and hosts the config editor API.
#[derive(Parser, Debug)]
#[command(name = "picoclaw-launcher")]
#[command(version = picoclaw::VERSION)]
#[command(about = "Config editor and gateway supervisor.", long_about = None)]
struct Cli {
    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = launcher::DEFAULT_PORT)]
    port: u16,

    /// Config file path (default: ~/.picoclaw/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init(None);
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    launcher::run_launcher(&cli.host, cli.port, config_path).await
}
