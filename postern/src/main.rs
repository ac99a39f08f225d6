use std::path::PathBuf;

use clap::{Parser, Subcommand};
use postern::{Postern, PosternConfig, find_config_file, supervisor};
use postern_common::logging;
use postern_delivery::run_delivery_child;

#[derive(Parser)]
#[command(name = "postern", version, about = "An SMTP receiving server")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the receiving server (default).
    Serve,
    /// Handle one SMTP session on an inherited socket (fd 3).
    ProtocolHandler,
    /// Consume one envelope header and message on stdin and write it to
    /// the configured store.
    Deliver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config)?;
    let content = std::fs::read_to_string(&config_path).map_err(|err| {
        anyhow::anyhow!(
            "Failed to read config from {}: {err}",
            config_path.display()
        )
    })?;
    let config = PosternConfig::parse(&content)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => Postern::new(config, config_path).run().await,
        Commands::ProtocolHandler => {
            logging::init();
            supervisor::run_protocol_handler(config, &config_path).await
        }
        Commands::Deliver => {
            let Some(store) = config.store_root() else {
                anyhow::bail!("no delivery store configured");
            };
            run_delivery_child(store).await?;
            Ok(())
        }
    }
}
