//! NGOBRAS sync CLI - follow a chat conversation from the terminal.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use chat_config_and_utils::{init_logging, Config, Paths};

/// NGOBRAS sync command-line interface.
#[derive(Parser)]
#[command(name = "ngobras-sync")]
#[command(about = "Realtime/polling chat sync for NGOBRAS conversations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for runtime files (config, logs, history). Defaults to ~/.ngobras
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a conversation; lines typed on stdin are sent as messages
    Watch {
        /// Local user id
        #[arg(short, long, env = "NGOBRAS_USER_ID")]
        user: String,

        /// Counterpart id (an admin or an AI assistant id)
        #[arg(short, long)]
        with: String,

        /// Treat the counterpart as an AI assistant
        #[arg(long)]
        assistant: bool,

        /// Override the transport mode (auto, push, polling)
        #[arg(long)]
        transport: Option<String>,

        /// User access token for row-level security
        #[arg(long, env = "NGOBRAS_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    // Load configuration
    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;

    match cli.command {
        Commands::Watch {
            user,
            with,
            assistant,
            transport,
            access_token,
        } => {
            if let Some(mode) = transport {
                config.realtime.transport_mode = mode.parse()?;
            }
            let options = app::WatchOptions {
                user,
                counterpart: with,
                assistant,
                access_token,
            };
            app::run_watch(config, paths, options).await?;
        }
        Commands::Config => {
            app::print_config(&config, &paths)?;
        }
    }

    Ok(())
}
