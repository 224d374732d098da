//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod model_list;
pub mod say;
pub mod status;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::cli::model_list::list_models;
use crate::cli::say::run_say;
use crate::cli::status::{run_serve, run_status};
use crate::core::auth::{KeyringAuthenticator, StoredToken};
use crate::core::config::data::path_display;
use crate::core::config::Config;
use crate::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "localbridge")]
#[command(about = "Reach a local LLM backend directly, through a cloud relay, or through a public tunnel")]
#[command(
    long_about = "localbridge keeps a connection to an Ollama-compatible model backend over \
whichever route works: the backend on this machine, the cloud relay's WebSocket bridge, or a \
public ingress tunnel (ngrok or cloudflared). Routes are tried in the configured priority order \
and retried with backoff.\n\n\
Authentication:\n\
  Use 'localbridge auth set-token' to store a relay token in the system keyring.\n\n\
Environment Variables:\n\
  LOCALBRIDGE_RELAY_TOKEN   Relay token used when the keyring holds none\n\
  RUST_LOG                  Log filter; overrides --log-level and the config file"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level or filter directive (e.g. "debug", "localbridge=trace")
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one connection round and print every transport's status
    Status {
        /// Try transports even if their circuit breaker is open
        #[arg(long)]
        force: bool,
    },
    /// Keep transports connected and serve the relay bridge until Ctrl-C
    Serve,
    /// Stream a reply to stdout
    #[command(alias = "say")]
    Chat {
        /// Model to use
        #[arg(short = 'm', long)]
        model: String,
        /// Conversation id; a new stream cancels the previous one for the same id
        #[arg(short = 'c', long, default_value = "cli")]
        conversation: String,
        /// Prompt text
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// List the backend's models over the best available route
    Models,
    /// Manage the relay token
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Store a relay token in the system keyring
    SetToken {
        token: String,
        /// Seconds until the token expires
        #[arg(long, value_name = "SECS")]
        expires_in: Option<i64>,
    },
    /// Remove the stored relay token
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration
    Show,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config_path = args.config.as_deref();
    let config = Config::load(config_path)?;

    init_logging(
        args.log_level.as_deref(),
        config.logging.level.as_deref(),
        config.logging.file.as_deref(),
    )?;

    match args.command {
        Commands::Status { force } => run_status(&config, auth(), force).await,
        Commands::Serve => run_serve(&config, auth()).await,
        Commands::Chat {
            model,
            conversation,
            prompt,
        } => run_say(&config, auth(), model, conversation, prompt.join(" ")).await,
        Commands::Models => list_models(&config, auth()).await,
        Commands::Auth { command } => match command {
            AuthCommands::SetToken { token, expires_in } => {
                let token = token.trim();
                if token.is_empty() {
                    return Err("Token must not be empty".into());
                }
                let stored = match expires_in {
                    Some(seconds) => StoredToken::expiring_in(token, seconds)
                        .ok_or_else(|| format!("--expires-in {seconds} is out of range"))?,
                    None => StoredToken::new(token),
                };
                KeyringAuthenticator::new().store_token(&stored)?;
                match stored.expires_at {
                    Some(expires_at) => println!(
                        "✅ Stored relay token (expires {})",
                        expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    None => println!("✅ Stored relay token"),
                }
                Ok(())
            }
            AuthCommands::Clear => {
                if KeyringAuthenticator::new().clear()? {
                    println!("✅ Removed relay token");
                } else {
                    println!("No relay token was stored");
                }
                Ok(())
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                let path = Config::resolve_path(config_path)?;
                println!("{}", path_display(&path));
                Ok(())
            }
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        },
    }
}

fn auth() -> Arc<KeyringAuthenticator> {
    Arc::new(KeyringAuthenticator::new())
}
