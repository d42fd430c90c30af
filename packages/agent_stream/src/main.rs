use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stream_protocol::{Dialect, OutboundFormat};
use tracing::debug;
use tracing_subscriber::prelude::*;

use agent_stream::config::{self, ExecutionConfig, FileConfig, SessionConfig};

mod cli;

#[derive(Parser)]
#[command(name = "agent-stream")]
#[command(about = "Chat with a multi-agent code review backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding agent-stream.toml (defaults to ~/.config/agent-stream)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive session
    Chat(ChatArgs),

    /// Run a source file through the code-execution service
    Exec(ExecArgs),
}

#[derive(Parser)]
struct ChatArgs {
    /// Backend WebSocket URL (overrides connection.url)
    #[arg(long)]
    url: Option<String>,

    /// API key sent as the api_key query parameter
    #[arg(long, env = "AGENT_STREAM_API_KEY")]
    api_key: Option<String>,

    /// Event vocabulary to accept: superset, token, streaming
    #[arg(long)]
    dialect: Option<Dialect>,

    /// How messages are sent: plain_text, review_envelope
    #[arg(long)]
    outbound: Option<OutboundFormat>,

    /// File attached to review requests
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Parser)]
struct ExecArgs {
    /// Source file to run
    path: PathBuf,

    /// Language (guessed from the file extension when omitted)
    #[arg(short, long)]
    language: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with the transcript
    let default_directive = if cli.debug {
        "agent_stream=debug,stream_protocol=debug,info"
    } else {
        "agent_stream=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    debug!(config_dir = %config_dir.display(), "loading configuration");
    let mut file_config: FileConfig = config::load_config(&config_dir)
        .extract()
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;

    match cli.command {
        Commands::Chat(args) => {
            if let Some(url) = args.url {
                file_config.connection.url = url;
            }
            if args.api_key.is_some() {
                file_config.connection.api_key = args.api_key;
            }
            if let Some(dialect) = args.dialect {
                file_config.protocol.dialect = dialect;
            }
            if let Some(outbound) = args.outbound {
                file_config.protocol.outbound = outbound;
            }
            let session_config = SessionConfig::from_file(&file_config)?;
            cli::chat::chat_command(session_config, args.file).await
        }
        Commands::Exec(args) => {
            let exec_config = ExecutionConfig::from_file(&file_config.execution);
            cli::exec::exec_command(&exec_config, &args.path, args.language.as_deref()).await
        }
    }
}
