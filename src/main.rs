mod cache;
mod codebeamer;
mod config;
mod limiter;
mod logging;
mod query;
mod server;
mod stats;
mod tools;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::info;

use crate::codebeamer::SmartClient;

#[derive(Parser, Debug)]
#[command(name = "cbgate")]
#[command(about = "Caching, rate-limited gateway to the Codebeamer REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cbgate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Serve JSON tool requests on stdin, one per line
  Serve,
  /// Run a single tool and print its result
  Call {
    /// Tool name or alias
    tool: String,
    /// Tool arguments as a JSON object
    #[arg(short, long)]
    args: Option<String>,
  },
  /// List available tools with their input schemas
  Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.log_stderr)?;

  if let Command::Tools = args.command {
    let catalogue: Vec<Value> = tools::TOOLS.iter().map(tools::Tool::describe).collect();
    println!("{}", serde_json::to_string_pretty(&catalogue)?);
    return Ok(());
  }

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  info!(url = %config.codebeamer.url, max_calls = config.limits.max_calls, "Starting");

  let client = SmartClient::new(&config)?;

  match args.command {
    Command::Serve => {
      let stdin = BufReader::new(tokio::io::stdin());
      server::serve(&client, stdin, tokio::io::stdout()).await?;
    }
    Command::Call { tool, args } => {
      let arguments = match args {
        Some(text) => serde_json::from_str(&text)
          .map_err(|e| eyre!("--args must be a JSON object: {}", e))?,
        None => Value::Null,
      };
      let result = tools::handle(&client, &tool, arguments).await;
      println!("{}", serde_json::to_string_pretty(&result)?);
      info!(stats = ?client.stats(), "Done");
    }
    Command::Tools => {}
  }

  Ok(())
}
