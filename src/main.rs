//! codescout - ask questions about a codebase and get an evidence-backed report.
//!
//! The agent investigates the working directory with read/search tools driven
//! by an LLM, then synthesizes the collected evidence into a Markdown report.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use codescout::cli;

pub(crate) const VERSION: &str = "0.1.0";

#[derive(Parser)]
#[command(name = "codescout", about = "codescout - Code Exploration Agent", version = VERSION)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question about a codebase.
    Ask {
        /// The question to investigate.
        query: String,
        /// Working directory to explore.
        #[arg(short, long, default_value = ".")]
        dir: String,
        /// Print the result and all emitted events as a JSON document.
        #[arg(long)]
        json: bool,
        /// Override the maximum number of investigator iterations.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// List stored investigation sessions.
    Sessions,
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("codescout=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match args.command {
        Commands::Ask {
            query,
            dir,
            json,
            max_iterations,
        } => cli::run_ask(&query, &dir, json, max_iterations).await,
        Commands::Sessions => cli::run_sessions(),
        Commands::Config => cli::run_config(),
    };

    std::process::exit(code);
}
