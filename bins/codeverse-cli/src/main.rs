mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codeverse")]
#[command(about = "Codeverse - Compile and run untrusted programs with bounded time and resources", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON); env vars override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Local compilers and interpreters
    Process,
    /// Throwaway Docker containers
    Docker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Memory,
    Redis,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one program and print its result
    Run {
        /// Language identifier (python, java, c, cpp, javascript)
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        #[arg(short, long)]
        file: PathBuf,

        /// Input handed to the program
        #[arg(short, long, default_value = "")]
        stdin: String,

        /// Execution backend
        #[arg(short, long, value_enum, default_value = "process")]
        backend: Backend,

        /// Print the full result as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Queue programs for serial execution and wait for every result
    Submit {
        /// Owner recorded on each run
        #[arg(short, long)]
        owner: String,

        /// Language identifier shared by all files
        #[arg(short, long)]
        language: String,

        /// Source files, executed in the order given
        #[arg(short, long, num_args = 1.., required = true)]
        file: Vec<PathBuf>,

        /// Input handed to every program
        #[arg(short, long, default_value = "")]
        stdin: String,

        /// Execution backend
        #[arg(short, long, value_enum, default_value = "process")]
        backend: Backend,

        /// Where run records live
        #[arg(long, value_enum, default_value = "memory")]
        store: StoreKind,
    },

    /// Show a persisted run record
    Status {
        /// Run identifier printed by `submit`
        #[arg(short, long)]
        run_id: uuid::Uuid,
    },

    /// List supported languages and their toolchains
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            language,
            file,
            stdin,
            backend,
            json,
        } => {
            commands::run(&config, &language, &file, &stdin, backend, json).await?;
        }
        Commands::Submit {
            owner,
            language,
            file,
            stdin,
            backend,
            store,
        } => {
            commands::submit(&config, &owner, &language, &file, &stdin, backend, store).await?;
        }
        Commands::Status { run_id } => {
            commands::status(&config, run_id).await?;
        }
        Commands::Languages => {
            commands::languages(&config);
        }
    }

    Ok(())
}

/// Logs go to stderr so program output on stdout stays clean.
/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}
