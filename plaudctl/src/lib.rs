use std::io;
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use thiserror::Error;

pub mod commands;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] plaud_core::ConfigError),
    #[error("export error: {0}")]
    Export(#[from] plaud_core::ExportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Plaud recording export control interface", long_about = None)]
pub struct Cli {
    /// Path to the settings file (created on first run)
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Exports recordings through a browser-driven session
    Run(RunArgs),
    /// Normalizes leftover download filenames in a directory
    Sweep(SweepArgs),
    /// Generates shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Where exported recordings are saved
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
    /// Inter-step delay in milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,
    /// Maximum recordings to export (-1 exports everything)
    #[arg(long)]
    pub max_recordings: Option<i64>,
    /// Runs the browser without a visible window
    #[arg(long, default_value_t = false)]
    pub headless: bool,
    /// Forces an isolated browser session even when a host profile exists
    #[arg(long, default_value_t = false)]
    pub fresh_profile: bool,
    /// Overrides the target application URL
    #[arg(long)]
    pub target_url: Option<String>,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Directory to sweep; defaults to the configured download directory
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

pub fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Commands::Run(args) => commands::export::execute(&cli, args),
        Commands::Sweep(args) => commands::sweep::execute(&cli, args),
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "plaudctl", &mut io::stdout());
            Ok(())
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plaud-export")
        .join("settings.toml")
}
