mod completion;
mod dispatch;
mod render;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use filefate_installer::ErrorPolicy;

use crate::dispatch::run_cli;

#[derive(Parser, Debug)]
#[command(name = "filefate")]
#[command(version, about = "Install and erase package payloads file by file", long_about = None)]
struct Cli {
    /// Directory manifest paths are installed below.
    #[arg(long, global = true, default_value = "/")]
    root: PathBuf,
    /// Run policy file. Defaults to <root>/etc/filefate.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe a staged directory tree as a manifest.
    Scan {
        source: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        pkg_version: String,
        /// Mark a path as a config file that is never overwritten when edited.
        #[arg(long = "config-file", value_name = "PATH")]
        config_files: Vec<String>,
        #[arg(long = "doc-file", value_name = "PATH")]
        doc_files: Vec<String>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Write a payload archive for a manifest from a staged tree.
    Pack {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        source: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        /// Emit index-only headers; installing then needs the same manifest.
        #[arg(long)]
        stripped: bool,
    },
    /// Show installed packages.
    List {
        #[arg(long)]
        json: bool,
    },
    Install {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        payload: PathBuf,
        #[command(flatten)]
        policy: PolicyArgs,
    },
    Erase {
        name: String,
        #[command(flatten)]
        policy: PolicyArgs,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Flags that override the policy file.
#[derive(Args, Debug, Clone, Default)]
struct PolicyArgs {
    #[arg(long, value_enum)]
    on_error: Option<CliErrorPolicy>,
    #[arg(long)]
    exclude_docs: bool,
    #[arg(long)]
    no_verify: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum CliErrorPolicy {
    Abort,
    Default,
    Continue,
}

impl From<CliErrorPolicy> for ErrorPolicy {
    fn from(value: CliErrorPolicy) -> Self {
        match value {
            CliErrorPolicy::Abort => Self::Abort,
            CliErrorPolicy::Default => Self::Default,
            CliErrorPolicy::Continue => Self::Continue,
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("FILEFATE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli)
}
