use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "testypie",
    about = "Record/replay HTTP proxy that turns upstream responses into YAML test fixtures"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./testypie.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to accept client connections on.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Directory holding recorded fixtures.
    #[arg(long)]
    pub fixtures_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
