use std::{net::SocketAddr, path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Builds and runs web projects straight from their git repositories.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "orchestro.toml")]
    pub config: PathBuf,
    /// Address to listen on. Overrides `listen` from the config file.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
