use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Central lottery server: collects bet batches from a fixed set of
/// agencies and runs one draw per round once every agency is ready.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:3600")]
    pub listen: SocketAddr,

    /// Number of agencies that must report ready before the draw runs.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub agencies: u32,

    /// Append-only bet log; bets are kept in memory when omitted.
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Winning number used by the default draw rule.
    #[arg(long, default_value_t = 7574)]
    pub winning_number: u32,
}
