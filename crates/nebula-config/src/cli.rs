//! Command-line argument parsing for prediction hosts.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments shared by the loopback demo and other hosts.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "nebula-predict", about = "Client prediction and rollback loopback host")]
pub struct CliArgs {
    /// Fixed tick rate in Hz.
    #[arg(long)]
    pub tick_rate: Option<f32>,

    /// Simulated one-way latency in milliseconds.
    #[arg(long)]
    pub latency: Option<u32>,

    /// Simulated packet loss (0.0 - 1.0).
    #[arg(long)]
    pub packet_loss: Option<f32>,

    /// Number of client connections.
    #[arg(long)]
    pub clients: Option<u32>,

    /// Interpolation buffer depth for fixed-tick sims, in milliseconds.
    #[arg(long)]
    pub interpolation_ms: Option<i32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rate) = args.tick_rate {
            self.prediction.fixed_tick_rate_hz = rate;
        }
        if let Some(latency) = args.latency {
            self.network.latency_ms = latency;
        }
        if let Some(loss) = args.packet_loss {
            self.network.packet_loss = loss;
        }
        if let Some(clients) = args.clients {
            self.network.clients = clients;
        }
        if let Some(ms) = args.interpolation_ms {
            self.prediction.fixed_interpolation_buffered_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
