//! Command-line interface definitions and parsing

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,
}

/// Message given either as text or as hex bytes
#[derive(Args, Debug, Clone)]
pub struct PayloadArgs {
    /// Message text
    #[arg(required_unless_present = "hex")]
    pub message: Option<String>,

    /// Message as hex-encoded bytes instead of text
    #[arg(long, conflicts_with = "message")]
    pub hex: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a sender and a receiver over a simulated radio
    Demo {
        #[command(flatten)]
        payload: PayloadArgs,
        /// Fraction of scan reports lost on the simulated air
        #[arg(short, long)]
        loss: Option<f64>,
        /// Seed for the simulated air and message ids
        #[arg(short, long)]
        seed: Option<u64>,
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 60)]
        timeout: u64,
    },
    /// Show how a message would be split into advertisements
    Plan {
        #[command(flatten)]
        payload: PayloadArgs,
        /// Raw advertising length of the radio
        #[arg(short = 'l', long, default_value_t = 31)]
        max_length: usize,
    },
    /// Generate a channel identifier carrying the protocol marker
    Channel,
    /// Broadcast a message on a real adapter until interrupted
    Broadcast {
        /// Channel UUID (generated when omitted)
        #[arg(long)]
        channel: Option<String>,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Print messages heard on a real adapter until interrupted
    Scan {
        /// Only accept this channel UUID
        #[arg(long)]
        channel: Option<String>,
    },
    /// Broadcast a message and print everything heard, until interrupted
    Run {
        /// Channel UUID to broadcast on (generated when omitted)
        #[arg(long)]
        channel: Option<String>,
        #[command(flatten)]
        payload: PayloadArgs,
    },
}
