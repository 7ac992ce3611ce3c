//! Command-line surface: `client`, `server` and `gen-key` subcommands plus
//! a top-level verbosity flag, matching the corpus's own `clap` derive
//! layering (see `config.rs`'s `Cli`/`Config::load`).

use std::net::IpAddr;

use clap::{Parser, Subcommand, ValueEnum};

use crate::crypto::Mode;

#[derive(Parser)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct Cli {
    /// log verbosity
    #[arg(short, long, value_enum, default_value = "info")]
    pub verbosity: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// accept local UDP and disguise it as RTP toward a server
    Client(ClientArgs),
    /// strip RTP framing from a server socket and forward plain UDP
    Server(ServerArgs),
    /// print a freshly generated base64 key and exit without binding any socket
    GenKey(GenKeyArgs),
}

#[derive(clap::Args)]
pub struct ClientArgs {
    /// local UDP port that local peers send plaintext datagrams to
    #[arg(long)]
    pub local_port: u16,

    /// tunnel server address
    #[arg(long)]
    pub server_addr: IpAddr,

    /// tunnel server port
    #[arg(long)]
    pub server_port: u16,

    /// base64-encoded 16 or 32 byte key; omit to run with no envelope
    #[arg(long)]
    pub key: Option<String>,

    /// envelope mode applied when `--key` is set
    #[arg(long, value_enum, default_value = "aead")]
    pub cipher: Mode,
}

#[derive(clap::Args)]
pub struct ServerArgs {
    /// address to bind the public tunnel-facing socket on
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    /// port to bind the public tunnel-facing socket on
    #[arg(long)]
    pub listen_port: u16,

    /// final destination address plain UDP is forwarded to
    #[arg(long, default_value = "127.0.0.1")]
    pub dest_addr: IpAddr,

    /// final destination port plain UDP is forwarded to
    #[arg(long)]
    pub dest_port: u16,

    /// base64-encoded 16 or 32 byte key; must match the client's
    #[arg(long)]
    pub key: Option<String>,

    /// envelope mode applied when `--key` is set; must match the client's
    #[arg(long, value_enum, default_value = "aead")]
    pub cipher: Mode,
}

#[derive(clap::Args)]
pub struct GenKeyArgs {
    /// key size in bits: 128 or 256
    #[arg(long, default_value_t = 256)]
    pub bits: u32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}
