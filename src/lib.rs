//! A UDP-over-RTP disguise tunnel.
//!
//! Two symmetric engines — [`client`] and [`server`] — share the [`rtp`]
//! framing codec, the [`crypto`] envelope and the idle-flow [`reaper`].
//! Everything else (CLI parsing, key generation, logging setup) lives in
//! this crate's binary entry point so the engines stay free of process
//! concerns, the same split the corpus draws between its library crates
//! and `main.rs`.

pub mod cli;
pub mod client;
pub mod crypto;
pub mod key;
pub mod reaper;
pub mod rtp;
pub mod server;

use std::net::SocketAddr;

use cli::{ClientArgs, Command, GenKeyArgs, ServerArgs};
use crypto::Envelope;

/// Dispatches a parsed [`Cli`](cli::Cli) to the matching subcommand. Split
/// out of `main` so integration tests can start an engine directly without
/// going through `std::env::args`.
pub async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Client(args) => run_client(args).await,
        Command::Server(args) => run_server(args).await,
        Command::GenKey(args) => run_gen_key(args),
    }
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let envelope = build_envelope(args.key.as_deref(), args.cipher)?;
    let server_addr = SocketAddr::new(args.server_addr, args.server_port);
    client::run(args.local_port, server_addr, envelope).await
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let envelope = build_envelope(args.key.as_deref(), args.cipher)?;
    let listen_addr = SocketAddr::new(args.listen_addr, args.listen_port);
    let dest_addr = SocketAddr::new(args.dest_addr, args.dest_port);
    server::run(listen_addr, dest_addr, envelope).await
}

fn run_gen_key(args: GenKeyArgs) -> anyhow::Result<()> {
    println!("{}", key::generate(args.bits)?);
    Ok(())
}

fn build_envelope(key: Option<&str>, mode: crypto::Mode) -> anyhow::Result<Envelope> {
    let decoded = key.map(key::decode).transpose()?;
    Envelope::new(decoded.as_deref(), mode)
}
