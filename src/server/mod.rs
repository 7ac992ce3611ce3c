//! The server engine: strips RTP framing off inbound tunnel traffic and
//! forwards plain UDP to a fixed destination, lazily opening one upstream
//! socket per `(source peer, SSRC)` sub-flow.

mod flow;
mod upstream;

use std::{io::ErrorKind, net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use tokio::net::UdpSocket;

use crate::{
    crypto::Envelope,
    reaper,
    rtp::{HeaderError, RtpHeader, HEADER_LEN},
};
use flow::ServerFlowTable;

const MAX_DATAGRAM: usize = 65_507;

/// Runs the server engine until the source socket's task fails, or a
/// termination signal arrives and shuts the engine down cleanly. Binds
/// `listen_addr` for inbound tunnel traffic; each sub-flow's upstream
/// socket is connected to `dest_addr`.
pub async fn run(
    listen_addr: SocketAddr,
    dest_addr: SocketAddr,
    envelope: Envelope,
) -> anyhow::Result<()> {
    let source_socket = Arc::new(UdpSocket::bind(listen_addr).await?);
    let flows = Arc::new(ServerFlowTable::new());

    tokio::spawn(reaper::run(
        Arc::downgrade(&flows),
        reaper::TIMEOUT,
        |flows| {
            for (source, ssrc) in flows.reap() {
                log::info!("server: sub-flow expired, source={source} ssrc={ssrc:#010x}");
            }
        },
    ));

    log::info!("server: listening on {listen_addr}, forwarding to {dest_addr}");

    tokio::select! {
        res = source_ingress(source_socket, flows, dest_addr, envelope) => res,
        _ = tokio::signal::ctrl_c() => {
            log::info!("server: shutdown signal received, closing sockets");
            Ok(())
        }
    }
}

async fn source_ingress(
    source_socket: Arc<UdpSocket>,
    flows: Arc<ServerFlowTable>,
    dest_addr: SocketAddr,
    envelope: Envelope,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (size, source) = match source_socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => return Err(e.into()),
        };

        let mut cursor = &buf[..size];
        let header = match RtpHeader::decode(&mut cursor) {
            Ok(h) => h,
            Err(HeaderError::Truncated) => {
                log::warn!("server: packet too short from {source} ({size} bytes)");
                continue;
            }
            Err(HeaderError::VersionMismatch(v)) => {
                log::warn!("server: dropping packet from {source} with RTP version {v}");
                continue;
            }
        };

        let mut payload = BytesMut::with_capacity(cursor.len());
        if let Err(e) = envelope.open(cursor, &mut payload) {
            log::warn!(
                "server: failed to open envelope from {source} ssrc={:#010x}: {e}",
                header.ssrc
            );
            continue;
        }

        let flow = match flows
            .get_or_insert_with(source, header.ssrc, || {
                let dest_addr = dest_addr;
                async move {
                    let upstream = UdpSocket::bind(("0.0.0.0", 0)).await?;
                    upstream.connect(dest_addr).await?;
                    Ok(upstream)
                }
            })
            .await
        {
            Ok(flow) => flow,
            Err(e) => {
                log::warn!("server: failed to open upstream socket for {source}: {e}");
                continue;
            }
        };

        // A freshly created sub-flow needs its upstream-ingress task
        // spawned exactly once; `spawned` flags that so a second inbound
        // packet racing the first doesn't double-spawn.
        if flow.mark_spawned() {
            tokio::spawn(upstream::run(
                flow.clone(),
                source_socket.clone(),
                flows.clone(),
                envelope.clone(),
            ));
        }

        log::trace!(
            "server: source {source} -> destination, ssrc={:#010x}, {} bytes",
            header.ssrc,
            payload.len()
        );

        if let Err(e) = flow.upstream.send(&payload).await {
            log::warn!("server: send to destination failed for {source}: {e}");
        }
    }
}
