//! The client engine: accepts plain UDP from local peers, disguises it as
//! RTP toward the tunnel server, and reverses the process for replies.

mod flow;

use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
};

use bytes::BytesMut;
use rand::Rng;
use tokio::net::UdpSocket;

use crate::{
    crypto::Envelope,
    reaper,
    rtp::{HeaderError, RtpHeader, DEFAULT_PAYLOAD_TYPE, HEADER_LEN},
};
use flow::ClientFlowTable;

/// Largest UDP datagram this engine will stage in its transmit/receive
/// buffers; matches the theoretical max UDP payload.
const MAX_DATAGRAM: usize = 65_507;

/// Runs both client directions and the reaper until either socket's task
/// fails, or a termination signal arrives and shuts the engine down
/// cleanly. Binds `local_port` on loopback for local peers and an ephemeral
/// port connected to `server_addr` for the tunnel leg.
pub async fn run(
    local_port: u16,
    server_addr: SocketAddr,
    envelope: Envelope,
) -> anyhow::Result<()> {
    let engine = Engine::bind(local_port, server_addr, envelope).await?;
    engine.spawn_reaper();

    log::info!("client: local peers on 127.0.0.1:{local_port}, server at {server_addr}");

    tokio::select! {
        res = engine.clone().local_ingress() => res,
        res = engine.remote_ingress() => res,
        _ = tokio::signal::ctrl_c() => {
            log::info!("client: shutdown signal received, closing sockets");
            Ok(())
        }
    }
}

struct Engine {
    local: UdpSocket,
    remote: UdpSocket,
    flows: Arc<ClientFlowTable>,
    envelope: Envelope,
    /// Process-wide 16-bit sequence counter, random start, shared by every
    /// flow this client emits on (single outgoing socket).
    sequence: AtomicU16,
}

impl Engine {
    async fn bind(
        local_port: u16,
        server_addr: SocketAddr,
        envelope: Envelope,
    ) -> anyhow::Result<Arc<Self>> {
        let local = UdpSocket::bind(("127.0.0.1", local_port)).await?;
        let remote = UdpSocket::bind(("0.0.0.0", 0)).await?;
        remote.connect(server_addr).await?;

        Ok(Arc::new(Self {
            local,
            remote,
            flows: Arc::new(ClientFlowTable::new()),
            envelope,
            sequence: AtomicU16::new(rand::rng().random()),
        }))
    }

    fn spawn_reaper(self: &Arc<Self>) {
        tokio::spawn(reaper::run(
            Arc::downgrade(&self.flows),
            reaper::TIMEOUT,
            |flows| {
                for (peer, ssrc) in flows.reap() {
                    log::info!("client: flow expired, peer={peer} ssrc={ssrc:#010x}");
                }
            },
        ));
    }

    /// Receives datagrams from local peers, wraps each as one RTP packet
    /// tagged with that peer's SSRC, and sends it to the server.
    async fn local_ingress(self: Arc<Self>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (size, peer) = match self.local.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };

            let ssrc = self.flows.get_or_create(peer);
            let timestamp = self.flows.advance_timestamp(peer);
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

            let header = RtpHeader::new(DEFAULT_PAYLOAD_TYPE, ssrc, sequence, timestamp);
            let mut packet = BytesMut::with_capacity(HEADER_LEN + size + crate::crypto::AEAD_OVERHEAD);
            header.encode(&mut packet);
            self.envelope.seal(&buf[..size], &mut packet);

            log::trace!("client: local peer {peer} -> server, ssrc={ssrc:#010x}, {size} bytes");

            if let Err(e) = self.remote.send(&packet).await {
                log::warn!("client: send to server failed: {e}");
            }
        }
    }

    /// Receives RTP packets from the server, strips and decrypts them, and
    /// delivers the payload to the local peer identified by SSRC. Never
    /// creates a flow from this direction: an unknown SSRC means the
    /// client-side flow already reaped.
    async fn remote_ingress(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let size = match self.remote.recv(&mut buf).await {
                Ok(v) => v,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };

            let mut cursor = &buf[..size];
            let header = match RtpHeader::decode(&mut cursor) {
                Ok(h) => h,
                Err(HeaderError::Truncated) => {
                    log::warn!("client: packet too short from server ({size} bytes)");
                    continue;
                }
                Err(HeaderError::VersionMismatch(v)) => {
                    log::warn!("client: dropping packet with RTP version {v}");
                    continue;
                }
            };

            let mut payload = BytesMut::with_capacity(cursor.len());
            if let Err(e) = self.envelope.open(cursor, &mut payload) {
                log::warn!("client: failed to open envelope for ssrc={:#010x}: {e}", header.ssrc);
                continue;
            }

            let Some(peer) = self.flows.peer_for_ssrc(header.ssrc) else {
                log::warn!("client: unknown ssrc {:#010x} on return path, dropping", header.ssrc);
                continue;
            };
            self.flows.mark_active_by_ssrc(header.ssrc);

            log::trace!("client: server -> local peer {peer}, ssrc={:#010x}, {} bytes", header.ssrc, payload.len());

            if let Err(e) = self.local.send_to(&payload, peer).await {
                log::warn!("client: send to local peer {peer} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Mode;
    use tokio::net::UdpSocket as TestSocket;

    /// End-to-end S1-style scenario on loopback: a local peer sends a
    /// datagram through the client into a fake server socket, which
    /// inspects the wire framing and echoes plaintext back; the client
    /// must deliver it to the original peer.
    #[tokio::test]
    async fn local_peer_round_trip_through_fake_server() {
        let fake_server = TestSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = fake_server.local_addr().unwrap();

        let engine = Engine::bind(0, server_addr, Envelope::new(None, Mode::Aead).unwrap())
            .await
            .unwrap();
        let local_addr = engine.local.local_addr().unwrap();

        tokio::spawn(engine.clone().local_ingress());
        let remote_task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.remote_ingress().await }
        });

        let peer = TestSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hello", local_addr).await.unwrap();

        let mut wire = [0u8; 1500];
        let (n, client_tunnel_addr) = fake_server.recv_from(&mut wire).await.unwrap();
        assert!(n >= HEADER_LEN);

        let mut cursor = &wire[..n];
        let header = RtpHeader::decode(&mut cursor).unwrap();
        assert_eq!(header.payload_type, DEFAULT_PAYLOAD_TYPE);
        assert_eq!(cursor, b"hello" as &[u8]);

        // Echo it straight back, re-using the SSRC the client assigned.
        let mut reply = BytesMut::new();
        header.encode(&mut reply);
        reply.extend_from_slice(b"hello");
        fake_server.send_to(&reply, client_tunnel_addr).await.unwrap();

        let mut peer_buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut peer_buf).await.unwrap();
        assert_eq!(&peer_buf[..n], b"hello");
        assert_eq!(from, local_addr);

        remote_task.abort();
    }

    #[tokio::test]
    async fn two_peers_get_distinct_ssrcs_and_independent_replies() {
        let fake_server = TestSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = fake_server.local_addr().unwrap();

        let engine = Engine::bind(0, server_addr, Envelope::new(None, Mode::Aead).unwrap())
            .await
            .unwrap();
        let local_addr = engine.local.local_addr().unwrap();

        tokio::spawn(engine.clone().local_ingress());

        let peer_a = TestSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_b = TestSocket::bind("127.0.0.1:0").await.unwrap();
        peer_a.send_to(b"from-a", local_addr).await.unwrap();
        peer_b.send_to(b"from-b", local_addr).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let mut wire = [0u8; 1500];
            let (n, _) = fake_server.recv_from(&mut wire).await.unwrap();
            let mut cursor = &wire[..n];
            let header = RtpHeader::decode(&mut cursor).unwrap();
            seen.insert(header.ssrc);
        }
        assert_eq!(seen.len(), 2);
    }
}
