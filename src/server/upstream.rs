//! The upstream-ingress task: one per sub-flow, forwarding destination
//! replies back into the tunnel, re-wrapped as RTP with that sub-flow's
//! SSRC and the server's own sequence/timestamp counters.

use std::{io::ErrorKind, sync::Arc};

use bytes::BytesMut;
use tokio::net::UdpSocket;

use crate::{
    crypto::{Envelope, AEAD_OVERHEAD},
    rtp::{RtpHeader, DEFAULT_PAYLOAD_TYPE, HEADER_LEN},
};

use super::flow::{ServerFlowTable, SubFlow};

const MAX_DATAGRAM: usize = 65_507;

/// Drives one sub-flow's upstream socket until it is closed (either by the
/// destination, by an unrecoverable socket error, or by the reaper waking
/// `flow.closed`). Exits cleanly in every case; the caller is responsible
/// for removing the table entry if it isn't already gone.
pub async fn run(
    flow: Arc<SubFlow>,
    source_socket: Arc<UdpSocket>,
    table: Arc<ServerFlowTable>,
    envelope: Envelope,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let size = tokio::select! {
            res = flow.upstream.recv(&mut buf) => match res {
                Ok(size) => size,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    log::warn!(
                        "server: destination refused connection for source={} ssrc={:#010x}",
                        flow.source, flow.ssrc
                    );
                    table.remove(flow.source, flow.ssrc);
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "server: upstream recv error for source={} ssrc={:#010x}: {e}",
                        flow.source, flow.ssrc
                    );
                    table.remove(flow.source, flow.ssrc);
                    return;
                }
            },
            _ = flow.closed.notified() => return,
        };

        if flow.is_closing() {
            return;
        }

        flow.mark_active();

        let sequence = flow.next_sequence();
        let timestamp = flow.next_timestamp();
        let header = RtpHeader::new(DEFAULT_PAYLOAD_TYPE, flow.ssrc, sequence, timestamp);

        let mut packet = BytesMut::with_capacity(HEADER_LEN + size + AEAD_OVERHEAD);
        header.encode(&mut packet);
        envelope.seal(&buf[..size], &mut packet);

        log::trace!(
            "server: destination -> source {}, ssrc={:#010x}, {size} bytes",
            flow.source, flow.ssrc
        );

        if let Err(e) = source_socket.send_to(&packet, flow.source).await {
            log::warn!("server: send to source {} failed: {e}", flow.source);
        }
    }
}
