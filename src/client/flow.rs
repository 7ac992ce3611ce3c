//! Client-side flow table: one entry per distinct local peer address.
//!
//! The SSRC is the demultiplexing key for return traffic, so it must be
//! globally unique among concurrently-live flows on this side; the table
//! keeps both the peer→flow map and its ssrc→peer inverse as typed
//! secondary indices rather than linear-scanning one to build the other.

use std::{collections::HashMap, net::SocketAddr};

use parking_lot::RwLock;
use rand::Rng;

use crate::rtp::TIMESTAMP_STEP;

struct ClientFlow {
    ssrc: u32,
    timestamp: u32,
    active: bool,
}

#[derive(Default)]
struct Inner {
    by_peer: HashMap<SocketAddr, ClientFlow>,
    by_ssrc: HashMap<u32, SocketAddr>,
}

/// Flow table mutated by the client engine's own tasks (local-ingress,
/// remote-ingress, reaper). Guarded by a single `parking_lot::RwLock` since
/// flow counts here are one per local peer and not a contended hot path.
#[derive(Default)]
pub struct ClientFlowTable {
    inner: RwLock<Inner>,
}

impl ClientFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the SSRC for `peer`, creating a fresh flow with a
    /// collision-checked random SSRC if this is the first datagram seen
    /// from that address. Marks the flow active either way.
    pub fn get_or_create(&self, peer: SocketAddr) -> u32 {
        let mut inner = self.inner.write();

        if let Some(flow) = inner.by_peer.get_mut(&peer) {
            flow.active = true;
            return flow.ssrc;
        }

        let ssrc = loop {
            let candidate: u32 = rand::rng().random();
            if !inner.by_ssrc.contains_key(&candidate) {
                break candidate;
            }
        };

        inner.by_peer.insert(
            peer,
            ClientFlow {
                ssrc,
                timestamp: rand::rng().random(),
                active: true,
            },
        );
        inner.by_ssrc.insert(ssrc, peer);
        ssrc
    }

    /// Advances and returns the next timestamp for `peer`'s flow. Only
    /// meaningful right after [`Self::get_or_create`] observed the same
    /// peer, so a missing entry here would indicate a logic error upstream
    /// rather than a real race — it is handled gracefully anyway by
    /// returning 0, since a wrong camouflage timestamp is not a correctness
    /// issue.
    pub fn advance_timestamp(&self, peer: SocketAddr) -> u32 {
        let mut inner = self.inner.write();
        match inner.by_peer.get_mut(&peer) {
            Some(flow) => {
                let ts = flow.timestamp;
                flow.timestamp = flow.timestamp.wrapping_add(TIMESTAMP_STEP);
                ts
            }
            None => 0,
        }
    }

    /// Resolves the originating peer address for a return-path SSRC, for
    /// delivering decrypted payload back to the local socket. No auto-create
    /// happens here: an unknown SSRC means the local flow already reaped,
    /// and the packet is dropped by the caller.
    pub fn peer_for_ssrc(&self, ssrc: u32) -> Option<SocketAddr> {
        self.inner.read().by_ssrc.get(&ssrc).copied()
    }

    /// Marks the flow owning `ssrc` active, so replies delivered from the
    /// server count as traffic for reaper purposes just like local ingress
    /// does.
    pub fn mark_active_by_ssrc(&self, ssrc: u32) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.by_ssrc.get(&ssrc).copied() {
            if let Some(flow) = inner.by_peer.get_mut(&peer) {
                flow.active = true;
            }
        }
    }

    /// Performs one two-pass reaper sweep: flows already idle are removed
    /// and returned (for logging); flows still marked active have their
    /// flag cleared to be caught on the *next* sweep if nothing refreshes
    /// them meanwhile.
    pub fn reap(&self) -> Vec<(SocketAddr, u32)> {
        let mut inner = self.inner.write();

        let stale: Vec<SocketAddr> = inner
            .by_peer
            .iter()
            .filter(|(_, flow)| !flow.active)
            .map(|(peer, _)| *peer)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for peer in stale {
            if let Some(flow) = inner.by_peer.remove(&peer) {
                inner.by_ssrc.remove(&flow.ssrc);
                removed.push((peer, flow.ssrc));
            }
        }

        for flow in inner.by_peer.values_mut() {
            flow.active = false;
        }

        removed
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.inner.read().by_peer.len()
    }
}
