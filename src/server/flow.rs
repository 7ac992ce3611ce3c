//! Server-side flow table: sub-flows keyed by `(source peer, SSRC)`.
//!
//! Unlike the client, SSRCs here are chosen by whichever peer is tunneling
//! through this server, so two unrelated source peers picking the same
//! SSRC value must not collide — the key is the pair, never the SSRC
//! alone. Each sub-flow owns one upstream UDP socket dedicated to its
//! destination connection.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use rand::Rng;
use tokio::{net::UdpSocket, sync::Notify};

use crate::rtp::TIMESTAMP_STEP;

/// One `(source, ssrc)` sub-flow: its dedicated upstream socket plus the
/// server-side sequence/timestamp state used to re-wrap upstream replies as
/// RTP. `Closing` sub-flows never emit packets; `notify` wakes the
/// upstream-ingress task so it can close its socket and exit.
pub struct SubFlow {
    pub source: SocketAddr,
    pub ssrc: u32,
    pub upstream: UdpSocket,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    active: AtomicBool,
    closing: AtomicBool,
    spawned: AtomicBool,
    pub closed: Arc<Notify>,
}

impl SubFlow {
    fn new(source: SocketAddr, ssrc: u32, upstream: UdpSocket) -> Self {
        Self {
            source,
            ssrc,
            upstream,
            sequence: AtomicU16::new(rand::rng().random()),
            timestamp: AtomicU32::new(rand::rng().random()),
            active: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            closed: Arc::new(Notify::new()),
        }
    }

    /// Flags this sub-flow as having its upstream-ingress task spawned,
    /// returning `true` only the first time this is called. A freshly
    /// created sub-flow is raced by at most one caller (the one that just
    /// inserted it via `get_or_insert_with`), but this stays correct even
    /// if that assumption ever changes.
    pub fn mark_spawned(&self) -> bool {
        !self.spawned.swap(true, Ordering::Relaxed)
    }

    /// Next sequence number for a packet emitted on this sub-flow; wraps
    /// mod 2^16 via the atomic's own overflow behavior.
    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Next timestamp for a packet emitted on this sub-flow; wraps mod
    /// 2^32 via the atomic's own overflow behavior.
    pub fn next_timestamp(&self) -> u32 {
        self.timestamp.fetch_add(TIMESTAMP_STEP, Ordering::Relaxed)
    }

    pub fn mark_active(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    /// True once the sub-flow has entered `Closing`: no further packets
    /// should be sent on its upstream socket.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Transitions `Open` -> `Closing` and wakes the upstream-ingress task
    /// so it stops polling a socket that is about to be torn down.
    fn begin_close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        self.closed.notify_waiters();
    }
}

type Key = (SocketAddr, u32);

#[derive(Default)]
struct Inner {
    flows: HashMap<Key, Arc<SubFlow>>,
}

/// Two-level `source address -> { ssrc -> sub-flow }` table collapsed into
/// one composite-key map, matching the corpus's own preference for a
/// single composite-key `HashMap` session table over nested maps.
#[derive(Default)]
pub struct ServerFlowTable {
    inner: RwLock<Inner>,
}

impl ServerFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: SocketAddr, ssrc: u32) -> Option<Arc<SubFlow>> {
        let flow = self.inner.read().flows.get(&(source, ssrc)).cloned();
        if let Some(flow) = &flow {
            flow.mark_active();
        }
        flow
    }

    /// Returns the existing sub-flow for `(source, ssrc)`, or binds a fresh
    /// upstream socket via `bind_upstream` and inserts a new one. `bind_upstream`
    /// runs without holding the table lock since it performs real I/O (an
    /// async bind+connect); if two tasks race to create the same sub-flow,
    /// the loser's freshly bound socket is simply dropped and the winner's
    /// entry is returned instead.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        source: SocketAddr,
        ssrc: u32,
        bind_upstream: F,
    ) -> anyhow::Result<Arc<SubFlow>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<UdpSocket>>,
    {
        if let Some(flow) = self.get(source, ssrc) {
            return Ok(flow);
        }

        let upstream = bind_upstream().await?;
        let fresh = Arc::new(SubFlow::new(source, ssrc, upstream));

        let mut inner = self.inner.write();
        let flow = inner
            .flows
            .entry((source, ssrc))
            .or_insert(fresh)
            .clone();
        Ok(flow)
    }

    /// Performs one two-pass reaper sweep, closing and removing idle
    /// sub-flows (which wakes their upstream-ingress tasks to exit) and
    /// clearing the activity flag on the rest.
    pub fn reap(&self) -> Vec<(SocketAddr, u32)> {
        let mut inner = self.inner.write();

        let stale: Vec<Key> = inner
            .flows
            .iter()
            .filter(|(_, flow)| !flow.active.load(Ordering::Relaxed))
            .map(|(key, _)| *key)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(flow) = inner.flows.remove(&key) {
                flow.begin_close();
                removed.push(key);
            }
        }

        for flow in inner.flows.values() {
            flow.active.store(false, Ordering::Relaxed);
        }

        removed
    }

    /// Removes a sub-flow outright, e.g. when its upstream-ingress task
    /// observes the socket has been closed underneath it.
    pub fn remove(&self, source: SocketAddr, ssrc: u32) {
        if let Some(flow) = self.inner.write().flows.remove(&(source, ssrc)) {
            flow.begin_close();
        }
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.inner.read().flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    async fn bind_loopback() -> anyhow::Result<UdpSocket> {
        Ok(UdpSocket::bind("127.0.0.1:0").await?)
    }

    #[tokio::test]
    async fn same_ssrc_from_different_sources_gets_independent_subflows() {
        let table = ServerFlowTable::new();
        let flow_a = table
            .get_or_insert_with(addr(1), 0xAAAA, bind_loopback)
            .await
            .unwrap();
        let flow_b = table
            .get_or_insert_with(addr(2), 0xAAAA, bind_loopback)
            .await
            .unwrap();

        assert_ne!(
            flow_a.upstream.local_addr().unwrap(),
            flow_b.upstream.local_addr().unwrap()
        );
        assert_eq!(table.live_count(), 2);
    }

    #[tokio::test]
    async fn repeated_lookup_reuses_the_same_subflow() {
        let table = ServerFlowTable::new();
        let first = table
            .get_or_insert_with(addr(1), 1, bind_loopback)
            .await
            .unwrap();
        let second = table
            .get_or_insert_with(addr(1), 1, bind_loopback)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn two_pass_reap_requires_a_full_idle_period() {
        let table = ServerFlowTable::new();
        let flow = table
            .get_or_insert_with(addr(1), 1, bind_loopback)
            .await
            .unwrap();

        assert!(table.reap().is_empty());
        assert_eq!(table.live_count(), 1);
        assert!(!flow.is_closing());

        let removed = table.reap();
        assert_eq!(removed, vec![(addr(1), 1)]);
        assert_eq!(table.live_count(), 0);
        assert!(flow.is_closing());
    }

    #[tokio::test]
    async fn sequence_wraps_at_2_16_with_no_gap() {
        let table = ServerFlowTable::new();
        let flow = table
            .get_or_insert_with(addr(1), 1, bind_loopback)
            .await
            .unwrap();

        // Drain whatever random start `SubFlow::new` picked so the boundary
        // crossing below is deterministic.
        let start = flow.next_sequence();
        let mut expected = start.wrapping_add(1);
        for _ in 0..70_000u32 {
            assert_eq!(flow.next_sequence(), expected);
            expected = expected.wrapping_add(1);
        }
    }

    #[tokio::test]
    async fn closing_subflow_emits_nothing() {
        let table = ServerFlowTable::new();
        let flow = table
            .get_or_insert_with(addr(1), 1, bind_loopback)
            .await
            .unwrap();
        table.reap();
        table.reap();
        assert!(flow.is_closing());
    }
}
