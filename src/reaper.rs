//! The shared idle-flow reaper, one instance per engine.
//!
//! Both the client and server flow tables are swept on the same two-pass
//! schedule: a flow with its activity flag already clear when the sweep
//! runs is deleted; a flow that is still marked active has the flag
//! cleared and survives to the next sweep. Traffic in either direction
//! re-marks the flag, so a flow only dies after a full `TIMEOUT` with
//! nothing seen — the true idle-to-reap window is `[TIMEOUT, 2*TIMEOUT)`.
//!
//! The reaper holds a [`Weak`] reference to the table it sweeps, the same
//! pattern the corpus uses for its static-credential expiry loop: when the
//! engine (and every `Arc` clone of its flow table) is dropped, the next
//! tick fails to upgrade and the task exits on its own rather than needing
//! an explicit cancellation signal.

use std::{sync::Weak, time::Duration};

/// Idle interval used by both engines' reapers. Not exposed as a CLI flag
/// per the external interface's stated surface; kept as a named constant so
/// a future flag is a one-line change.
pub const TIMEOUT: Duration = Duration::from_secs(120);

/// Runs a two-pass reaper over `table` every `period`, invoking `sweep` to
/// perform the actual pass. Exits cleanly once `table` has no more strong
/// owners. `sweep` must not block on network I/O; it only touches the
/// table's own lock.
pub async fn run<T, F>(table: Weak<T>, period: Duration, sweep: F)
where
    T: Send + Sync + 'static,
    F: Fn(&T),
{
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; skip it so the first real sweep
    // happens a full `period` after the reaper starts, not at time zero.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match table.upgrade() {
            Some(table) => sweep(&table),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_schedule_and_stops_when_dropped() {
        let counter = Arc::new(Mutex::new(0u32));
        let weak = Arc::downgrade(&counter);

        let handle = tokio::spawn(run(weak, Duration::from_secs(1), |c: &Mutex<u32>| {
            *c.lock() += 1;
        }));

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(*counter.lock(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(*counter.lock(), 2);

        drop(counter);
        tokio::time::advance(Duration::from_secs(1)).await;
        handle.await.unwrap();
    }
}
