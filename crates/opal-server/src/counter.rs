//! Active-connection accounting.
//!
//! Every accepted connection holds a guard; dropping it decrements the
//! counter exactly once and wakes anyone draining. `wait_with_timeout`
//! is the graceful-shutdown primitive: it resolves when the counter hits
//! zero or the deadline passes, whichever comes first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub struct WaitTimeout;

pub struct ConnectionCounter {
    active: AtomicUsize,
    drained: Notify,
}

impl ConnectionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { counter: self.clone() }
    }

    /// Wait until every connection is gone or `timeout` elapses.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active() == 0 {
                return Ok(());
            }
            let notified = self.drained.notified();
            // A guard may have dropped between the check and registration.
            if self.active() == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return if self.active() == 0 { Ok(()) } else { Err(WaitTimeout) };
            }
        }
    }
}

/// RAII guard; decrements on drop.
pub struct ConnectionGuard {
    counter: Arc<ConnectionCounter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.active.fetch_sub(1, Ordering::SeqCst);
        self.counter.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_decrements_exactly_once() {
        let counter = ConnectionCounter::new();
        {
            let _a = counter.acquire();
            let _b = counter.acquire();
            assert_eq!(counter.active(), 2);
        }
        assert_eq!(counter.active(), 0);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let counter = ConnectionCounter::new();
        counter
            .wait_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_while_connections_remain() {
        let counter = ConnectionCounter::new();
        let _guard = counter.acquire();
        let start = Instant::now();
        let result = counter.wait_with_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, Err(WaitTimeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_resolves_when_last_guard_drops() {
        let counter = ConnectionCounter::new();
        let guard = counter.acquire();
        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_with_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
    }
}
