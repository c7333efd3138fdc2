//! `FifoGate`: a bounded, strictly-ordered admission gate. At most `N`
//! handles exist concurrently; waiters are admitted in arrival order, and
//! releasing a handle admits the next waiter. Shared by the czar's
//! `PseudoFifo` (spec.md section 4.2, bounding concurrent data pulls) and the
//! worker's transmit serialization gate (spec.md section 4.6,
//! "achieved by transmit serialization via a PseudoFifo-like gate on the
//! worker side") — same admission policy, two call sites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

struct Waiter {
    #[allow(dead_code)] // kept for readability/debugging; ordering is by queue position
    ticket: u64,
    notify: oneshot::Sender<()>,
}

struct Inner {
    max_concurrent: usize,
    live: usize,
    waiters: VecDeque<Waiter>,
}

/// Bounded ordered admission gate.
pub struct FifoGate {
    inner: parking_lot::Mutex<Inner>,
    next_ticket: AtomicU64,
}

/// Holds one of the `N` admission slots; dropping it releases the slot and
/// admits the next waiter in arrival order.
pub struct FifoHandle {
    gate: Arc<FifoGate>,
}

impl FifoGate {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(Inner {
                max_concurrent,
                live: 0,
                waiters: VecDeque::new(),
            }),
            next_ticket: AtomicU64::new(0),
        })
    }

    /// Admits the caller, blocking until a slot is free and it is next in
    /// arrival order.
    pub async fn queue_and_wait(self: &Arc<Self>) -> FifoHandle {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let mut inner = self.inner.lock();
            if inner.live < inner.max_concurrent && inner.waiters.is_empty() {
                inner.live += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter { ticket, notify: tx });
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        FifoHandle { gate: self.clone() }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        if let Some(next) = inner.waiters.pop_front() {
            let _ = next.notify.send(());
        } else {
            inner.live -= 1;
        }
    }
}

impl Drop for FifoHandle {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn never_exceeds_n_live_handles() {
        let gate = FifoGate::new(2);
        let h1 = gate.queue_and_wait().await;
        let h2 = gate.queue_and_wait().await;
        assert_eq!(gate.live_count(), 2);

        let gate2 = gate.clone();
        let waiting = tokio::spawn(async move { gate2.queue_and_wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(gate.live_count(), 2, "third waiter must not be admitted yet");

        drop(h1);
        let h3 = waiting.await.unwrap();
        assert_eq!(gate.live_count(), 2);
        drop(h2);
        drop(h3);
        assert_eq!(gate.live_count(), 0);
    }

    #[tokio::test]
    async fn serves_waiters_in_arrival_order() {
        let gate = FifoGate::new(1);
        let h0 = gate.queue_and_wait().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..5 {
            let gate = gate.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let handle = gate.queue_and_wait().await;
                order.lock().unwrap().push(i);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                drop(handle);
            }));
            tokio::task::yield_now().await;
        }
        drop(h0);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
