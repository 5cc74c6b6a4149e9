//! Client pooling: bounded concurrent leases with FIFO waiters.
//!
//! A lease is a [`PoolContract`]: created when a slot is granted, returning
//! the slot on drop. Releasing a slot hands it directly to the head of the
//! waiter queue when one exists; the counter only grows when nobody waits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Bounded slot holder shared by all clients of one pool.
#[derive(Debug, Clone)]
pub struct PoolHolder {
    shared: Arc<PoolShared>,
}

#[derive(Debug)]
struct PoolShared {
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    size: i64,
    /// Slots currently free. May go negative transiently across a resize.
    available: i64,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl PoolHolder {
    pub fn new(size: usize) -> Self {
        PoolHolder {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    size: size as i64,
                    available: size as i64,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().unwrap().size.max(0) as usize
    }

    /// Leases currently outstanding.
    pub fn in_use(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        (state.size - state.available).max(0) as usize
    }

    /// Acquires a lease, waiting in arrival order when the pool is
    /// exhausted.
    pub async fn acquire_contract(&self) -> PoolContract {
        let waiter = {
            let mut state = self.shared.state.lock().unwrap();
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // A dropped sender means the pool itself went away; treat the
            // wakeup as granted so the contract can still resolve.
            let _ = rx.await;
        }

        PoolContract {
            shared: Some(self.shared.clone()),
        }
    }

    /// Rebases the slot counter by the size delta, leaving in-flight
    /// leases valid. Growing the pool wakes queued waiters for the new
    /// slots.
    pub fn resize(&self, new_size: usize) {
        let mut state = self.shared.state.lock().unwrap();
        let delta = new_size as i64 - state.size;
        if delta == 0 {
            return;
        }

        state.size = new_size as i64;
        state.available += delta;

        while state.available > 0 {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    state.available -= 1;
                    if waiter.send(()).is_err() {
                        // The waiter gave up; its slot returns.
                        state.available += 1;
                    }
                }
                None => break,
            }
        }
    }
}

impl PoolShared {
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.waiters.pop_front() {
                // Hand the slot straight to the first waiter; the counter
                // stays put.
                Some(waiter) => {
                    if waiter.send(()).is_ok() {
                        return;
                    }
                    // Abandoned waiter: try the next.
                }
                None => {
                    state.available += 1;
                    return;
                }
            }
        }
    }
}

/// A live lease on one pool slot. Exactly one contract exists per leased
/// slot; dropping it returns the slot (possibly waking a queued waiter).
#[derive(Debug)]
pub struct PoolContract {
    shared: Option<Arc<PoolShared>>,
}

impl PoolContract {
    /// Releases the lease explicitly; equivalent to dropping.
    pub fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl Drop for PoolContract {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_up_to_size() {
        let pool = PoolHolder::new(2);
        let a = pool.acquire_contract().await;
        let b = pool.acquire_contract().await;
        assert_eq!(pool.in_use(), 2);
        drop(a);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_fifo_order() {
        let pool = PoolHolder::new(2);
        let held: Vec<_> = vec![
            pool.acquire_contract().await,
            pool.acquire_contract().await,
        ];

        // Three more acquirers than slots; they must resolve in arrival
        // order as slots free up.
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let contract = pool.acquire_contract().await;
                order.lock().unwrap().push(i);
                // Hold briefly so later waiters stay queued.
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(contract);
            }));
            // Give each acquirer time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(order.lock().unwrap().is_empty());

        for contract in held {
            drop(contract);
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_resize_rebases_counter() {
        let pool = PoolHolder::new(3);
        let _a = pool.acquire_contract().await;
        let _b = pool.acquire_contract().await;

        // Shrinking below the in-flight count keeps leases valid.
        pool.resize(1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.in_use(), 2);

        // Growing wakes a queued waiter.
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire_contract().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        pool.resize(4);
        let contract = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("resize should wake the waiter")
            .unwrap();
        drop(contract);
    }
}
