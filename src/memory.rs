use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

use crate::prelude::*;

/// budget that chunk buffers are charged against.
pub trait MemoryManager: Send + Sync {
    /// hands `bytes` previously granted back to the budget.
    fn release(&self, bytes: u64);
}

#[derive(Debug)]
struct Budget {
    capacity: u64,
    available: u64,
}

/// fixed size memory budget, requests wait until enough memory is released.
#[derive(Debug)]
pub struct MemoryBudget {
    budget: Mutex<Budget>,
    released: Notify,
}

impl MemoryBudget {
    pub fn new(capacity: u64) -> Self {
        Self {
            budget: Mutex::new(Budget {
                capacity,
                available: capacity,
            }),
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity
    }

    pub fn available(&self) -> u64 {
        self.budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .available
    }

    pub fn try_request(&self, bytes: u64) -> bool {
        let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);
        if budget.available < bytes {
            return false;
        }

        budget.available -= bytes;
        trace!(bytes, available = budget.available, "memory granted");
        true
    }

    /// waits until `bytes` can be granted, fails right away if it never could be.
    pub async fn request(&self, bytes: u64) -> anyhow::Result<()> {
        if bytes > self.capacity() {
            anyhow::bail!(
                "requested {} bytes from a memory budget of {} bytes",
                bytes,
                self.capacity()
            );
        }

        loop {
            // register interest before checking so a release in between isn't missed.
            let released = self.released.notified();
            if self.try_request(bytes) {
                return Ok(());
            }

            debug!(bytes, "waiting for memory to be released");
            released.await;
        }
    }
}

impl MemoryManager for MemoryBudget {
    fn release(&self, bytes: u64) {
        let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(
            budget.available + bytes <= budget.capacity,
            "released {} bytes with only {} outstanding, memory accounting is broken",
            bytes,
            budget.capacity - budget.available
        );

        budget.available += bytes;
        trace!(bytes, available = budget.available, "memory released");
        drop(budget);

        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    #[rstest]
    fn test_try_request_and_release() {
        let budget = MemoryBudget::new(100);

        assert!(budget.try_request(60));
        assert!(!budget.try_request(41));
        assert_eq!(budget.available(), 40);

        budget.release(60);
        assert_eq!(budget.available(), 100);
    }

    #[rstest]
    #[should_panic(expected = "memory accounting is broken")]
    fn test_over_release_panics() {
        let budget = MemoryBudget::new(100);
        assert!(budget.try_request(10));
        budget.release(11);
    }

    #[rstest]
    #[tokio::test]
    async fn test_request_waits_for_release() -> anyhow::Result<()> {
        let budget = Arc::new(MemoryBudget::new(100));
        assert!(budget.try_request(80));

        let waiter = tokio::spawn({
            let budget = budget.clone();
            async move { budget.request(50).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        budget.release(80);
        tokio::time::timeout(Duration::from_secs(1), waiter).await???;
        assert_eq!(budget.available(), 50);
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_request_over_capacity() {
        let budget = MemoryBudget::new(10);
        assert!(budget.request(11).await.is_err());
    }
}
