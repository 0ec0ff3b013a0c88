//! Global limit on concurrently running VMs.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::signal::CancelToken;

/// How often a waiting acquirer re-checks cancellation
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Counting semaphore of VM slots
#[derive(Debug)]
pub struct VmSlots {
    capacity: usize,
    available: Mutex<usize>,
    freed: Condvar,
}

impl VmSlots {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            available: Mutex::new(capacity),
            freed: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.count()
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for a free slot. Returns `None` if `cancel` fires first.
    pub fn acquire(self: &Arc<Self>, cancel: &CancelToken) -> Option<SlotPermit> {
        let mut available = self.count();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if *available > 0 {
                *available -= 1;
                return Some(SlotPermit {
                    slots: Arc::clone(self),
                });
            }
            available = match self.freed.wait_timeout(available, CANCEL_CHECK_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn release(&self) {
        let mut available = self.count();
        *available += 1;
        self.freed.notify_one();
    }
}

/// A held VM slot, released on drop
#[derive(Debug)]
pub struct SlotPermit {
    slots: Arc<VmSlots>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.slots.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_capacity_bound() {
        let slots = VmSlots::new(2);
        let token = CancelToken::new();
        let a = slots.acquire(&token).unwrap();
        let _b = slots.acquire(&token).unwrap();
        assert_eq!(slots.available(), 0);
        drop(a);
        assert_eq!(slots.available(), 1);
    }

    #[test]
    fn test_waiter_woken_by_release() {
        let slots = VmSlots::new(1);
        let token = CancelToken::new();
        let held = slots.acquire(&token).unwrap();

        let waiter = {
            let slots = Arc::clone(&slots);
            let token = token.clone();
            thread::spawn(move || slots.acquire(&token).is_some())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(slots.available(), 1);
    }

    #[test]
    fn test_cancel_while_waiting() {
        let slots = VmSlots::new(1);
        let token = CancelToken::new();
        let _held = slots.acquire(&token).unwrap();

        let waiter = {
            let slots = Arc::clone(&slots);
            let token = token.clone();
            thread::spawn(move || slots.acquire(&token).is_none())
        };
        let start = Instant::now();
        token.cancel();
        assert!(waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(slots.available(), 0);
    }
}
