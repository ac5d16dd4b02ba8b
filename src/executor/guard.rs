//! Concurrency admission for the local executor.

use std::sync::{Condvar, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("too many concurrent executions: worker busy")]
pub struct TooManyExecutions;

/// Pool of execution slots for one worker process.
///
/// Owned by the executor and passed by reference; the slot count is fixed
/// at construction. Non-exclusive acquisition fails fast when the pool is
/// full; exclusive acquisition waits for the pool to drain and then claims
/// every slot, so the measurement runs alone.
pub struct ExecutionSlots {
    max: u32,
    busy: Mutex<u32>,
    idle: Condvar,
}

impl ExecutionSlots {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            busy: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn busy(&self) -> u32 {
        *self.busy.lock().unwrap()
    }

    pub fn acquire(&self, exclusive: bool) -> Result<SlotGuard<'_>, TooManyExecutions> {
        let mut busy = self.busy.lock().unwrap();
        if exclusive {
            while *busy != 0 {
                busy = self.idle.wait(busy).unwrap();
            }
            *busy = self.max;
        } else {
            if *busy == self.max {
                return Err(TooManyExecutions);
            }
            *busy += 1;
        }
        Ok(SlotGuard {
            slots: self,
            exclusive,
        })
    }
}

/// Releases the claimed slot (or all of them) on drop.
pub struct SlotGuard<'a> {
    slots: &'a ExecutionSlots,
    exclusive: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.slots.busy.lock().unwrap();
        *busy = if self.exclusive { 0 } else { *busy - 1 };
        self.slots.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fails_fast_when_full() {
        let slots = ExecutionSlots::new(2);
        let a = slots.acquire(false).unwrap();
        let _b = slots.acquire(false).unwrap();
        assert!(slots.acquire(false).is_err());
        drop(a);
        assert!(slots.acquire(false).is_ok());
    }

    #[test]
    fn test_exclusive_blocks_until_idle() {
        let slots = Arc::new(ExecutionSlots::new(4));
        let guard = slots.acquire(false).unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = {
            let slots = slots.clone();
            std::thread::spawn(move || {
                let claimed = slots.acquire(true).unwrap();
                tx.send(()).unwrap();
                drop(claimed);
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(slots.busy(), 0);
    }

    #[test]
    fn test_exclusive_claims_all_slots() {
        let slots = ExecutionSlots::new(3);
        let guard = slots.acquire(true).unwrap();
        assert_eq!(slots.busy(), 3);
        assert!(slots.acquire(false).is_err());
        drop(guard);
        assert_eq!(slots.busy(), 0);
    }
}
