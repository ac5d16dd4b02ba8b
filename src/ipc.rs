//! Cross-process bounded queue in anonymous shared memory.
//!
//! A fixed-capacity queue for trivially copyable records, laid out in one
//! `MAP_SHARED | MAP_ANONYMOUS` mapping as `{mutex, not_full, not_empty,
//! len, slots[N]}`. The mutex and condition variables are created in
//! process-shared mode, so the queue keeps working across `fork`: the
//! creating process owns the mapping, children operate on their inherited
//! view.
//!
//! Ordering is LIFO (both ends index `slots[len]`). The queue is an
//! admission pool, not an event log; no element is ever lost, but FIFO
//! fairness is not promised.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("shared queue setup failed: {0}")]
pub struct IpcError(String);

#[repr(C)]
struct Header {
    mutex: libc::pthread_mutex_t,
    not_full: libc::pthread_cond_t,
    not_empty: libc::pthread_cond_t,
    len: usize,
}

pub struct SharedQueue<T: Copy> {
    base: *mut u8,
    map_len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for SharedQueue<T> {}
unsafe impl<T: Copy + Send> Sync for SharedQueue<T> {}

impl<T: Copy> SharedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, IpcError> {
        assert!(capacity > 0, "capacity must be positive");
        let map_len = Self::slots_offset() + capacity * size_of::<T>();
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(IpcError(format!(
                "mmap: {}",
                std::io::Error::last_os_error()
            )));
        }
        let queue = Self {
            base: base.cast(),
            map_len,
            capacity,
            _marker: PhantomData,
        };
        unsafe {
            let header = queue.header();
            let mut mutex_attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut mutex_attr);
            libc::pthread_mutexattr_setpshared(&mut mutex_attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutex_init(&mut (*header).mutex, &mutex_attr);
            libc::pthread_mutexattr_destroy(&mut mutex_attr);

            let mut cond_attr: libc::pthread_condattr_t = std::mem::zeroed();
            libc::pthread_condattr_init(&mut cond_attr);
            libc::pthread_condattr_setpshared(&mut cond_attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_cond_init(&mut (*header).not_full, &cond_attr);
            libc::pthread_cond_init(&mut (*header).not_empty, &cond_attr);
            libc::pthread_condattr_destroy(&mut cond_attr);

            (*header).len = 0;
        }
        Ok(queue)
    }

    fn slots_offset() -> usize {
        let align = align_of::<T>().max(align_of::<usize>());
        size_of::<Header>().div_ceil(align) * align
    }

    fn header(&self) -> *mut Header {
        self.base.cast()
    }

    unsafe fn slot(&self, index: usize) -> *mut T {
        self.base.add(Self::slots_offset()).cast::<T>().add(index)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        unsafe {
            let header = self.header();
            libc::pthread_mutex_lock(&mut (*header).mutex);
            let len = (*header).len;
            libc::pthread_mutex_unlock(&mut (*header).mutex);
            len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks while the queue is full.
    pub fn enqueue(&self, value: T) {
        unsafe {
            let header = self.header();
            libc::pthread_mutex_lock(&mut (*header).mutex);
            while (*header).len == self.capacity {
                libc::pthread_cond_wait(&mut (*header).not_full, &mut (*header).mutex);
            }
            self.slot((*header).len).write(value);
            (*header).len += 1;
            libc::pthread_cond_broadcast(&mut (*header).not_empty);
            libc::pthread_mutex_unlock(&mut (*header).mutex);
        }
    }

    /// Blocks until an element is available.
    pub fn dequeue(&self) -> T {
        unsafe {
            let header = self.header();
            libc::pthread_mutex_lock(&mut (*header).mutex);
            while (*header).len == 0 {
                libc::pthread_cond_wait(&mut (*header).not_empty, &mut (*header).mutex);
            }
            (*header).len -= 1;
            let value = self.slot((*header).len).read();
            libc::pthread_cond_broadcast(&mut (*header).not_full);
            libc::pthread_mutex_unlock(&mut (*header).mutex);
            value
        }
    }
}

impl<T: Copy> Drop for SharedQueue<T> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lifo_order() {
        let queue = SharedQueue::<u32>::new(8).unwrap();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.dequeue(), 3);
        assert_eq!(queue.dequeue(), 2);
        queue.enqueue(4);
        assert_eq!(queue.dequeue(), 4);
        assert_eq!(queue.dequeue(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let queue = Arc::new(SharedQueue::<u64>::new(4).unwrap());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    queue.enqueue(i);
                    assert!(queue.len() <= queue.capacity());
                }
            })
        };
        let mut seen = Vec::with_capacity(1000);
        for _ in 0..1000 {
            seen.push(queue.dequeue());
        }
        producer.join().unwrap();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..1000).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_transfer_across_fork() {
        const COUNT: u64 = 64;
        // Capacity below COUNT so the child also exercises the full-queue
        // wait from the other side of the fork.
        let queue = SharedQueue::<u64>::new(8).unwrap();
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            for i in 0..COUNT {
                queue.enqueue(i);
            }
            unsafe { libc::_exit(0) };
        }
        let mut seen: Vec<u64> = (0..COUNT).map(|_| queue.dequeue()).collect();
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
        seen.sort_unstable();
        let expected: Vec<u64> = (0..COUNT).collect();
        assert_eq!(seen, expected);
    }
}
