//! Locking primitives for archive controllers.
//!
//! [`ReentrantRwLock`] is a read/write lock that one thread may acquire
//! repeatedly in either mode. A thread that holds the write lock may also
//! take read holds, which it keeps after releasing the write lock
//! (downgrade). Upgrading is not supported: a thread holding read holds must
//! go through [`ReentrantRwLock::run_write_locked`], which releases them all,
//! runs the closure under the write lock and restores them.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Acquires a mutex lock, recovering from poisoned state if necessary.
///
/// Guarded state in this crate is kept consistent between statements, so the
/// data behind a poisoned mutex is still usable.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    read_holds: HashMap<ThreadId, usize>,
}

impl LockState {
    fn can_read(&self, me: ThreadId) -> bool {
        self.writer.is_none_or(|w| w == me)
    }

    fn can_write(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(w) => w == me,
            None => self.read_holds.is_empty(),
        }
    }
}

/// A reentrant read/write lock.
#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

/// A read hold; released on drop.
#[must_use = "the read hold is released immediately if the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
    _not_send: PhantomData<*const ()>,
}

/// A write hold; released on drop.
#[must_use = "the write hold is released immediately if the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
    _not_send: PhantomData<*const ()>,
}

impl ReentrantRwLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a read hold, blocking while another thread writes.
    pub fn read(&self) -> ReadGuard<'_> {
        self.acquire_read(1);
        ReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires a write hold, blocking while any other thread holds the lock.
    ///
    /// The calling thread must not hold read holds unless it already writes;
    /// use [`run_write_locked`](Self::run_write_locked) from read-locked code.
    pub fn write(&self) -> WriteGuard<'_> {
        let me = thread::current().id();
        let mut state = lock_or_recover(&self.state);
        debug_assert!(
            state.writer == Some(me) || !state.read_holds.contains_key(&me),
            "read to write lock upgrade is not supported"
        );
        while !state.can_write(me) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.writer = Some(me);
        state.write_holds += 1;
        WriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Returns how many read holds the current thread has.
    pub fn read_hold_count(&self) -> usize {
        let me = thread::current().id();
        lock_or_recover(&self.state)
            .read_holds
            .get(&me)
            .copied()
            .unwrap_or(0)
    }

    /// Returns `true` if the current thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        lock_or_recover(&self.state).writer == Some(thread::current().id())
    }

    /// Runs `f` under the write lock.
    ///
    /// All read holds of the current thread are released first and restored
    /// (while the write lock is still held) before returning, so two threads
    /// doing this concurrently cannot deadlock on an upgrade.
    pub fn run_write_locked<T>(&self, f: impl FnOnce() -> T) -> T {
        let held = self.release_all_reads();
        let write = self.write();
        let result = f();
        if held > 0 {
            self.acquire_read(held);
        }
        drop(write);
        result
    }

    fn acquire_read(&self, count: usize) {
        let me = thread::current().id();
        let mut state = lock_or_recover(&self.state);
        while !state.can_read(me) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *state.read_holds.entry(me).or_insert(0) += count;
    }

    fn release_all_reads(&self) -> usize {
        let me = thread::current().id();
        let mut state = lock_or_recover(&self.state);
        let held = state.read_holds.remove(&me).unwrap_or(0);
        if held > 0 {
            self.changed.notify_all();
        }
        held
    }

    fn release_read(&self) {
        let me = thread::current().id();
        let mut state = lock_or_recover(&self.state);
        if let Some(count) = state.read_holds.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.read_holds.remove(&me);
                self.changed.notify_all();
            }
        }
    }

    fn release_write(&self) {
        let mut state = lock_or_recover(&self.state);
        state.write_holds -= 1;
        if state.write_holds == 0 {
            state.writer = None;
            self.changed.notify_all();
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_read_is_reentrant() {
        let lock = ReentrantRwLock::new();
        let a = lock.read();
        let b = lock.read();
        assert_eq!(lock.read_hold_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.read_hold_count(), 0);
    }

    #[test]
    fn test_write_is_reentrant_and_allows_reads() {
        let lock = ReentrantRwLock::new();
        let w1 = lock.write();
        let w2 = lock.write();
        let r = lock.read();
        assert!(lock.is_write_locked_by_current_thread());
        drop(w2);
        drop(w1);
        assert!(!lock.is_write_locked_by_current_thread());
        assert_eq!(lock.read_hold_count(), 1);
        drop(r);
    }

    #[test]
    fn test_run_write_locked_restores_reads() {
        let lock = ReentrantRwLock::new();
        let _r1 = lock.read();
        let _r2 = lock.read();
        let value = lock.run_write_locked(|| {
            assert_eq!(lock.read_hold_count(), 0);
            assert!(lock.is_write_locked_by_current_thread());
            42
        });
        assert_eq!(value, 42);
        assert_eq!(lock.read_hold_count(), 2);
        assert!(!lock.is_write_locked_by_current_thread());
    }

    #[test]
    fn test_concurrent_upgrades_do_not_deadlock() {
        let lock = Arc::new(ReentrantRwLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _r = lock.read();
                        lock.run_write_locked(|| {
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(ReentrantRwLock::new());
        let entered = Arc::new(AtomicUsize::new(0));
        let w = lock.write();
        let handle = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _r = lock.read();
                entered.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(w);
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }
}
