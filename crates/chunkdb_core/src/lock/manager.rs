//! Path-keyed reader/writer lock table.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// State of one path's lock.
#[derive(Debug, Default)]
struct LockState {
    /// Scoped readers.
    readers: usize,
    /// Whether a writer holds the lock.
    writer: bool,
    /// Writers blocked on this path. New readers queue behind them.
    writers_waiting: usize,
    /// Leased readers (iterators): lease id -> deadline.
    leases: HashMap<u64, Instant>,
}

impl LockState {
    fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.leases.is_empty() && self.writers_waiting == 0
    }

    fn has_readers(&self) -> bool {
        self.readers > 0 || !self.leases.is_empty()
    }

    /// Drops leases whose deadline has passed. Returns how many were revoked.
    fn revoke_expired(&mut self, now: Instant) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, deadline| *deadline > now);
        before - self.leases.len()
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.leases.values().min().copied()
    }
}

#[derive(Debug, Default)]
struct PathLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Process-wide table of reader/writer locks keyed by file path.
///
/// Every read of a chunk file holds a read lock on its path and every
/// mutation (write, rename target, delete) holds the write lock. Locks are
/// acquired through RAII guards and released on every exit path.
///
/// Iterators take *leased* read locks: the lease carries a deadline, and a
/// writer waiting on the path revokes leases whose deadline passed. This bounds
/// how long a stalled iterator can block a rollup without a timer thread.
///
/// # Deadlock avoidance
///
/// Callers that need several locks acquire them in
/// [`Range::lock_order`](crate::Range::lock_order) order.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<PathBuf, Arc<PathLock>>>,
    next_lease: AtomicU64,
}

impl LockManager {
    /// Creates an independent lock table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the process-wide lock table.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<LockManager>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(LockManager::new))
    }

    fn entry(&self, path: &Path) -> Arc<PathLock> {
        let mut table = self.table.lock();
        Arc::clone(table.entry(path.to_path_buf()).or_default())
    }

    /// Removes the table entry for `path` if nobody else references it.
    fn release_entry(&self, path: &Path, lock: &Arc<PathLock>) {
        if !lock.state.lock().is_idle() {
            return;
        }
        let mut table = self.table.lock();
        // The table and the caller hold the only references; nobody can clone
        // a new one while the table mutex is held.
        if Arc::strong_count(lock) == 2 && lock.state.lock().is_idle() {
            table.remove(path);
        }
    }

    /// Blocks until a read lock on `path` is held.
    pub fn acquire_read_lock(self: &Arc<Self>, path: &Path) -> ReadLockGuard {
        let lock = self.entry(path);
        {
            let mut state = lock.state.lock();
            while state.writer || state.writers_waiting > 0 {
                lock.cond.wait(&mut state);
            }
            state.readers += 1;
        }
        ReadLockGuard {
            manager: Arc::clone(self),
            path: path.to_path_buf(),
            lock,
        }
    }

    /// Blocks until the write lock on `path` is held.
    ///
    /// While waiting, expired iterator leases on the path are revoked.
    pub fn acquire_write_lock(self: &Arc<Self>, path: &Path) -> WriteLockGuard {
        let lock = self.entry(path);
        {
            let mut state = lock.state.lock();
            state.writers_waiting += 1;
            loop {
                let revoked = state.revoke_expired(Instant::now());
                if revoked > 0 {
                    tracing::warn!(
                        path = %path.display(),
                        revoked,
                        "revoked expired iterator leases"
                    );
                }
                if !state.writer && !state.has_readers() {
                    break;
                }
                match state.earliest_deadline() {
                    Some(deadline) => {
                        lock.cond.wait_until(&mut state, deadline);
                    }
                    None => lock.cond.wait(&mut state),
                }
            }
            state.writers_waiting -= 1;
            state.writer = true;
        }
        WriteLockGuard {
            manager: Arc::clone(self),
            path: path.to_path_buf(),
            lock,
        }
    }

    /// Acquires write locks on every path, in the given order.
    ///
    /// Duplicate paths are locked once.
    pub fn acquire_write_locks<I>(self: &Arc<Self>, paths: I) -> Vec<WriteLockGuard>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut guards: Vec<WriteLockGuard> = Vec::new();
        for path in paths {
            if guards.iter().any(|g| g.path == path) {
                continue;
            }
            guards.push(self.acquire_write_lock(&path));
        }
        guards
    }

    /// Blocks until a leased read lock on `path` is held.
    ///
    /// The lease expires `timeout` after acquisition unless renewed.
    pub fn acquire_leased_read_lock(
        self: &Arc<Self>,
        path: &Path,
        timeout: Duration,
    ) -> LeasedReadLock {
        let lock = self.entry(path);
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = lock.state.lock();
            while state.writer || state.writers_waiting > 0 {
                lock.cond.wait(&mut state);
            }
            state.leases.insert(id, Instant::now() + timeout);
        }
        LeasedReadLock {
            manager: Arc::clone(self),
            path: path.to_path_buf(),
            lock,
            id,
        }
    }

    /// Returns true if any reader or writer holds `path`.
    #[must_use]
    pub fn is_locked(&self, path: &Path) -> bool {
        let table = self.table.lock();
        table.get(path).is_some_and(|lock| {
            let state = lock.state.lock();
            state.writer || state.has_readers()
        })
    }

    /// Returns true if a writer holds `path`.
    #[must_use]
    pub fn is_write_locked(&self, path: &Path) -> bool {
        let table = self.table.lock();
        table
            .get(path)
            .is_some_and(|lock| lock.state.lock().writer)
    }

    /// Returns the number of readers (scoped and leased) holding `path`.
    #[must_use]
    pub fn reader_count(&self, path: &Path) -> usize {
        let table = self.table.lock();
        table.get(path).map_or(0, |lock| {
            let state = lock.state.lock();
            state.readers + state.leases.len()
        })
    }

    /// Returns the number of paths with a live table entry.
    #[must_use]
    pub fn tracked_paths(&self) -> usize {
        self.table.lock().len()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("tracked_paths", &self.tracked_paths())
            .finish_non_exhaustive()
    }
}

/// Scoped read lock on a path.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ReadLockGuard {
    manager: Arc<LockManager>,
    path: PathBuf,
    lock: Arc<PathLock>,
}

impl ReadLockGuard {
    /// Returns the locked path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReadLockGuard {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            state.readers -= 1;
        }
        self.lock.cond.notify_all();
        self.manager.release_entry(&self.path, &self.lock);
    }
}

impl fmt::Debug for ReadLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLockGuard").field("path", &self.path).finish()
    }
}

/// Scoped write lock on a path.
#[must_use = "the lock is released when the guard is dropped"]
pub struct WriteLockGuard {
    manager: Arc<LockManager>,
    path: PathBuf,
    lock: Arc<PathLock>,
}

impl WriteLockGuard {
    /// Returns the locked path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            state.writer = false;
        }
        self.lock.cond.notify_all();
        self.manager.release_entry(&self.path, &self.lock);
    }
}

impl fmt::Debug for WriteLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLockGuard").field("path", &self.path).finish()
    }
}

/// Read lock held by an iterator under a renewable lease.
#[must_use = "the lock is released when the lease is dropped"]
pub struct LeasedReadLock {
    manager: Arc<LockManager>,
    path: PathBuf,
    lock: Arc<PathLock>,
    id: u64,
}

impl LeasedReadLock {
    /// Returns the locked path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extends the lease to `timeout` from now.
    ///
    /// Fails if the lease already expired or a writer revoked it; the read
    /// lock is no longer held in that case.
    pub fn renew(&self, timeout: Duration) -> CoreResult<()> {
        let now = Instant::now();
        let mut state = self.lock.state.lock();
        match state.leases.get_mut(&self.id) {
            Some(deadline) if *deadline > now => {
                *deadline = now + timeout;
                Ok(())
            }
            Some(_) => {
                state.leases.remove(&self.id);
                drop(state);
                self.lock.cond.notify_all();
                Err(CoreError::iterator_closed("lease expired"))
            }
            None => Err(CoreError::iterator_closed("lease revoked by a writer")),
        }
    }

    /// Returns true if the lease is still held and not expired.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let state = self.lock.state.lock();
        state
            .leases
            .get(&self.id)
            .is_some_and(|deadline| *deadline > Instant::now())
    }
}

impl Drop for LeasedReadLock {
    fn drop(&mut self) {
        let removed = self.lock.state.lock().leases.remove(&self.id).is_some();
        if removed {
            self.lock.cond.notify_all();
        }
        self.manager.release_entry(&self.path, &self.lock);
    }
}

impl fmt::Debug for LeasedReadLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedReadLock")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn path(name: &str) -> PathBuf {
        PathBuf::from("/chunks").join(name)
    }

    #[test]
    fn readers_share_a_path() {
        let locks = LockManager::new();
        let a = locks.acquire_read_lock(&path("0_9"));
        let b = locks.acquire_read_lock(&path("0_9"));

        assert!(locks.is_locked(&path("0_9")));
        assert_eq!(locks.reader_count(&path("0_9")), 2);
        assert!(!locks.is_write_locked(&path("0_9")));

        drop(a);
        drop(b);
        assert!(!locks.is_locked(&path("0_9")));
        assert_eq!(locks.tracked_paths(), 0);
    }

    #[test]
    fn write_lock_is_released_on_drop() {
        let locks = LockManager::new();
        {
            let _guard = locks.acquire_write_lock(&path("0_9"));
            assert!(locks.is_write_locked(&path("0_9")));
        }
        assert!(!locks.is_locked(&path("0_9")));
    }

    #[test]
    fn different_paths_do_not_conflict() {
        let locks = LockManager::new();
        let _a = locks.acquire_write_lock(&path("0_9"));
        let _b = locks.acquire_write_lock(&path("10_19"));
        assert!(locks.is_write_locked(&path("0_9")));
        assert!(locks.is_write_locked(&path("10_19")));
    }

    #[test]
    fn writer_waits_for_reader() {
        let locks = LockManager::new();
        let reader = locks.acquire_read_lock(&path("0_9"));
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let locks = Arc::clone(&locks);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _w = locks.acquire_write_lock(&path("0_9"));
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(reader);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_released_when_thread_panics() {
        let locks = LockManager::new();
        let result = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let _w = locks.acquire_write_lock(&path("0_9"));
                panic!("boom");
            })
            .join()
        };
        assert!(result.is_err());
        assert!(!locks.is_locked(&path("0_9")));
    }

    #[test]
    fn duplicate_paths_are_locked_once() {
        let locks = LockManager::new();
        let guards = locks.acquire_write_locks(vec![path("a"), path("b"), path("a")]);
        assert_eq!(guards.len(), 2);
    }

    #[test]
    fn lease_renewal_keeps_lock() {
        let locks = LockManager::new();
        let lease = locks.acquire_leased_read_lock(&path("0_9"), Duration::from_millis(200));
        lease.renew(Duration::from_millis(200)).unwrap();
        assert!(lease.is_valid());
        assert_eq!(locks.reader_count(&path("0_9")), 1);
        drop(lease);
        assert!(!locks.is_locked(&path("0_9")));
    }

    #[test]
    fn expired_lease_cannot_be_renewed() {
        let locks = LockManager::new();
        let lease = locks.acquire_leased_read_lock(&path("0_9"), Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));

        assert!(!lease.is_valid());
        let err = lease.renew(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CoreError::IteratorClosed { .. }));
        assert!(!locks.is_locked(&path("0_9")));
    }

    #[test]
    fn writer_revokes_expired_lease() {
        let locks = LockManager::new();
        let lease = locks.acquire_leased_read_lock(&path("0_9"), Duration::from_millis(50));

        let started = Instant::now();
        let writer = locks.acquire_write_lock(&path("0_9"));
        assert!(started.elapsed() >= Duration::from_millis(40));
        drop(writer);

        assert!(lease.renew(Duration::from_secs(1)).is_err());
    }
}
