use keycombo_core::config::LeaseBackend;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host mechanism that keeps the machine from suspending.
pub trait SuspendBlocker: Send + Sync {
    fn block(&self, name: &str) -> io::Result<()>;
    fn unblock(&self, name: &str) -> io::Result<()>;
}

/// Kernel wakelocks through `/sys/power/wake_lock` and `/sys/power/wake_unlock`.
pub struct SysfsWakeLock {
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

impl SysfsWakeLock {
    pub const LOCK_PATH: &'static str = "/sys/power/wake_lock";
    pub const UNLOCK_PATH: &'static str = "/sys/power/wake_unlock";

    pub fn new() -> Self {
        Self::with_paths(Self::LOCK_PATH, Self::UNLOCK_PATH)
    }

    pub fn with_paths(lock: impl Into<PathBuf>, unlock: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock.into(),
            unlock_path: unlock.into(),
        }
    }

    pub fn available() -> bool {
        Path::new(Self::LOCK_PATH).exists()
    }

    fn write_name(path: &Path, name: &str) -> io::Result<()> {
        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.write_all(name.as_bytes())
    }
}

impl SuspendBlocker for SysfsWakeLock {
    fn block(&self, name: &str) -> io::Result<()> {
        Self::write_name(&self.lock_path, name)
    }

    fn unblock(&self, name: &str) -> io::Result<()> {
        Self::write_name(&self.unlock_path, name)
    }
}

/// Used when the host has no suspend blocking to offer.
pub struct NoopBlocker;

impl SuspendBlocker for NoopBlocker {
    fn block(&self, name: &str) -> io::Result<()> {
        debug!(lease = name, "suspend block (noop)");
        Ok(())
    }

    fn unblock(&self, name: &str) -> io::Result<()> {
        debug!(lease = name, "suspend unblock (noop)");
        Ok(())
    }
}

/// Pick the blocker for the configured backend.
pub fn blocker_for(backend: LeaseBackend) -> Arc<dyn SuspendBlocker> {
    match backend {
        LeaseBackend::Wakelock => Arc::new(SysfsWakeLock::new()),
        LeaseBackend::Auto if SysfsWakeLock::available() => {
            info!("using kernel wakelocks for suspend blocking");
            Arc::new(SysfsWakeLock::new())
        }
        LeaseBackend::Auto => {
            info!("no wakelock interface, suspend blocking disabled");
            Arc::new(NoopBlocker)
        }
        LeaseBackend::Disabled => Arc::new(NoopBlocker),
    }
}

/// Reference-counted hold on the host's suspend blocker.
///
/// The first `acquire` blocks suspend, the matching last `release` unblocks it.
/// Host errors are logged; the count is kept regardless so accounting never drifts.
pub struct SuspendLease {
    name: String,
    count: Mutex<usize>,
    blocker: Arc<dyn SuspendBlocker>,
}

impl SuspendLease {
    pub fn new(name: impl Into<String>, blocker: Arc<dyn SuspendBlocker>) -> Self {
        Self {
            name: name.into(),
            count: Mutex::new(0),
            blocker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            if let Err(e) = self.blocker.block(&self.name) {
                warn!(lease = %self.name, error = %e, "failed to block suspend");
            }
        }
        *count += 1;
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            warn!(lease = %self.name, "lease released more often than acquired");
            return;
        }
        *count -= 1;
        if *count == 0 {
            if let Err(e) = self.blocker.unblock(&self.name) {
                warn!(lease = %self.name, error = %e, "failed to unblock suspend");
            }
        }
    }

    /// Drop every outstanding hold. Returns how many there were.
    pub fn release_all(&self) -> usize {
        let mut count = self.count.lock();
        let outstanding = *count;
        if outstanding > 0 {
            *count = 0;
            if let Err(e) = self.blocker.unblock(&self.name) {
                warn!(lease = %self.name, error = %e, "failed to unblock suspend");
            }
        }
        outstanding
    }

    pub fn held(&self) -> usize {
        *self.count.lock()
    }
}

/// Releases one hold on drop, so a panicking action still gives its lease back.
pub struct LeaseRelease(pub Arc<SuspendLease>);

impl Drop for LeaseRelease {
    fn drop(&mut self) {
        self.0.release();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingBlocker;
    use super::*;

    fn lease() -> (SuspendLease, Arc<CountingBlocker>) {
        let blocker = Arc::new(CountingBlocker::default());
        (SuspendLease::new("test", blocker.clone()), blocker)
    }

    #[test]
    fn first_acquire_blocks_last_release_unblocks() {
        let (lease, blocker) = lease();
        lease.acquire();
        assert!(blocker.blocked("test"));
        lease.acquire();
        lease.release();
        assert!(blocker.blocked("test"), "still one hold outstanding");
        lease.release();
        assert!(!blocker.blocked("test"));
        assert_eq!(blocker.transitions(), 2, "only edge transitions reach the host");
    }

    #[test]
    fn unbalanced_release_is_ignored() {
        let (lease, blocker) = lease();
        lease.release();
        assert_eq!(lease.held(), 0);
        assert_eq!(blocker.transitions(), 0);
    }

    #[test]
    fn release_all_clears_outstanding_holds() {
        let (lease, blocker) = lease();
        lease.acquire();
        lease.acquire();
        assert_eq!(lease.release_all(), 2);
        assert_eq!(lease.held(), 0);
        assert!(!blocker.blocked("test"));
        assert_eq!(lease.release_all(), 0);
    }

    #[test]
    fn lease_release_guard_releases_on_drop() {
        let blocker = Arc::new(CountingBlocker::default());
        let lease = Arc::new(SuspendLease::new("guarded", blocker.clone()));
        lease.acquire();
        drop(LeaseRelease(lease.clone()));
        assert_eq!(lease.held(), 0);
    }

    #[test]
    fn host_errors_do_not_break_accounting() {
        struct Failing;
        impl SuspendBlocker for Failing {
            fn block(&self, _: &str) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
            }
            fn unblock(&self, _: &str) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
            }
        }

        let lease = SuspendLease::new("failing", Arc::new(Failing));
        lease.acquire();
        assert_eq!(lease.held(), 1);
        lease.release();
        assert_eq!(lease.held(), 0);
    }

    #[test]
    fn sysfs_wakelock_writes_name_to_files() {
        let dir = std::env::temp_dir().join(format!("keycombo-wakelock-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let lock = dir.join("wake_lock");
        let unlock = dir.join("wake_unlock");
        std::fs::write(&lock, "").unwrap();
        std::fs::write(&unlock, "").unwrap();

        let wl = SysfsWakeLock::with_paths(&lock, &unlock);
        wl.block("keycombo").unwrap();
        wl.unblock("keycombo").unwrap();
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "keycombo");
        assert_eq!(std::fs::read_to_string(&unlock).unwrap(), "keycombo");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn disabled_backend_never_touches_sysfs() {
        let blocker = blocker_for(LeaseBackend::Disabled);
        assert!(blocker.block("x").is_ok());
        assert!(blocker.unblock("x").is_ok());
    }
}
