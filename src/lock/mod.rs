//! Distributed, expiring locks on top of SDL storage.
//!
//! A lock is identified by `(namespace, name)` and is either free or held by exactly
//! one handle. Handles come from [`SyncStorage::get_lock_resource`] and carry a
//! random holder token; the backend records that token on a successful acquire, and
//! release, refresh and validity queries only act while the recorded token is still
//! this handle's. A handle whose lock expired and was taken over by someone else can
//! therefore never release or extend the new holder's claim.
//!
//! Expiry is the recovery mechanism for crashed holders: once the validity time
//! elapses without a refresh, the next acquire by anyone succeeds. A slow holder may
//! keep believing it owns an expired lock, so long critical sections should check
//! [`SyncLock::get_validity_time`] and [`SyncLock::refresh`] as they go.
//!
//! ```no_run
//! use std::time::Duration;
//! use rsdl::{SdlStorage, SyncLock, SyncStorage};
//!
//! let sdl = SdlStorage::in_memory();
//! let lock = sdl.get_lock_resource("ns", "resource", Duration::from_secs(5))?;
//! lock.with_lock(|| -> Result<(), rsdl::SdlError> {
//!     // exclusive section
//!     Ok(())
//! })?;
//! # Ok::<(), rsdl::SdlError>(())
//! ```
//!
//! [`SyncStorage::get_lock_resource`]: crate::storage::SyncStorage::get_lock_resource

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::LockConfig;
use crate::error::{SdlError, SdlResult};
use crate::storage::db_key;

/// Shortest accepted lock expiration. Sled records expiry in milliseconds.
pub const MIN_LOCK_EXPIRATION: Duration = Duration::from_millis(1);

/// Longest accepted lock expiration (one year).
pub const MAX_LOCK_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A handle on one named lock resource.
pub trait SyncLock: Send + Sync {
    /// Namespace the lock lives in.
    fn namespace(&self) -> &str;

    /// Lock name within the namespace.
    fn name(&self) -> &str;

    /// Validity applied by each successful acquire or refresh.
    fn expiration(&self) -> Duration;

    /// One atomic claim-if-free attempt, without retrying.
    fn try_acquire(&self) -> SdlResult<bool>;

    /// Retry parameters used by [`SyncLock::acquire_default`] and scoped acquisition.
    fn lock_config(&self) -> &LockConfig;

    /// Releases the lock if this handle holds it. Fails with `RejectedByBackend` when
    /// the lock is not held by this handle, e.g. because it already expired.
    fn release(&self) -> SdlResult<()>;

    /// Resets the remaining validity back to [`SyncLock::expiration`]. Fails with
    /// `RejectedByBackend` when the lock is not held by this handle.
    fn refresh(&self) -> SdlResult<()>;

    /// Remaining time until the lock expires. Fails with `RejectedByBackend` when the
    /// lock is not held by this handle.
    fn get_validity_time(&self) -> SdlResult<Duration>;

    /// Tries to acquire the lock, sleeping `retry_interval` between attempts.
    ///
    /// Returns `false` once `retry_timeout` has elapsed without success; contention
    /// is never an error. Backend failures abort the loop immediately.
    fn acquire(&self, retry_interval: Duration, retry_timeout: Duration) -> SdlResult<bool> {
        if retry_interval.is_zero() {
            return Err(SdlError::invalid("lock retry_interval must be non-zero"));
        }

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.try_acquire()? {
                debug!(ns = self.namespace(), name = self.name(), attempts, "Lock acquired");
                return Ok(true);
            }

            let elapsed = started.elapsed();
            if elapsed >= retry_timeout {
                debug!(
                    ns = self.namespace(),
                    name = self.name(),
                    attempts,
                    "Lock still contended after retry timeout"
                );
                return Ok(false);
            }
            std::thread::sleep(retry_interval.min(retry_timeout - elapsed));
        }
    }

    /// [`SyncLock::acquire`] with the handle's configured retry parameters.
    fn acquire_default(&self) -> SdlResult<bool> {
        let config = self.lock_config();
        self.acquire(config.retry_interval, config.retry_timeout)
    }

    /// Acquires the lock with the default retry parameters and returns a guard that
    /// releases it when dropped.
    ///
    /// Failing to acquire within the retry budget is reported as `RejectedByBackend`.
    fn lock(&self) -> SdlResult<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        if self.acquire_default()? {
            Ok(LockGuard {
                lock: self,
                released: false,
            })
        } else {
            Err(SdlError::RejectedByBackend(
                "Unable to acquire lock within the time specified".to_string(),
            ))
        }
    }

    /// Runs `work` while holding the lock and releases it on every exit path.
    ///
    /// If `work` succeeds but the release fails (typically because the lock expired
    /// during `work`), the release error is returned. If `work` fails, its error is
    /// returned and a release failure is only logged.
    fn with_lock<T, E, F>(&self, work: F) -> Result<T, E>
    where
        Self: Sized,
        F: FnOnce() -> Result<T, E>,
        E: From<SdlError>,
    {
        let guard = self.lock()?;
        match work() {
            Ok(value) => {
                guard.release()?;
                Ok(value)
            }
            Err(e) => {
                drop(guard);
                Err(e)
            }
        }
    }
}

/// Holds an acquired lock and releases it on drop.
///
/// Use [`LockGuard::release`] to observe release failures; a failed release during
/// drop is logged.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, L: SyncLock> {
    lock: &'a L,
    released: bool,
}

impl<'a, L: SyncLock> LockGuard<'a, L> {
    /// The lock handle this guard holds.
    pub fn handle(&self) -> &L {
        self.lock
    }

    /// Releases the lock now and reports the outcome.
    pub fn release(mut self) -> SdlResult<()> {
        self.released = true;
        self.lock.release()
    }
}

impl<L: SyncLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.release() {
            warn!(
                ns = self.lock.namespace(),
                name = self.lock.name(),
                error = %e,
                "Failed to release lock on scope exit"
            );
        }
    }
}

/// Lock handle backed by a [`Backend`].
pub struct SdlLock<B: Backend> {
    backend: Arc<B>,
    ns: String,
    name: String,
    key: String,
    expiration: Duration,
    token: String,
    config: LockConfig,
}

impl<B: Backend> std::fmt::Debug for SdlLock<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdlLock")
            .field("ns", &self.ns)
            .field("name", &self.name)
            .field("key", &self.key)
            .field("expiration", &self.expiration)
            .field("token", &self.token)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> SdlLock<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        ns: &str,
        name: &str,
        expiration: Duration,
        config: LockConfig,
    ) -> Self {
        Self {
            backend,
            ns: ns.to_string(),
            name: name.to_string(),
            key: db_key(ns, name),
            expiration,
            token: Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Holder token this handle records in the backend.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn not_held(&self, action: &str) -> SdlError {
        SdlError::RejectedByBackend(format!(
            "Cannot {} lock {} in namespace {}: not held by this handle",
            action, self.name, self.ns
        ))
    }
}

impl<B: Backend> SyncLock for SdlLock<B> {
    fn namespace(&self) -> &str {
        &self.ns
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn expiration(&self) -> Duration {
        self.expiration
    }

    fn lock_config(&self) -> &LockConfig {
        &self.config
    }

    fn try_acquire(&self) -> SdlResult<bool> {
        self.backend
            .lock_acquire(&self.key, &self.token, self.expiration)
    }

    fn release(&self) -> SdlResult<()> {
        if self.backend.lock_release(&self.key, &self.token)? {
            debug!(ns = %self.ns, name = %self.name, "Lock released");
            Ok(())
        } else {
            Err(self.not_held("release"))
        }
    }

    fn refresh(&self) -> SdlResult<()> {
        if self
            .backend
            .lock_refresh(&self.key, &self.token, self.expiration)?
        {
            debug!(ns = %self.ns, name = %self.name, "Lock refreshed");
            Ok(())
        } else {
            Err(self.not_held("refresh"))
        }
    }

    fn get_validity_time(&self) -> SdlResult<Duration> {
        self.backend
            .lock_validity(&self.key, &self.token)?
            .ok_or_else(|| self.not_held("query validity of"))
    }
}
