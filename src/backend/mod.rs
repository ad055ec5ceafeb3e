//! Backend adapters that sit underneath the storage contract.
//!
//! A [`Backend`] works on fully qualified storage keys (namespace prefix already
//! applied by the storage layer) and owns the atomicity of each primitive. Every
//! primitive except [`Backend::scan`] must be atomic with respect to concurrent
//! callers on the keys it names. `scan` is deliberately allowed to observe a moving
//! key set; the storage layer builds `find_keys`, `find_and_get` and `remove_all`
//! on top of it and documents them as non-atomic.
//!
//! Every stored key holds exactly one kind of entry: a plain value, a group (set of
//! members) or a lock record. Applying an operation for one kind to a key holding
//! another kind fails with `RejectedByBackend`, except plain reads, which simply do
//! not see non-value entries. Lock records whose validity has elapsed are treated as
//! absent by every primitive.

pub mod memory;
pub mod sled;

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::SdlResult;
use crate::glob::Pattern;

pub use self::memory::MemoryBackend;
pub use self::sled::{SledBackend, SledConfig};

/// Storage primitives a concrete store must provide.
pub trait Backend: Send + Sync + 'static {
    /// Whether the backend currently accepts requests.
    fn is_connected(&self) -> bool;

    /// Closes the backend. Later calls fail with `NotConnected`.
    fn close(&self) -> SdlResult<()>;

    /// Writes all pairs as one atomic batch, replacing whatever the keys held.
    fn set(&self, entries: &[(String, Vec<u8>)]) -> SdlResult<()>;

    /// Replaces the value of `key` only if it currently equals `old`.
    fn set_if(&self, key: &str, old: &[u8], new: &[u8]) -> SdlResult<bool>;

    /// Writes `value` only if `key` is absent.
    fn set_if_not_exists(&self, key: &str, value: &[u8]) -> SdlResult<bool>;

    /// Reads plain values; the result is positionally aligned with `keys`.
    fn get(&self, keys: &[String]) -> SdlResult<Vec<Option<Vec<u8>>>>;

    /// Lists keys starting with `prefix` whose remainder matches `pattern`.
    /// Not atomic and not isolated.
    fn scan(&self, prefix: &str, pattern: &Pattern) -> SdlResult<Vec<String>>;

    /// Deletes all keys as one atomic batch, whatever kind of entry they hold.
    fn remove(&self, keys: &[String]) -> SdlResult<()>;

    /// Deletes `key` only if its plain value currently equals `value`.
    fn remove_if(&self, key: &str, value: &[u8]) -> SdlResult<bool>;

    fn add_members(&self, key: &str, members: &[Vec<u8>]) -> SdlResult<()>;

    /// Removes members; the group entry disappears once it is empty.
    fn remove_members(&self, key: &str, members: &[Vec<u8>]) -> SdlResult<()>;

    fn get_members(&self, key: &str) -> SdlResult<BTreeSet<Vec<u8>>>;

    fn is_member(&self, key: &str, member: &[u8]) -> SdlResult<bool>;

    fn group_size(&self, key: &str) -> SdlResult<usize>;

    /// Claims the lock for `token` if nobody holds it.
    fn lock_acquire(&self, key: &str, token: &str, expiration: Duration) -> SdlResult<bool>;

    /// Deletes the lock record only if `token` still holds it.
    fn lock_release(&self, key: &str, token: &str) -> SdlResult<bool>;

    /// Resets the validity of the lock to `expiration` only if `token` holds it.
    fn lock_refresh(&self, key: &str, token: &str, expiration: Duration) -> SdlResult<bool>;

    /// Remaining validity of the lock if `token` holds it.
    fn lock_validity(&self, key: &str, token: &str) -> SdlResult<Option<Duration>>;
}
