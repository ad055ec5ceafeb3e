//! The Shared Data Layer storage contract.
//!
//! [`SyncStorage`] is a namespace-scoped key-value interface. Keys are strings unique
//! within a namespace, values are opaque bytes. Groups are unordered sets of opaque
//! members stored under a key of the same namespace. Locks are named, expiring
//! mutual-exclusion resources handed out by [`SyncStorage::get_lock_resource`].
//!
//! Atomicity guarantees, per operation:
//!
//! | Operation                                   | Atomic w.r.t. concurrent callers |
//! |---------------------------------------------|----------------------------------|
//! | `set`, `remove` (whole batch)               | yes                              |
//! | `set_if`, `set_if_not_exists`, `remove_if`  | yes                              |
//! | group membership operations                 | yes                              |
//! | `find_keys`, `find_and_get`, `remove_all`   | **no**, and not isolated         |
//!
//! The pattern operations and `remove_all` walk a live, unbounded key set. Keys
//! written or removed while they run may or may not be reflected in their result,
//! and a `find_keys` followed by a separate `get` can disagree. There are no
//! multi-key transactions; a sequence of operations that must appear atomic has to
//! be wrapped in a lock.
//!
//! Nothing is cached client-side and no operation retries on its own, with the
//! single exception of the contention loop inside [`SyncLock::acquire`].
//!
//! Internally every key is stored as `{namespace},key`, with `\` and `}` inside the
//! namespace escaped by a backslash. The first unescaped `}` always ends the
//! namespace, so the prefixes of two different namespaces never overlap and any
//! non-empty string is a valid namespace.
//!
//! [`SyncLock::acquire`]: crate::lock::SyncLock::acquire

pub mod sdl;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{SdlError, SdlResult};
use crate::lock::SyncLock;

pub use self::sdl::SdlStorage;

/// Key to value mapping used for batch writes and read results, ordered by key.
pub type DataMap = BTreeMap<String, Vec<u8>>;

/// Synchronous access to SDL storage.
///
/// Every method either returns its documented value or fails with exactly one
/// [`SdlError`] category. A conditional operation whose precondition does not hold
/// returns `false`; that is a normal outcome, not an error.
pub trait SyncStorage: Send + Sync {
    /// Handle type returned by [`SyncStorage::get_lock_resource`].
    type Lock: SyncLock;

    /// Whether the backend is reachable. Never fails.
    fn is_active(&self) -> bool;

    /// Closes the backend connection. Every later call fails with `NotConnected`.
    fn close(&self) -> SdlResult<()>;

    /// Writes all pairs of `data` atomically, overwriting existing keys.
    fn set(&self, ns: &str, data: &DataMap) -> SdlResult<()>;

    /// Replaces the value of `key` with `new_data` only if it currently equals
    /// `old_data`. Returns whether the write happened.
    fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> SdlResult<bool>;

    /// Writes `data` only if `key` does not exist. The existence check and the write
    /// are one atomic step. Returns whether the write happened.
    fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> SdlResult<bool>;

    /// Reads the given keys. Only keys that exist appear in the result.
    fn get<K: AsRef<str>>(&self, ns: &str, keys: &[K]) -> SdlResult<DataMap>;

    /// Lists the keys matching a glob pattern (see [`crate::glob`]).
    ///
    /// Not atomic and not isolated.
    fn find_keys(&self, ns: &str, key_pattern: &str) -> SdlResult<Vec<String>>;

    /// Finds keys matching a glob pattern and reads their values.
    ///
    /// Not atomic and not isolated: a key removed between the scan and the read is
    /// simply left out.
    fn find_and_get(&self, ns: &str, key_pattern: &str) -> SdlResult<DataMap>;

    /// Removes the given keys atomically. Absent keys are ignored.
    fn remove<K: AsRef<str>>(&self, ns: &str, keys: &[K]) -> SdlResult<()>;

    /// Removes `key` only if its value currently equals `data`. Returns whether the
    /// removal happened.
    fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> SdlResult<bool>;

    /// Removes every key of the namespace, including groups and lock records.
    ///
    /// Not atomic and not isolated: keys written concurrently may survive.
    fn remove_all(&self, ns: &str) -> SdlResult<()>;

    /// Adds members to a group, creating it if needed. Existing members are ignored.
    fn add_member<M: AsRef<[u8]>>(&self, ns: &str, group: &str, members: &[M]) -> SdlResult<()>;

    /// Removes members from a group. Absent members and absent groups are ignored.
    fn remove_member<M: AsRef<[u8]>>(&self, ns: &str, group: &str, members: &[M]) -> SdlResult<()>;

    /// Drops a group with all its members. Absent groups are ignored.
    fn remove_group(&self, ns: &str, group: &str) -> SdlResult<()>;

    /// All members of a group; empty for an absent group.
    fn get_members(&self, ns: &str, group: &str) -> SdlResult<BTreeSet<Vec<u8>>>;

    /// Whether `member` belongs to the group; false for an absent group.
    fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> SdlResult<bool>;

    /// Number of members in the group; 0 for an absent group.
    fn group_size(&self, ns: &str, group: &str) -> SdlResult<usize>;

    /// Creates a lock handle for `resource` in `ns`. Nothing is acquired yet;
    /// `expiration` is the validity applied by each successful acquire or refresh.
    ///
    /// `expiration` must lie between [`MIN_LOCK_EXPIRATION`] and
    /// [`MAX_LOCK_EXPIRATION`].
    ///
    /// [`MIN_LOCK_EXPIRATION`]: crate::lock::MIN_LOCK_EXPIRATION
    /// [`MAX_LOCK_EXPIRATION`]: crate::lock::MAX_LOCK_EXPIRATION
    fn get_lock_resource(
        &self,
        ns: &str,
        resource: &str,
        expiration: Duration,
    ) -> SdlResult<Self::Lock>;
}

pub(crate) fn validate_namespace(ns: &str) -> SdlResult<()> {
    if ns.is_empty() {
        return Err(SdlError::invalid("namespace must not be empty"));
    }
    Ok(())
}

/// Checks a key, group name or lock name.
pub(crate) fn validate_name(what: &str, name: &str) -> SdlResult<()> {
    if name.is_empty() {
        return Err(SdlError::invalid(format!("{} must not be empty", what)));
    }
    Ok(())
}

pub(crate) fn namespace_prefix(ns: &str) -> String {
    let mut prefix = String::with_capacity(ns.len() + 3);
    prefix.push('{');
    for c in ns.chars() {
        if c == '\\' || c == '}' {
            prefix.push('\\');
        }
        prefix.push(c);
    }
    prefix.push_str("},");
    prefix
}

pub(crate) fn db_key(ns: &str, key: &str) -> String {
    namespace_prefix(ns) + key
}
