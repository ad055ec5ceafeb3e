//! [`SyncStorage`] implemented over any [`Backend`].
//!
//! This layer validates arguments, maps namespace-relative keys to storage keys and
//! composes the non-atomic operations (`find_and_get`, `remove_all`) out of backend
//! scans. Atomicity of everything else is delegated to the backend primitive.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{db_key, namespace_prefix, validate_name, validate_namespace, DataMap, SyncStorage};
use crate::backend::{Backend, MemoryBackend, SledBackend};
use crate::config::{LockConfig, SdlConfig};
use crate::error::{SdlError, SdlResult};
use crate::glob::Pattern;
use crate::lock::{SdlLock, MAX_LOCK_EXPIRATION, MIN_LOCK_EXPIRATION};

/// Keys removed per backend batch by `remove_all`.
const REMOVE_ALL_BATCH: usize = 256;

/// SDL storage over a concrete backend.
pub struct SdlStorage<B: Backend> {
    backend: Arc<B>,
    lock_config: LockConfig,
}

impl SdlStorage<MemoryBackend> {
    /// Storage over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl SdlStorage<SledBackend> {
    /// Opens sled-backed storage as described by `config`.
    pub fn open_sled(config: &SdlConfig) -> SdlResult<Self> {
        config.validate()?;
        let backend = SledBackend::open(config.sled.clone())?;
        Ok(Self::with_lock_config(backend, config.lock.clone()))
    }
}

impl<B: Backend> SdlStorage<B> {
    pub fn new(backend: B) -> Self {
        Self::with_lock_config(backend, LockConfig::default())
    }

    /// Storage whose lock handles use `lock_config` for scoped acquisition.
    pub fn with_lock_config(backend: B, lock_config: LockConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            lock_config,
        }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn scan(&self, ns: &str, key_pattern: &str) -> SdlResult<Vec<String>> {
        validate_namespace(ns)?;
        let pattern = Pattern::new(key_pattern)?;
        self.backend.scan(&namespace_prefix(ns), &pattern)
    }

    fn db_keys<K: AsRef<str>>(ns: &str, keys: &[K]) -> SdlResult<Vec<String>> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                validate_name("key", key)?;
                Ok(db_key(ns, key))
            })
            .collect()
    }

    fn group_key(ns: &str, group: &str) -> SdlResult<String> {
        validate_namespace(ns)?;
        validate_name("group name", group)?;
        Ok(db_key(ns, group))
    }

    fn to_members<M: AsRef<[u8]>>(members: &[M]) -> Vec<Vec<u8>> {
        members.iter().map(|m| m.as_ref().to_vec()).collect()
    }
}

impl<B: Backend> SyncStorage for SdlStorage<B> {
    type Lock = SdlLock<B>;

    fn is_active(&self) -> bool {
        self.backend.is_connected()
    }

    fn close(&self) -> SdlResult<()> {
        self.backend.close()
    }

    fn set(&self, ns: &str, data: &DataMap) -> SdlResult<()> {
        validate_namespace(ns)?;
        let entries = data
            .iter()
            .map(|(key, value)| {
                validate_name("key", key)?;
                Ok((db_key(ns, key), value.clone()))
            })
            .collect::<SdlResult<Vec<_>>>()?;

        self.backend.set(&entries)?;
        debug!(ns, key_count = entries.len(), "Keys set");
        Ok(())
    }

    fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> SdlResult<bool> {
        validate_namespace(ns)?;
        validate_name("key", key)?;
        let written = self.backend.set_if(&db_key(ns, key), old_data, new_data)?;
        debug!(ns, key, written, "Conditional set");
        Ok(written)
    }

    fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> SdlResult<bool> {
        validate_namespace(ns)?;
        validate_name("key", key)?;
        let written = self.backend.set_if_not_exists(&db_key(ns, key), data)?;
        debug!(ns, key, written, "Set if not exists");
        Ok(written)
    }

    fn get<K: AsRef<str>>(&self, ns: &str, keys: &[K]) -> SdlResult<DataMap> {
        validate_namespace(ns)?;
        let db_keys = Self::db_keys(ns, keys)?;
        let values = self.backend.get(&db_keys)?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.as_ref().to_string(), v)))
            .collect())
    }

    fn find_keys(&self, ns: &str, key_pattern: &str) -> SdlResult<Vec<String>> {
        let prefix_len = namespace_prefix(ns).len();
        Ok(self
            .scan(ns, key_pattern)?
            .into_iter()
            .map(|db_key| db_key[prefix_len..].to_string())
            .collect())
    }

    fn find_and_get(&self, ns: &str, key_pattern: &str) -> SdlResult<DataMap> {
        let db_keys = self.scan(ns, key_pattern)?;
        if db_keys.is_empty() {
            return Ok(DataMap::new());
        }

        // Second round trip: anything removed since the scan comes back as None
        let values = self.backend.get(&db_keys)?;
        let prefix_len = namespace_prefix(ns).len();
        Ok(db_keys
            .into_iter()
            .zip(values)
            .filter_map(|(db_key, value)| value.map(|v| (db_key[prefix_len..].to_string(), v)))
            .collect())
    }

    fn remove<K: AsRef<str>>(&self, ns: &str, keys: &[K]) -> SdlResult<()> {
        validate_namespace(ns)?;
        let db_keys = Self::db_keys(ns, keys)?;
        self.backend.remove(&db_keys)?;
        debug!(ns, key_count = db_keys.len(), "Keys removed");
        Ok(())
    }

    fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> SdlResult<bool> {
        validate_namespace(ns)?;
        validate_name("key", key)?;
        let removed = self.backend.remove_if(&db_key(ns, key), data)?;
        debug!(ns, key, removed, "Conditional remove");
        Ok(removed)
    }

    fn remove_all(&self, ns: &str) -> SdlResult<()> {
        let db_keys = self.scan(ns, "*")?;
        for chunk in db_keys.chunks(REMOVE_ALL_BATCH) {
            self.backend.remove(chunk)?;
        }
        debug!(ns, key_count = db_keys.len(), "Namespace cleared");
        Ok(())
    }

    fn add_member<M: AsRef<[u8]>>(&self, ns: &str, group: &str, members: &[M]) -> SdlResult<()> {
        let key = Self::group_key(ns, group)?;
        self.backend.add_members(&key, &Self::to_members(members))?;
        debug!(ns, group, member_count = members.len(), "Members added");
        Ok(())
    }

    fn remove_member<M: AsRef<[u8]>>(&self, ns: &str, group: &str, members: &[M]) -> SdlResult<()> {
        let key = Self::group_key(ns, group)?;
        self.backend.remove_members(&key, &Self::to_members(members))?;
        debug!(ns, group, member_count = members.len(), "Members removed");
        Ok(())
    }

    fn remove_group(&self, ns: &str, group: &str) -> SdlResult<()> {
        let key = Self::group_key(ns, group)?;
        self.backend.remove(&[key])?;
        debug!(ns, group, "Group removed");
        Ok(())
    }

    fn get_members(&self, ns: &str, group: &str) -> SdlResult<BTreeSet<Vec<u8>>> {
        self.backend.get_members(&Self::group_key(ns, group)?)
    }

    fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> SdlResult<bool> {
        self.backend.is_member(&Self::group_key(ns, group)?, member)
    }

    fn group_size(&self, ns: &str, group: &str) -> SdlResult<usize> {
        self.backend.group_size(&Self::group_key(ns, group)?)
    }

    fn get_lock_resource(
        &self,
        ns: &str,
        resource: &str,
        expiration: Duration,
    ) -> SdlResult<SdlLock<B>> {
        validate_namespace(ns)?;
        validate_name("lock name", resource)?;
        if !(MIN_LOCK_EXPIRATION..=MAX_LOCK_EXPIRATION).contains(&expiration) {
            return Err(SdlError::invalid(format!(
                "lock expiration must be between {:?} and {:?}, got {:?}",
                MIN_LOCK_EXPIRATION, MAX_LOCK_EXPIRATION, expiration
            )));
        }
        Ok(SdlLock::new(
            Arc::clone(&self.backend),
            ns,
            resource,
            expiration,
            self.lock_config.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::lock::SyncLock;

    fn data(pairs: &[(&str, &str)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let sdl = SdlStorage::in_memory();
        sdl.set("n1", &data(&[("k", "one")])).unwrap();
        sdl.set("n2", &data(&[("k", "two")])).unwrap();

        assert_eq!(sdl.get("n1", &["k"]).unwrap()["k"], b"one");
        assert_eq!(sdl.find_keys("n2", "*").unwrap(), vec!["k".to_string()]);

        sdl.remove_all("n1").unwrap();
        assert!(sdl.get("n1", &["k"]).unwrap().is_empty());
        assert_eq!(sdl.get("n2", &["k"]).unwrap()["k"], b"two");
    }

    #[test]
    fn test_invalid_arguments() {
        let sdl = SdlStorage::in_memory();
        let kind = |r: SdlResult<()>| r.unwrap_err().kind();

        assert_eq!(kind(sdl.set("", &data(&[("k", "v")]))), ErrorKind::InvalidArgument);
        assert_eq!(kind(sdl.set("n", &data(&[("", "v")]))), ErrorKind::InvalidArgument);
        assert_eq!(kind(sdl.remove("n", &[""])), ErrorKind::InvalidArgument);
        assert_eq!(kind(sdl.add_member("n", "", &[b"m"])), ErrorKind::InvalidArgument);
        assert_eq!(
            sdl.find_keys("n", "[abc").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            sdl.get_lock_resource("n", "l", Duration::ZERO).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_namespaces_with_braces_are_isolated() {
        let sdl = SdlStorage::in_memory();
        sdl.set("a", &data(&[("{b},x", "plain")])).unwrap();
        sdl.set("a},{b", &data(&[("x", "braced")])).unwrap();

        assert_eq!(sdl.find_keys("a", "*").unwrap(), vec!["{b},x"]);
        assert_eq!(sdl.find_keys("a},{b", "*").unwrap(), vec!["x"]);
        assert_eq!(sdl.get("a},{b", &["x"]).unwrap()["x"], b"braced");

        sdl.remove_all("a},{b").unwrap();
        assert_eq!(sdl.get("a", &["{b},x"]).unwrap()["{b},x"], b"plain");
    }

    #[test]
    fn test_lock_expiration_bounds() {
        let sdl = SdlStorage::in_memory();
        let kind = |expiration| {
            sdl.get_lock_resource("n", "l", expiration)
                .err()
                .map(|e| e.kind())
        };

        assert_eq!(kind(Duration::MAX), Some(ErrorKind::InvalidArgument));
        assert_eq!(
            kind(MAX_LOCK_EXPIRATION + Duration::from_millis(1)),
            Some(ErrorKind::InvalidArgument)
        );
        assert_eq!(kind(MIN_LOCK_EXPIRATION), None);

        let lock = sdl.get_lock_resource("n", "l", MAX_LOCK_EXPIRATION).unwrap();
        assert!(lock.acquire(Duration::from_millis(10), Duration::ZERO).unwrap());
        lock.refresh().unwrap();
        let validity = lock.get_validity_time().unwrap();
        assert!(validity > MAX_LOCK_EXPIRATION - Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_batch_writes_nothing() {
        let sdl = SdlStorage::in_memory();
        let err = sdl.set("n", &data(&[("", "bad"), ("good", "v")])).unwrap_err();
        assert!(err.is_caller_error());
        assert!(sdl.get("n", &["good"]).unwrap().is_empty());
    }

    #[test]
    fn test_get_is_ordered_by_key() {
        let sdl = SdlStorage::in_memory();
        sdl.set("n", &data(&[("b", "2"), ("a", "1"), ("c", "3")])).unwrap();
        let keys: Vec<_> = sdl.get("n", &["c", "a", "b"]).unwrap().into_keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_find_and_get_skips_groups() {
        let sdl = SdlStorage::in_memory();
        sdl.set("n", &data(&[("k1", "v1")])).unwrap();
        sdl.add_member("n", "k2", &[b"m"]).unwrap();

        assert_eq!(sdl.find_keys("n", "k*").unwrap(), vec!["k1", "k2"]);
        let found = sdl.find_and_get("n", "k*").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["k1"], b"v1");
    }

    #[test]
    fn test_keys_with_special_characters() {
        let sdl = SdlStorage::in_memory();
        sdl.set("n", &data(&[("a*b", "1"), ("axb", "2")])).unwrap();
        assert_eq!(sdl.find_keys("n", "a\\*b").unwrap(), vec!["a*b"]);
        assert_eq!(sdl.find_keys("n", "a*b").unwrap().len(), 2);
    }

    #[test]
    fn test_closed_storage() {
        let sdl = SdlStorage::in_memory();
        assert!(sdl.is_active());
        sdl.close().unwrap();
        assert!(!sdl.is_active());
        assert_eq!(
            sdl.get("n", &["k"]).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }
}
