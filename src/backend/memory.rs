//! Process-local backend: an ordered map behind a single mutex.
//!
//! Every atomic primitive runs entirely under the mutex, which gives the
//! all-or-nothing and single-winner guarantees the storage contract needs. Scans
//! walk the map in fixed-size batches and drop the mutex between batches, the same
//! way a cursor-based scan over a live remote store behaves: writers may slip in
//! between batches, so a scan can miss keys written behind the cursor or report keys
//! that are deleted right after.
//!
//! Lock expiry is lazy: an expired lock record is ignored on access and purged when
//! the key is next touched.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::Backend;
use crate::error::{SdlError, SdlResult};
use crate::glob::Pattern;

/// Number of map entries inspected per scan batch before the mutex is released.
const SCAN_BATCH: usize = 64;

#[derive(Clone, Debug)]
enum Entry {
    Value(Vec<u8>),
    Group(BTreeSet<Vec<u8>>),
    Lock { token: String, expires_at: Instant },
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Lock { expires_at, .. } if *expires_at <= now)
    }
}

/// Instant at which a lock taken now with `expiration` runs out.
fn deadline(expiration: Duration) -> SdlResult<Instant> {
    Instant::now().checked_add(expiration).ok_or_else(|| {
        SdlError::invalid(format!("lock expiration {:?} is out of range", expiration))
    })
}

/// In-memory backend, mainly for tests and single-process use.
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Entry>>,
    connected: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates the connection going down or coming back. While disconnected every
    /// primitive fails with `NotConnected`; stored data is kept.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        debug!(connected, "Memory backend connectivity changed");
    }

    /// Number of live entries across all namespaces.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_connected(&self) -> SdlResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SdlError::NotConnected(
                "memory backend is disconnected".to_string(),
            ))
        }
    }

    /// Looks up a live entry, purging it first if it is an expired lock.
    fn live<'a>(map: &'a mut BTreeMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if map.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn value_of<'a>(
        map: &'a mut BTreeMap<String, Entry>,
        key: &str,
    ) -> SdlResult<Option<&'a mut Vec<u8>>> {
        match Self::live(map, key) {
            None => Ok(None),
            Some(Entry::Value(v)) => Ok(Some(v)),
            Some(_) => Err(SdlError::wrong_type(key)),
        }
    }

    fn group_of<'a>(
        map: &'a mut BTreeMap<String, Entry>,
        key: &str,
    ) -> SdlResult<Option<&'a mut BTreeSet<Vec<u8>>>> {
        match Self::live(map, key) {
            None => Ok(None),
            Some(Entry::Group(g)) => Ok(Some(g)),
            Some(_) => Err(SdlError::wrong_type(key)),
        }
    }

    fn held_lock<'a>(
        map: &'a mut BTreeMap<String, Entry>,
        key: &str,
        token: &str,
    ) -> SdlResult<Option<&'a mut Instant>> {
        match Self::live(map, key) {
            Some(Entry::Lock {
                token: holder,
                expires_at,
            }) if holder == token => Ok(Some(expires_at)),
            Some(Entry::Lock { .. }) | None => Ok(None),
            Some(_) => Err(SdlError::wrong_type(key)),
        }
    }
}

impl Backend for MemoryBackend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SdlResult<()> {
        self.ensure_connected()?;
        self.connected.store(false, Ordering::SeqCst);
        info!("Memory backend closed");
        Ok(())
    }

    fn set(&self, entries: &[(String, Vec<u8>)]) -> SdlResult<()> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(key.clone(), Entry::Value(value.clone()));
        }
        Ok(())
    }

    fn set_if(&self, key: &str, old: &[u8], new: &[u8]) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        match Self::value_of(&mut map, key)? {
            Some(current) if current.as_slice() == old => {
                *current = new.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_if_not_exists(&self, key: &str, value: &[u8]) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        if Self::live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::Value(value.to_vec()));
        Ok(true)
    }

    fn get(&self, keys: &[String]) -> SdlResult<Vec<Option<Vec<u8>>>> {
        self.ensure_connected()?;
        let map = self.entries.lock();
        Ok(keys
            .iter()
            .map(|key| match map.get(key) {
                Some(Entry::Value(v)) => Some(v.clone()),
                _ => None,
            })
            .collect())
    }

    fn scan(&self, prefix: &str, pattern: &Pattern) -> SdlResult<Vec<String>> {
        let mut found = Vec::new();
        let mut cursor = Bound::Included(prefix.to_string());

        loop {
            self.ensure_connected()?;
            let map = self.entries.lock();
            let now = Instant::now();
            let mut inspected = 0;
            let mut last_seen = None;
            let mut exhausted = true;

            for (key, entry) in map.range((cursor.clone(), Bound::Unbounded)) {
                if !key.starts_with(prefix) {
                    break;
                }
                if inspected == SCAN_BATCH {
                    exhausted = false;
                    break;
                }
                inspected += 1;
                last_seen = Some(key.clone());
                if !entry.is_expired(now) && pattern.matches(&key[prefix.len()..]) {
                    found.push(key.clone());
                }
            }
            drop(map);

            match last_seen {
                Some(key) if !exhausted => cursor = Bound::Excluded(key),
                _ => break,
            }
        }

        Ok(found)
    }

    fn remove(&self, keys: &[String]) -> SdlResult<()> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn remove_if(&self, key: &str, value: &[u8]) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        let matched =
            Self::value_of(&mut map, key)?.is_some_and(|current| current.as_slice() == value);
        if matched {
            map.remove(key);
        }
        Ok(matched)
    }

    fn add_members(&self, key: &str, members: &[Vec<u8>]) -> SdlResult<()> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        match Self::group_of(&mut map, key)? {
            Some(group) => group.extend(members.iter().cloned()),
            None => {
                if !members.is_empty() {
                    let group = members.iter().cloned().collect();
                    map.insert(key.to_string(), Entry::Group(group));
                }
            }
        }
        Ok(())
    }

    fn remove_members(&self, key: &str, members: &[Vec<u8>]) -> SdlResult<()> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        let now_empty = match Self::group_of(&mut map, key)? {
            Some(group) => {
                for member in members {
                    group.remove(member);
                }
                group.is_empty()
            }
            None => false,
        };
        if now_empty {
            map.remove(key);
        }
        Ok(())
    }

    fn get_members(&self, key: &str) -> SdlResult<BTreeSet<Vec<u8>>> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        Ok(Self::group_of(&mut map, key)?.cloned().unwrap_or_default())
    }

    fn is_member(&self, key: &str, member: &[u8]) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        Ok(Self::group_of(&mut map, key)?.is_some_and(|g| g.contains(member)))
    }

    fn group_size(&self, key: &str) -> SdlResult<usize> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        Ok(Self::group_of(&mut map, key)?.map_or(0, |g| g.len()))
    }

    fn lock_acquire(&self, key: &str, token: &str, expiration: Duration) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        if Self::live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry::Lock {
                token: token.to_string(),
                expires_at: deadline(expiration)?,
            },
        );
        Ok(true)
    }

    fn lock_release(&self, key: &str, token: &str) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        if Self::held_lock(&mut map, key, token)?.is_none() {
            return Ok(false);
        }
        map.remove(key);
        Ok(true)
    }

    fn lock_refresh(&self, key: &str, token: &str, expiration: Duration) -> SdlResult<bool> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        let new_deadline = deadline(expiration)?;
        match Self::held_lock(&mut map, key, token)? {
            Some(expires_at) => {
                *expires_at = new_deadline;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lock_validity(&self, key: &str, token: &str) -> SdlResult<Option<Duration>> {
        self.ensure_connected()?;
        let mut map = self.entries.lock();
        Ok(Self::held_lock(&mut map, key, token)?
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now())))
    }
}
