//! Sled-backed persistent backend.
//!
//! All SDL data lives in one sled tree named `sdl`. Each stored value carries a
//! one-byte kind tag followed by its payload:
//!
//! - `0x00` plain value: raw bytes
//! - `0x01` group: `u32` member count, then `u32` length + bytes per member (sorted)
//! - `0x02` lock: `u64` expiry as unix milliseconds, then the holder token bytes
//!
//! Batch writes and deletes go through `apply_batch`, which sled applies atomically,
//! and multi-key reads run in a read-only transaction so they never observe half
//! of a batch.
//! Conditional primitives are read-modify-write loops closed by `compare_and_swap`
//! against the raw bytes that were read, so a racing writer forces a retry rather
//! than a lost update. Prefix scans use sled iterators, which are not isolated from
//! concurrent writers.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ::sled::transaction::{ConflictableTransactionError, TransactionError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Backend;
use crate::error::{SdlError, SdlResult};
use crate::glob::Pattern;

const TREE_NAME: &str = "sdl";

const TAG_VALUE: u8 = 0x00;
const TAG_GROUP: u8 = 0x01;
const TAG_LOCK: u8 = 0x02;

/// Configuration for the sled backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SledConfig {
    /// Directory where sled keeps its files.
    pub data_dir: PathBuf,

    /// Page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages to disk, in milliseconds.
    pub flush_interval_ms: u64,

    /// Delete the database when the backend is dropped.
    pub temporary: bool,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./rsdl-data"),
            cache_size_mb: 64,
            flush_interval_ms: 500,
            temporary: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Entry {
    Value(Vec<u8>),
    Group(BTreeSet<Vec<u8>>),
    Lock { token: String, expires_at_ms: u64 },
}

impl Entry {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Entry::Value(value) => {
                buf.push(TAG_VALUE);
                buf.extend_from_slice(value);
            }
            Entry::Group(members) => {
                buf.push(TAG_GROUP);
                buf.extend_from_slice(&(members.len() as u32).to_le_bytes());
                for member in members {
                    buf.extend_from_slice(&(member.len() as u32).to_le_bytes());
                    buf.extend_from_slice(member);
                }
            }
            Entry::Lock {
                token,
                expires_at_ms,
            } => {
                buf.push(TAG_LOCK);
                buf.extend_from_slice(&expires_at_ms.to_le_bytes());
                buf.extend_from_slice(token.as_bytes());
            }
        }
        buf
    }

    fn decode(data: &[u8]) -> SdlResult<Self> {
        let corrupt = |what: &str| SdlError::BackendError(format!("Corrupted entry: {}", what));

        let (&tag, payload) = data.split_first().ok_or_else(|| corrupt("empty"))?;
        match tag {
            TAG_VALUE => Ok(Entry::Value(payload.to_vec())),
            TAG_GROUP => {
                let count = read_u32(payload, 0).ok_or_else(|| corrupt("group header"))? as usize;
                let mut offset = 4;
                let mut members = BTreeSet::new();
                for _ in 0..count {
                    let len = read_u32(payload, offset)
                        .ok_or_else(|| corrupt("member length"))? as usize;
                    offset += 4;
                    let member = payload
                        .get(offset..offset + len)
                        .ok_or_else(|| corrupt("member bytes"))?;
                    members.insert(member.to_vec());
                    offset += len;
                }
                Ok(Entry::Group(members))
            }
            TAG_LOCK => {
                let expiry: [u8; 8] = payload
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| corrupt("lock expiry"))?;
                let token = std::str::from_utf8(&payload[8..])
                    .map_err(|_| corrupt("lock token"))?
                    .to_string();
                Ok(Entry::Lock {
                    token,
                    expires_at_ms: u64::from_le_bytes(expiry),
                })
            }
            other => Err(corrupt(&format!("unknown tag {:#04x}", other))),
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self, Entry::Lock { expires_at_ms, .. } if *expires_at_ms <= now_ms)
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn expiry_ms(expiration: Duration) -> u64 {
    let millis = u64::try_from(expiration.as_millis()).unwrap_or(u64::MAX);
    now_ms().saturating_add(millis)
}

/// What a read-modify-write step decided to do with the key.
enum Write {
    Keep,
    Put(Entry),
    Delete,
}

/// The persistent storage backend using sled.
pub struct SledBackend {
    db: ::sled::Db,
    tree: ::sled::Tree,
    connected: AtomicBool,
}

impl SledBackend {
    /// Opens (or creates) the database described by `config`.
    pub fn open(config: SledConfig) -> SdlResult<Self> {
        debug!("Opening sled backend at {:?}", config.data_dir);

        if !config.temporary {
            std::fs::create_dir_all(&config.data_dir).map_err(|e| {
                SdlError::BackendError(format!(
                    "Failed to create data directory {:?}: {}",
                    config.data_dir, e
                ))
            })?;
        }

        let db = ::sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .temporary(config.temporary)
            .open()
            .map_err(|e| SdlError::NotConnected(format!("Failed to open sled database: {}", e)))?;
        let tree = db.open_tree(TREE_NAME)?;

        info!(
            "Sled backend opened with cache_size={}MB, flush_interval={}ms",
            config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Self {
            db,
            tree,
            connected: AtomicBool::new(true),
        })
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> SdlResult<()> {
        self.ensure_connected()?;
        self.db.flush()?;
        Ok(())
    }

    fn ensure_connected(&self) -> SdlResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SdlError::NotConnected("sled backend is closed".to_string()))
        }
    }

    /// Runs one atomic read-modify-write on `key`.
    ///
    /// `step` sees the live entry (expired locks show up as `None`) and returns the
    /// write to perform plus the caller's result. The write is installed with a
    /// compare-and-swap against the exact bytes read; on conflict the step is rerun.
    fn update<T>(
        &self,
        key: &str,
        step: impl Fn(Option<Entry>) -> SdlResult<(Write, T)>,
    ) -> SdlResult<T> {
        self.ensure_connected()?;
        loop {
            let raw = self.tree.get(key)?;
            let live = match raw.as_deref().map(Entry::decode).transpose()? {
                Some(entry) if entry.is_expired(now_ms()) => None,
                other => other,
            };

            let (write, out) = step(live)?;
            let new = match write {
                Write::Keep => return Ok(out),
                Write::Put(entry) => Some(entry.encode()),
                Write::Delete => None,
            };

            match self.tree.compare_and_swap(key, raw, new)? {
                Ok(()) => return Ok(out),
                Err(_) => debug!(key, "Compare-and-swap conflict, retrying"),
            }
        }
    }

    /// Reads the live entry at `key` without modifying it.
    fn read(&self, key: &str) -> SdlResult<Option<Entry>> {
        self.ensure_connected()?;
        match self.tree.get(key)? {
            Some(raw) => {
                let entry = Entry::decode(&raw)?;
                Ok((!entry.is_expired(now_ms())).then_some(entry))
            }
            None => Ok(None),
        }
    }

    fn read_group(&self, key: &str) -> SdlResult<BTreeSet<Vec<u8>>> {
        match self.read(key)? {
            None => Ok(BTreeSet::new()),
            Some(Entry::Group(members)) => Ok(members),
            Some(_) => Err(SdlError::wrong_type(key)),
        }
    }
}

impl Backend for SledBackend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SdlResult<()> {
        self.flush()?;
        self.connected.store(false, Ordering::SeqCst);
        info!("Sled backend closed");
        Ok(())
    }

    fn set(&self, entries: &[(String, Vec<u8>)]) -> SdlResult<()> {
        self.ensure_connected()?;
        let mut batch = ::sled::Batch::default();
        for (key, value) in entries {
            batch.insert(key.as_bytes(), Entry::Value(value.clone()).encode());
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    fn set_if(&self, key: &str, old: &[u8], new: &[u8]) -> SdlResult<bool> {
        self.update(key, |live| match live {
            Some(Entry::Value(current)) if current == old => {
                Ok((Write::Put(Entry::Value(new.to_vec())), true))
            }
            Some(Entry::Value(_)) | None => Ok((Write::Keep, false)),
            Some(_) => Err(SdlError::wrong_type(key)),
        })
    }

    fn set_if_not_exists(&self, key: &str, value: &[u8]) -> SdlResult<bool> {
        self.update(key, |live| match live {
            None => Ok((Write::Put(Entry::Value(value.to_vec())), true)),
            Some(_) => Ok((Write::Keep, false)),
        })
    }

    fn get(&self, keys: &[String]) -> SdlResult<Vec<Option<Vec<u8>>>> {
        self.ensure_connected()?;

        // Read-only transaction so all keys come from one consistent view
        let raw = self
            .tree
            .transaction(|tx| {
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    values.push(tx.get(key.as_bytes())?);
                }
                Ok::<_, ConflictableTransactionError<()>>(values)
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => SdlError::from(e),
                TransactionError::Abort(()) => {
                    SdlError::BackendError("Read transaction aborted".to_string())
                }
            })?;

        raw.into_iter()
            .map(|value| match value {
                Some(raw) => match Entry::decode(&raw)? {
                    Entry::Value(value) => Ok(Some(value)),
                    _ => Ok(None),
                },
                None => Ok(None),
            })
            .collect()
    }

    fn scan(&self, prefix: &str, pattern: &Pattern) -> SdlResult<Vec<String>> {
        self.ensure_connected()?;
        let now = now_ms();
        let mut found = Vec::new();

        for item in self.tree.scan_prefix(prefix) {
            let (raw_key, raw_value) = item?;
            let key = String::from_utf8(raw_key.to_vec())
                .map_err(|_| SdlError::BackendError("Non UTF-8 key in store".to_string()))?;
            if Entry::decode(&raw_value)?.is_expired(now) {
                continue;
            }
            if pattern.matches(&key[prefix.len()..]) {
                found.push(key);
            }
        }

        Ok(found)
    }

    fn remove(&self, keys: &[String]) -> SdlResult<()> {
        self.ensure_connected()?;
        let mut batch = ::sled::Batch::default();
        for key in keys {
            batch.remove(key.as_bytes());
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    fn remove_if(&self, key: &str, value: &[u8]) -> SdlResult<bool> {
        self.update(key, |live| match live {
            Some(Entry::Value(current)) if current == value => Ok((Write::Delete, true)),
            Some(Entry::Value(_)) | None => Ok((Write::Keep, false)),
            Some(_) => Err(SdlError::wrong_type(key)),
        })
    }

    fn add_members(&self, key: &str, members: &[Vec<u8>]) -> SdlResult<()> {
        self.update(key, |live| {
            let mut group = match live {
                Some(Entry::Group(group)) => group,
                None => BTreeSet::new(),
                Some(_) => return Err(SdlError::wrong_type(key)),
            };
            let before = group.len();
            group.extend(members.iter().cloned());
            if group.len() == before {
                Ok((Write::Keep, ()))
            } else {
                Ok((Write::Put(Entry::Group(group)), ()))
            }
        })
    }

    fn remove_members(&self, key: &str, members: &[Vec<u8>]) -> SdlResult<()> {
        self.update(key, |live| {
            let mut group = match live {
                Some(Entry::Group(group)) => group,
                None => return Ok((Write::Keep, ())),
                Some(_) => return Err(SdlError::wrong_type(key)),
            };
            let before = group.len();
            for member in members {
                group.remove(member);
            }
            if group.is_empty() {
                Ok((Write::Delete, ()))
            } else if group.len() == before {
                Ok((Write::Keep, ()))
            } else {
                Ok((Write::Put(Entry::Group(group)), ()))
            }
        })
    }

    fn get_members(&self, key: &str) -> SdlResult<BTreeSet<Vec<u8>>> {
        self.read_group(key)
    }

    fn is_member(&self, key: &str, member: &[u8]) -> SdlResult<bool> {
        Ok(self.read_group(key)?.contains(member))
    }

    fn group_size(&self, key: &str) -> SdlResult<usize> {
        Ok(self.read_group(key)?.len())
    }

    fn lock_acquire(&self, key: &str, token: &str, expiration: Duration) -> SdlResult<bool> {
        self.update(key, |live| match live {
            None => Ok((
                Write::Put(Entry::Lock {
                    token: token.to_string(),
                    expires_at_ms: expiry_ms(expiration),
                }),
                true,
            )),
            Some(_) => Ok((Write::Keep, false)),
        })
    }

    fn lock_release(&self, key: &str, token: &str) -> SdlResult<bool> {
        self.update(key, |live| match live {
            Some(Entry::Lock { token: holder, .. }) if holder == token => Ok((Write::Delete, true)),
            Some(Entry::Lock { .. }) | None => Ok((Write::Keep, false)),
            Some(_) => Err(SdlError::wrong_type(key)),
        })
    }

    fn lock_refresh(&self, key: &str, token: &str, expiration: Duration) -> SdlResult<bool> {
        self.update(key, |live| match live {
            Some(Entry::Lock { token: holder, .. }) if holder == token => Ok((
                Write::Put(Entry::Lock {
                    token: holder,
                    expires_at_ms: expiry_ms(expiration),
                }),
                true,
            )),
            Some(Entry::Lock { .. }) | None => Ok((Write::Keep, false)),
            Some(_) => Err(SdlError::wrong_type(key)),
        })
    }

    fn lock_validity(&self, key: &str, token: &str) -> SdlResult<Option<Duration>> {
        match self.read(key)? {
            Some(Entry::Lock {
                token: holder,
                expires_at_ms,
            }) if holder == token => Ok(Some(Duration::from_millis(
                expires_at_ms.saturating_sub(now_ms()),
            ))),
            Some(Entry::Lock { .. }) | None => Ok(None),
            Some(_) => Err(SdlError::wrong_type(key)),
        }
    }
}
