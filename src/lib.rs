//! # rsdl: Shared Data Layer client
//!
//! rsdl is a namespace-scoped, backend-agnostic key-value storage client for sharing
//! small pieces of state between processes. It provides:
//!
//! - **Atomic batches**: multi-key `set` and `remove` that are all-or-nothing
//! - **Conditional writes**: compare-and-swap, set-if-absent, compare-and-delete
//! - **Key discovery**: glob pattern scans (deliberately non-atomic)
//! - **Groups**: unordered sets of opaque members stored under a key
//! - **Distributed locks**: expiring, token-guarded mutual exclusion with scoped release
//! - **Pluggable backends**: an in-memory map and a persistent sled store
//!
//! # Usage
//!
//! ```
//! use rsdl::{DataMap, SdlStorage, SyncStorage};
//!
//! let sdl = SdlStorage::in_memory();
//! let mut data = DataMap::new();
//! data.insert("peer".to_string(), b"10.0.0.7".to_vec());
//! sdl.set("ran", &data)?;
//!
//! assert!(sdl.set_if("ran", "peer", b"10.0.0.7", b"10.0.0.8")?);
//! assert_eq!(sdl.get("ran", &["peer", "missing"])?.len(), 1);
//! # Ok::<(), rsdl::SdlError>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod glob;
pub mod lock;
pub mod storage;

// Re-export main types at crate root for convenience
pub use backend::{Backend, MemoryBackend, SledBackend, SledConfig};
pub use config::{BackendKind, LockConfig, SdlConfig};
pub use error::{ErrorKind, SdlError, SdlResult};
pub use glob::Pattern;
pub use lock::{LockGuard, SdlLock, SyncLock, MAX_LOCK_EXPIRATION, MIN_LOCK_EXPIRATION};
pub use storage::{DataMap, SdlStorage, SyncStorage};
