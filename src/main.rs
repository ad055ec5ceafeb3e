//! # rsdl - Shared Data Layer command-line tool
//!
//! Small front end over the rsdl library for inspecting and editing SDL data from a
//! shell: health checks, key-value reads and writes, pattern searches, groups and
//! lock holding. Values are taken and printed as UTF-8 text.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use rsdl::{BackendKind, DataMap, SdlConfig, SdlStorage, SyncLock, SyncStorage};

/// Command-line access to a Shared Data Layer store.
#[derive(Parser, Debug)]
#[command(
    name = "rsdl",
    version,
    about = "Shared Data Layer client: namespaced key-value storage, groups and locks"
)]
struct Args {
    /// Backend to operate on - 'sled' (persistent) or 'memory' (lives for one command).
    #[arg(long, default_value = "sled")]
    backend: String,

    /// Path to the sled data directory.
    #[arg(long, default_value = "rsdl-data")]
    data_dir: String,

    /// Sled page cache size in megabytes.
    #[arg(long, default_value_t = 64)]
    cache_size_mb: u64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the backend is reachable.
    Healthcheck,

    /// Write one key.
    Set { ns: String, key: String, value: String },

    /// Read one or more keys.
    Get {
        ns: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// List keys matching a glob pattern.
    Find { ns: String, pattern: String },

    /// List keys matching a glob pattern together with their values.
    FindAndGet { ns: String, pattern: String },

    /// Remove one or more keys.
    Remove {
        ns: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Remove every key of a namespace.
    RemoveAll { ns: String },

    /// Add members to a group.
    AddMember {
        ns: String,
        group: String,
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// Remove members from a group.
    RemoveMember {
        ns: String,
        group: String,
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// Print the members of a group.
    Members { ns: String, group: String },

    /// Acquire a lock, hold it for a while, then release it.
    Lock {
        ns: String,
        name: String,

        /// Lock expiration in seconds.
        #[arg(long, default_value_t = 10.0)]
        expiration: f64,

        /// How long to hold the lock, in seconds.
        #[arg(long, default_value_t = 1.0)]
        hold: f64,

        /// Give up acquiring after this many seconds.
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_config(&args)?;
    config.validate()?;

    let result = match config.backend {
        BackendKind::Memory => run(&SdlStorage::in_memory(), args.command),
        BackendKind::Sled => {
            let storage = SdlStorage::open_sled(&config)
                .with_context(|| format!("failed to open sled data directory {}", args.data_dir))?;
            let result = run(&storage, args.command);
            storage.close()?;
            result
        }
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'warn'", log_level);
            EnvFilter::new("warn")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Build SdlConfig from CLI arguments.
fn build_config(args: &Args) -> anyhow::Result<SdlConfig> {
    let backend: BackendKind = args.backend.parse()?;
    let mut config = SdlConfig::sled(PathBuf::from(&args.data_dir));
    config.backend = backend;
    config.sled.cache_size_mb = args.cache_size_mb;
    Ok(config)
}

/// Parse a duration given in (possibly fractional) seconds.
fn parse_seconds(what: &str, secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid {}: {}", what, secs))
}

fn run<S: SyncStorage>(sdl: &S, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Healthcheck => {
            if sdl.is_active() {
                println!("OK");
            } else {
                anyhow::bail!("backend is not active");
            }
        }
        Command::Set { ns, key, value } => {
            let mut data = DataMap::new();
            data.insert(key, value.into_bytes());
            sdl.set(&ns, &data)?;
        }
        Command::Get { ns, keys } => {
            for (key, value) in sdl.get(&ns, &keys[..])? {
                println!("{}: {}", key, String::from_utf8_lossy(&value));
            }
        }
        Command::Find { ns, pattern } => {
            for key in sdl.find_keys(&ns, &pattern)? {
                println!("{}", key);
            }
        }
        Command::FindAndGet { ns, pattern } => {
            for (key, value) in sdl.find_and_get(&ns, &pattern)? {
                println!("{}: {}", key, String::from_utf8_lossy(&value));
            }
        }
        Command::Remove { ns, keys } => sdl.remove(&ns, &keys[..])?,
        Command::RemoveAll { ns } => sdl.remove_all(&ns)?,
        Command::AddMember { ns, group, members } => sdl.add_member(&ns, &group, &members[..])?,
        Command::RemoveMember { ns, group, members } => {
            sdl.remove_member(&ns, &group, &members[..])?
        }
        Command::Members { ns, group } => {
            for member in sdl.get_members(&ns, &group)? {
                println!("{}", String::from_utf8_lossy(&member));
            }
        }
        Command::Lock {
            ns,
            name,
            expiration,
            hold,
            timeout,
        } => {
            let expiration = parse_seconds("expiration", expiration)?;
            let hold = parse_seconds("hold", hold)?;
            let timeout = parse_seconds("timeout", timeout)?;

            let lock = sdl.get_lock_resource(&ns, &name, expiration)?;
            let interval = lock.lock_config().retry_interval;
            if !lock.acquire(interval, timeout)? {
                anyhow::bail!("lock {} in namespace {} is held by someone else", name, ns);
            }
            info!(ns = %ns, name = %name, "Lock acquired, holding for {:?}", hold);
            println!("acquired {}/{}", ns, name);

            std::thread::sleep(hold);
            lock.release()?;
            println!("released {}/{}", ns, name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["rsdl"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_build_config_defaults() {
        let config = build_config(&args(&["healthcheck"])).unwrap();
        assert_eq!(config.backend, BackendKind::Sled);
        assert_eq!(config.sled.data_dir, PathBuf::from("rsdl-data"));
        assert_eq!(config.sled.cache_size_mb, 64);
    }

    #[test]
    fn test_build_config_rejects_unknown_backend() {
        assert!(build_config(&args(&["--backend", "redis", "healthcheck"])).is_err());
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(
            parse_seconds("hold", 0.25).unwrap(),
            Duration::from_millis(250)
        );
        assert!(parse_seconds("hold", -1.0).is_err());
        assert!(parse_seconds("hold", f64::NAN).is_err());
    }

    #[test]
    fn test_run_against_memory_backend() {
        let sdl = SdlStorage::in_memory();
        run(
            &sdl,
            Command::Set {
                ns: "ns".into(),
                key: "k".into(),
                value: "v".into(),
            },
        )
        .unwrap();
        run(
            &sdl,
            Command::AddMember {
                ns: "ns".into(),
                group: "g".into(),
                members: vec!["a".into(), "b".into()],
            },
        )
        .unwrap();

        assert_eq!(sdl.get("ns", &["k"]).unwrap()["k"], b"v");
        assert_eq!(sdl.group_size("ns", "g").unwrap(), 2);

        run(&sdl, Command::RemoveAll { ns: "ns".into() }).unwrap();
        assert!(sdl.find_keys("ns", "*").unwrap().is_empty());
    }

    #[test]
    fn test_lock_command_rejects_contended_lock() {
        let sdl = SdlStorage::in_memory();
        let holder = sdl
            .get_lock_resource("ns", "l", Duration::from_secs(30))
            .unwrap();
        assert!(holder
            .acquire(Duration::from_millis(10), Duration::ZERO)
            .unwrap());

        let result = run(
            &sdl,
            Command::Lock {
                ns: "ns".into(),
                name: "l".into(),
                expiration: 5.0,
                hold: 0.0,
                timeout: 0.05,
            },
        );
        assert!(result.is_err());
    }
}
