//! Tunable settings for the execution engine
//!
//! These settings control how execution nodes size their demand, how long
//! they hold partial batches, and how the shared services (cache manager,
//! tcp listener) are bounded.
//!
//! # Main Types
//!
//! - [`DemandSettings`] - Buffer bounds, batch sizes, batch timeout and backoff
//! - [`DemandOverrides`] - Per-operator adjustments to [`DemandSettings`]
//! - [`CacheSettings`] - Cache manager capacity and default lifetimes
//! - [`TcpSettings`] - Socket read size and bridge capacity
//!
//! Sizes are measured in rows for events and in bytes for byte chunks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Demand sizing and scheduling for one element type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandSettings {
    /// Requests smaller than this are deferred to avoid chatty round trips
    pub min_batch_size: u64,

    /// Upper bound for a single pull request
    pub max_batch_size: u64,

    /// Bound for both the inbound and the outbound buffer of a node
    pub max_buffered: u64,

    /// How long a downstream pull may wait for a full batch
    pub batch_timeout_ms: u64,

    /// First delay before re-running a stalled generator
    pub min_backoff_ms: u64,

    /// Maximum delay before re-running a stalled generator
    pub max_backoff_ms: u64,

    /// Growth factor applied to the delay after each stalled run
    pub backoff_rate: f64,
}

impl DemandSettings {
    /// Defaults for table slices, in rows.
    pub fn events() -> Self {
        Self {
            min_batch_size: 8 * 1024,
            max_batch_size: 64 * 1024,
            max_buffered: 254 * 1024,
            batch_timeout_ms: 250,
            min_backoff_ms: 10,
            max_backoff_ms: 1000,
            backoff_rate: 2.0,
        }
    }

    /// Defaults for byte chunks, in bytes.
    pub fn bytes() -> Self {
        Self {
            min_batch_size: 128 * 1024,
            max_batch_size: 1024 * 1024,
            max_buffered: 4 * 1024 * 1024,
            ..Self::events()
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Apply per-operator overrides.
    pub fn with_overrides(mut self, overrides: &DemandOverrides) -> Self {
        if let Some(v) = overrides.min_batch_size {
            self.min_batch_size = v;
        }
        if let Some(v) = overrides.max_batch_size {
            self.max_batch_size = v;
        }
        if let Some(v) = overrides.max_buffered {
            self.max_buffered = v;
        }
        if let Some(v) = overrides.batch_timeout_ms {
            self.batch_timeout_ms = v;
        }
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_buffered == 0 {
            return Err("max_buffered must be positive".into());
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(format!(
                "min_batch_size ({}) exceeds max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            ));
        }
        if self.max_batch_size > self.max_buffered {
            return Err(format!(
                "max_batch_size ({}) exceeds max_buffered ({})",
                self.max_batch_size, self.max_buffered
            ));
        }
        if self.backoff_rate < 1.0 {
            return Err("backoff_rate must be at least 1.0".into());
        }
        Ok(())
    }
}

impl Default for DemandSettings {
    fn default() -> Self {
        Self::events()
    }
}

/// Operator-specific adjustments to the configured demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandOverrides {
    pub min_batch_size: Option<u64>,
    pub max_batch_size: Option<u64>,
    pub max_buffered: Option<u64>,
    pub batch_timeout_ms: Option<u64>,
}

/// Demand settings per element type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    pub events: DemandSettings,
    pub bytes: DemandSettings,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            events: DemandSettings::events(),
            bytes: DemandSettings::bytes(),
        }
    }
}

/// Cache manager limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Approximate byte budget shared by all caches
    pub capacity_bytes: u64,

    /// Default inactivity lifetime of a cache
    pub lifetime_ms: u64,

    /// Interval of the eviction sweep
    pub check_interval_ms: u64,
}

impl CacheSettings {
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024 * 1024,
            lifetime_ms: 10 * 60 * 1000,
            check_interval_ms: 30 * 1000,
        }
    }
}

/// tcp-listen limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Maximum bytes read from a socket per step
    pub read_size: usize,

    /// Socket read timeout; bounds how long shutdown can go unnoticed
    pub read_timeout_ms: u64,

    /// Table slices buffered between connections and the listener
    pub bridge_capacity: usize,
}

impl TcpSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            read_size: 64 * 1024,
            read_timeout_ms: 250,
            bridge_capacity: 64,
        }
    }
}

/// parallel operator limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSettings {
    /// Input slices are split into pieces of at most about this many rows
    pub split_at: u64,

    /// Slices buffered on each side of the transceiver
    pub channel_capacity: usize,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            split_at: 5000,
            channel_capacity: 16,
        }
    }
}

/// Logging options used by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Directory for daily rotated log files, if any
    pub directory: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info,slipstream=debug".to_string(),
            directory: None,
        }
    }
}
