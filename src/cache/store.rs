//! A single named cache, owned by its own task.
//!
//! The task owns the cached slices, the writer registration and every
//! reader's offset; handles talk to it over a channel. Reads at the write
//! frontier are parked until the writer appends or finishes. The cache
//! expires after `ttl` without any access, or `max_ttl` after creation;
//! expiry ends the task, completing parked reads with end-of-data and
//! making the cache unreachable.

use crate::data::TableSlice;
use crate::error::{PipelineError, Result};
use crate::pipeline::id::{ReaderId, WriterId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Limits of one cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheOptions {
    /// Maximum number of events.
    pub capacity: u64,
    /// Maximum approximate size in bytes.
    pub max_bytes: u64,
    /// Inactivity lifetime, renewed on every access.
    pub ttl: Duration,
    /// Absolute lifetime from creation.
    pub max_ttl: Option<Duration>,
}

/// Point-in-time description of a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub id: String,
    pub events: u64,
    pub bytes: u64,
    pub readers: usize,
    pub has_writer: bool,
    pub complete: bool,
    pub created: DateTime<Utc>,
}

/// Result of handing a slice to a [`CacheWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// Some or all rows were dropped because the cache is full.
    Truncated { capacity: u64 },
    /// The slice was dropped because the cache would exceed its byte budget.
    OutOfMemory { limit: u64 },
}

pub(crate) enum CacheMessage {
    Announce {
        writer: WriterId,
        reply: oneshot::Sender<Result<CacheOptions>>,
    },
    CurrentWriter {
        reply: oneshot::Sender<Option<WriterId>>,
    },
    Write {
        writer: WriterId,
        slice: TableSlice,
    },
    Finish {
        writer: WriterId,
        failed: bool,
    },
    Read {
        reader: ReaderId,
        reply: oneshot::Sender<Option<TableSlice>>,
    },
    ReleaseReader {
        reader: ReaderId,
    },
    Info {
        reply: oneshot::Sender<CacheInfo>,
    },
    Evict,
}

/// Address of a cache task.
#[derive(Clone)]
pub struct CacheHandle {
    id: Arc<str>,
    tx: mpsc::UnboundedSender<CacheMessage>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheHandle(`{}`)", self.id)
    }
}

impl CacheHandle {
    /// Spawn the task of a new, empty cache.
    pub(crate) fn spawn(id: &str, options: CacheOptions, runtime: &tokio::runtime::Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = CacheStore {
            id: id.to_string(),
            options,
            created: Utc::now(),
            slices: Vec::new(),
            events: 0,
            bytes: 0,
            writer: None,
            complete: false,
            readers: HashMap::new(),
            parked: Vec::new(),
        };
        runtime.spawn(store.run(rx));
        Self {
            id: Arc::from(id),
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the cache task is still running.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn expired(&self) -> PipelineError {
        PipelineError::Cache(format!("cache `{}` expired", self.id))
    }

    /// Register as the cache's only writer.
    pub async fn announce(&self) -> Result<CacheWriter> {
        let writer = WriterId::next();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheMessage::Announce { writer, reply })
            .map_err(|_| self.expired())?;
        let options = rx.await.map_err(|_| self.expired())??;
        Ok(CacheWriter {
            cache: self.clone(),
            id: writer,
            options,
            written: 0,
            bytes: 0,
            finished: false,
        })
    }

    /// The registered writer, if any.
    pub async fn current_writer(&self) -> Option<WriterId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheMessage::CurrentWriter { reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub fn reader(&self) -> CacheReader {
        CacheReader {
            cache: self.clone(),
            id: ReaderId::next(),
        }
    }

    pub async fn info(&self) -> Option<CacheInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheMessage::Info { reply }).ok()?;
        rx.await.ok()
    }

    /// Expire the cache now.
    pub fn evict(&self) {
        let _ = self.tx.send(CacheMessage::Evict);
    }
}

/// The writing side of a cache. Dropping it without [`CacheWriter::finish`]
/// marks the write as failed; readers then see what was written so far.
pub struct CacheWriter {
    cache: CacheHandle,
    id: WriterId,
    options: CacheOptions,
    written: u64,
    bytes: u64,
    finished: bool,
}

impl CacheWriter {
    pub fn id(&self) -> WriterId {
        self.id
    }

    pub fn write(&mut self, slice: TableSlice) -> WriteOutcome {
        let capacity = self.options.capacity;
        if self.written >= capacity {
            return WriteOutcome::Truncated { capacity };
        }
        let (slice, outcome) = if self.written + slice.rows() > capacity {
            (
                slice.subslice(0, capacity - self.written),
                WriteOutcome::Truncated { capacity },
            )
        } else {
            (slice, WriteOutcome::Accepted)
        };
        let bytes = slice.approx_bytes();
        if self.bytes + bytes > self.options.max_bytes {
            return WriteOutcome::OutOfMemory {
                limit: self.options.max_bytes,
            };
        }
        self.written += slice.rows();
        self.bytes += bytes;
        let _ = self.cache.tx.send(CacheMessage::Write {
            writer: self.id,
            slice,
        });
        outcome
    }

    pub fn finish(mut self) {
        self.finished = true;
        let _ = self.cache.tx.send(CacheMessage::Finish {
            writer: self.id,
            failed: false,
        });
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.cache.tx.send(CacheMessage::Finish {
                writer: self.id,
                failed: true,
            });
        }
    }
}

/// One reader of a cache, with its own offset.
pub struct CacheReader {
    cache: CacheHandle,
    id: ReaderId,
}

impl CacheReader {
    /// Resolves with the next slice, or `None` at the end of a complete
    /// cache or once the cache expired.
    pub fn read(&self) -> impl Future<Output = Option<TableSlice>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .cache
            .tx
            .send(CacheMessage::Read {
                reader: self.id,
                reply,
            })
            .is_ok();
        async move {
            if !sent {
                return None;
            }
            rx.await.ok().flatten()
        }
    }
}

impl Drop for CacheReader {
    fn drop(&mut self) {
        let _ = self
            .cache
            .tx
            .send(CacheMessage::ReleaseReader { reader: self.id });
    }
}

struct CacheStore {
    id: String,
    options: CacheOptions,
    created: DateTime<Utc>,
    slices: Vec<TableSlice>,
    events: u64,
    bytes: u64,
    writer: Option<WriterId>,
    complete: bool,
    readers: HashMap<ReaderId, usize>,
    parked: Vec<(ReaderId, oneshot::Sender<Option<TableSlice>>)>,
}

impl CacheStore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CacheMessage>) {
        let started = Instant::now();
        let hard_deadline = self.options.max_ttl.map(|max| started + max);
        let mut idle_deadline = started + self.options.ttl;
        tracing::debug!("Created cache `{}`", self.id);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if !matches!(msg, CacheMessage::Info { .. }) {
                        idle_deadline = Instant::now() + self.options.ttl;
                    }
                    if !self.handle(msg) {
                        tracing::debug!("Evicted cache `{}`", self.id);
                        break;
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::debug!("Cache `{}` expired after inactivity", self.id);
                    break;
                }
                _ = sleep_until(hard_deadline) => {
                    tracing::debug!("Cache `{}` reached its maximum lifetime", self.id);
                    break;
                }
            }
        }
        rx.close();
        // Dropping parked replies completes those reads with end-of-data.
        self.parked.clear();
    }

    /// Returns false when the cache should terminate.
    fn handle(&mut self, msg: CacheMessage) -> bool {
        match msg {
            CacheMessage::Announce { writer, reply } => {
                let result = if self.complete {
                    Err(PipelineError::Cache(format!(
                        "cache `{}` is already complete",
                        self.id
                    )))
                } else if let Some(existing) = self.writer {
                    Err(PipelineError::Cache(format!(
                        "cache `{}` already has a writer ({})",
                        self.id, existing
                    )))
                } else {
                    self.writer = Some(writer);
                    Ok(self.options)
                };
                let _ = reply.send(result);
            }
            CacheMessage::CurrentWriter { reply } => {
                let _ = reply.send(self.writer);
            }
            CacheMessage::Write { writer, slice } => {
                if self.writer == Some(writer) && slice.rows() > 0 {
                    self.events += slice.rows();
                    self.bytes += slice.approx_bytes();
                    self.slices.push(slice);
                    self.serve_parked();
                }
            }
            CacheMessage::Finish { writer, failed } => {
                if self.writer == Some(writer) {
                    if failed {
                        tracing::warn!(
                            "Writer of cache `{}` failed after {} events",
                            self.id,
                            self.events
                        );
                    }
                    self.writer = None;
                    self.complete = true;
                    for (_, reply) in self.parked.drain(..) {
                        let _ = reply.send(None);
                    }
                }
            }
            CacheMessage::Read { reader, reply } => {
                let offset = self.readers.entry(reader).or_insert(0);
                if let Some(slice) = self.slices.get(*offset) {
                    *offset += 1;
                    let _ = reply.send(Some(slice.clone()));
                } else if self.complete {
                    let _ = reply.send(None);
                } else {
                    self.parked.push((reader, reply));
                }
            }
            CacheMessage::ReleaseReader { reader } => {
                self.readers.remove(&reader);
                self.parked.retain(|(id, _)| *id != reader);
            }
            CacheMessage::Info { reply } => {
                let _ = reply.send(CacheInfo {
                    id: self.id.clone(),
                    events: self.events,
                    bytes: self.bytes,
                    readers: self.readers.len(),
                    has_writer: self.writer.is_some(),
                    complete: self.complete,
                    created: self.created,
                });
            }
            CacheMessage::Evict => return false,
        }
        true
    }

    fn serve_parked(&mut self) {
        for (reader, reply) in std::mem::take(&mut self.parked) {
            let offset = self.readers.entry(reader).or_insert(0);
            match self.slices.get(*offset) {
                Some(slice) => {
                    *offset += 1;
                    let _ = reply.send(Some(slice.clone()));
                }
                None => self.parked.push((reader, reply)),
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Field, Schema, Value};

    fn options() -> CacheOptions {
        CacheOptions {
            capacity: 10,
            max_bytes: u64::MAX,
            ttl: Duration::from_secs(60),
            max_ttl: None,
        }
    }

    fn slice(rows: i64) -> TableSlice {
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", DataType::Int64)]));
        TableSlice::new(schema, vec![(0..rows).map(Value::Int64).collect()]).unwrap()
    }

    #[tokio::test]
    async fn test_single_writer() {
        let cache = CacheHandle::spawn("a", options(), &tokio::runtime::Handle::current());
        let writer = cache.announce().await.unwrap();
        assert_eq!(cache.current_writer().await, Some(writer.id()));
        assert!(cache.announce().await.is_err());
        writer.finish();
        assert_eq!(cache.current_writer().await, None);
        assert!(cache.announce().await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_truncates() {
        let cache = CacheHandle::spawn("b", options(), &tokio::runtime::Handle::current());
        let mut writer = cache.announce().await.unwrap();
        assert_eq!(writer.write(slice(6)), WriteOutcome::Accepted);
        assert_eq!(writer.write(slice(6)), WriteOutcome::Truncated { capacity: 10 });
        assert_eq!(writer.write(slice(1)), WriteOutcome::Truncated { capacity: 10 });
        writer.finish();
        assert_eq!(cache.info().await.unwrap().events, 10);
    }

    #[tokio::test]
    async fn test_reader_parks_at_frontier() {
        let cache = CacheHandle::spawn("c", options(), &tokio::runtime::Handle::current());
        let mut writer = cache.announce().await.unwrap();
        let reader = cache.reader();
        let pending = tokio::spawn(reader.read());
        tokio::task::yield_now().await;
        writer.write(slice(3));
        assert_eq!(pending.await.unwrap().unwrap().rows(), 3);
        let next = tokio::spawn(reader.read());
        drop(writer);
        assert!(next.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readers_have_independent_offsets() {
        let cache = CacheHandle::spawn("d", options(), &tokio::runtime::Handle::current());
        let mut writer = cache.announce().await.unwrap();
        writer.write(slice(1));
        writer.write(slice(2));
        writer.finish();
        let (a, b) = (cache.reader(), cache.reader());
        assert_eq!(a.read().await.unwrap().rows(), 1);
        assert_eq!(a.read().await.unwrap().rows(), 2);
        assert!(a.read().await.is_none());
        assert_eq!(b.read().await.unwrap().rows(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let options = CacheOptions {
            ttl: Duration::from_millis(100),
            ..options()
        };
        let cache = CacheHandle::spawn("e", options, &tokio::runtime::Handle::current());
        let _writer = cache.announce().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cache.is_alive());
        assert!(cache.reader().read().await.is_none());
    }
}
