//! Named caches shared between pipelines.
//!
//! A cache is an append-only buffer of table slices with a single writer
//! and any number of readers, each reading at its own pace. The
//! [`CacheManager`] maps names to live caches and keeps their total size in
//! check.
//!
//! # Architecture
//!
//! ```text
//! CacheManager ──► manager task ──► { "id" → CacheHandle }
//!                                          │
//! CacheWriter ─── Write/Finish ──────────► cache task (owns slices,
//! CacheReader ─── Read ──────────────────►  writer id, reader offsets)
//! ```
//!
//! Neither the manager nor a cache shares state with anyone; all access is
//! serialized through their channels.

mod store;

pub use store::{CacheHandle, CacheInfo, CacheOptions, CacheReader, CacheWriter, WriteOutcome};

use crate::config::CacheSettings;
use crate::error::{PipelineError, Result};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

enum ManagerMessage {
    Create {
        id: String,
        options: CacheOptions,
        reply: oneshot::Sender<CacheHandle>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<CacheHandle>>,
    },
    List {
        reply: oneshot::Sender<Vec<CacheHandle>>,
    },
}

/// Handle to the process-wide cache registry.
#[derive(Clone)]
pub struct CacheManager {
    tx: mpsc::UnboundedSender<ManagerMessage>,
    settings: CacheSettings,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("settings", &self.settings)
            .finish()
    }
}

impl CacheManager {
    /// Spawn the manager task on `runtime`.
    pub fn spawn(settings: CacheSettings, runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_manager(rx, settings, runtime.clone()));
        Self { tx, settings }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Default options for a cache holding at most `capacity` events.
    pub fn default_options(&self, capacity: u64) -> CacheOptions {
        CacheOptions {
            capacity,
            max_bytes: self.settings.capacity_bytes,
            ttl: self.settings.lifetime(),
            max_ttl: None,
        }
    }

    fn stopped() -> PipelineError {
        PipelineError::Cache("cache manager is not running".to_string())
    }

    /// The live cache named `id`, created with `options` if there is none.
    /// With `exclusive`, fails if the cache already has a writer.
    pub async fn create(&self, id: &str, options: CacheOptions, exclusive: bool) -> Result<CacheHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMessage::Create {
                id: id.to_string(),
                options,
                reply,
            })
            .map_err(|_| Self::stopped())?;
        let handle = rx.await.map_err(|_| Self::stopped())?;
        check_exclusive(handle, exclusive).await
    }

    /// The live cache named `id`. With `exclusive`, fails if the cache
    /// already has a writer.
    pub async fn get(&self, id: &str, exclusive: bool) -> Result<CacheHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMessage::Get {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| Self::stopped())?;
        let handle = rx
            .await
            .map_err(|_| Self::stopped())?
            .ok_or_else(|| PipelineError::Cache(format!("cache `{}` does not exist", id)))?;
        check_exclusive(handle, exclusive).await
    }

    /// Descriptions of all live caches, oldest first.
    pub async fn list(&self) -> Result<Vec<CacheInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMessage::List { reply })
            .map_err(|_| Self::stopped())?;
        let handles = rx.await.map_err(|_| Self::stopped())?;
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(info) = handle.info().await {
                infos.push(info);
            }
        }
        Ok(infos)
    }
}

async fn check_exclusive(handle: CacheHandle, exclusive: bool) -> Result<CacheHandle> {
    if exclusive {
        if let Some(writer) = handle.current_writer().await {
            return Err(PipelineError::Cache(format!(
                "cache `{}` is already being written by {}",
                handle.id(),
                writer
            )));
        }
    }
    Ok(handle)
}

async fn run_manager(
    mut rx: mpsc::UnboundedReceiver<ManagerMessage>,
    settings: CacheSettings,
    runtime: Handle,
) {
    // Ordered by creation, oldest first.
    let mut caches: Vec<CacheHandle> = Vec::new();
    let period = settings.check_interval().max(std::time::Duration::from_millis(1));
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                caches.retain(CacheHandle::is_alive);
                match msg {
                    ManagerMessage::Create { id, options, reply } => {
                        let handle = match caches.iter().find(|c| c.id() == id) {
                            Some(existing) => existing.clone(),
                            None => {
                                let handle = CacheHandle::spawn(&id, options, &runtime);
                                caches.push(handle.clone());
                                handle
                            }
                        };
                        let _ = reply.send(handle);
                    }
                    ManagerMessage::Get { id, reply } => {
                        let _ = reply.send(caches.iter().find(|c| c.id() == id).cloned());
                    }
                    ManagerMessage::List { reply } => {
                        let _ = reply.send(caches.clone());
                    }
                }
            }
            _ = sweep.tick() => evict_oldest(&mut caches, settings.capacity_bytes).await,
        }
    }
    tracing::debug!("Cache manager stopped");
}

/// Evict the oldest caches while the total size exceeds `capacity_bytes`.
async fn evict_oldest(caches: &mut Vec<CacheHandle>, capacity_bytes: u64) {
    caches.retain(CacheHandle::is_alive);
    let mut sizes = Vec::with_capacity(caches.len());
    for cache in caches.iter() {
        sizes.push(cache.info().await.map_or(0, |info| info.bytes));
    }
    let mut total: u64 = sizes.iter().sum();
    let mut evicted = 0;
    while total > capacity_bytes && evicted < caches.len() {
        let cache = &caches[evicted];
        tracing::info!(
            "Evicting cache `{}` ({} bytes) to stay within {} bytes",
            cache.id(),
            sizes[evicted],
            capacity_bytes
        );
        cache.evict();
        total -= sizes[evicted];
        evicted += 1;
    }
    caches.drain(..evicted);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CacheManager {
        CacheManager::spawn(CacheSettings::default(), &Handle::current())
    }

    #[tokio::test]
    async fn test_get_missing_cache() {
        let err = manager().get("nope", false).await.unwrap_err();
        assert_eq!(err.to_string(), "cache error: cache `nope` does not exist");
    }

    #[tokio::test]
    async fn test_create_returns_existing() {
        let manager = manager();
        let options = manager.default_options(100);
        let a = manager.create("x", options, false).await.unwrap();
        let _writer = a.announce().await.unwrap();
        let b = manager.create("x", options, false).await.unwrap();
        assert_eq!(b.current_writer().await, a.current_writer().await);
        assert!(manager.create("x", options, true).await.is_err());
        assert!(manager.get("x", true).await.is_err());
        assert!(manager.get("x", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_and_evict() {
        let manager = manager();
        let options = manager.default_options(100);
        let a = manager.create("a", options, false).await.unwrap();
        manager.create("b", options, false).await.unwrap();
        let ids: Vec<_> = manager.list().await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["a", "b"]);
        a.evict();
        // The cache task ends asynchronously.
        while a.is_alive() {
            tokio::task::yield_now().await;
        }
        assert!(manager.get("a", false).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_evicts_oldest_first() {
        use crate::data::{DataType, Field, Schema, TableSlice, Value};
        use std::sync::Arc;

        let manager = manager();
        let options = manager.default_options(100);
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", DataType::Int64)]));
        let mut caches = Vec::new();
        for id in ["old", "new"] {
            let cache = manager.create(id, options, false).await.unwrap();
            let mut writer = cache.announce().await.unwrap();
            writer.write(TableSlice::new(Arc::clone(&schema), vec![vec![Value::Int64(1); 10]]).unwrap());
            writer.finish();
            caches.push(cache);
        }
        let one = caches[0].info().await.unwrap().bytes;
        evict_oldest(&mut caches, one).await;
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].id(), "new");
    }
}
