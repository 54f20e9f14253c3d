//! Top-level assembly: one `SyncClient` wires the cache, the coordinator,
//! the action orchestrator, and the diagnostic buffer around a remote
//! service, and hands out realtime subscription managers that share them.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use tether_core::time::normalize_timestamp_fields;
use tether_core::{QueryKey, RemoteService, SyncResult};

use crate::actions::Actions;
use crate::cache::QueryCache;
use crate::config::SyncConfig;
use crate::debug::DebugEventBuffer;
use crate::optimistic::MutationCoordinator;
use crate::realtime::{RealtimeChannel, RealtimeSync, TIMESTAMP_FIELDS};

pub struct SyncClient {
    config: SyncConfig,
    remote: Arc<dyn RemoteService>,
    cache: Arc<QueryCache>,
    coordinator: Arc<MutationCoordinator>,
    actions: Actions,
    debug: Arc<DebugEventBuffer>,
}

impl SyncClient {
    pub fn new(remote: Arc<dyn RemoteService>, config: SyncConfig) -> Self {
        let cache = Arc::new(QueryCache::new(&config.cache));
        let coordinator = Arc::new(MutationCoordinator::new(Arc::clone(&cache)));
        let actions = Actions::new(
            Arc::clone(&remote),
            Arc::clone(&cache),
            Arc::clone(&coordinator),
        );
        let debug = Arc::new(DebugEventBuffer::new(config.debug_capacity));
        Self {
            config,
            remote,
            cache,
            coordinator,
            actions,
            debug,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn actions(&self) -> &Actions {
        &self.actions
    }

    pub fn debug_events(&self) -> &Arc<DebugEventBuffer> {
        &self.debug
    }

    /// Build a subscription manager for a realtime channel that merges into
    /// this client's cache and records into its debug buffer.
    pub fn realtime(
        &self,
        channel_id: impl Into<String>,
        channel: Arc<dyn RealtimeChannel>,
    ) -> RealtimeSync {
        RealtimeSync::new(
            channel_id,
            channel,
            Arc::clone(&self.cache),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.debug),
            self.config.backoff.clone(),
        )
    }

    /// Read a query result through the cache. A fresh entry is served
    /// directly; a stale entry is served immediately while a background
    /// refetch revalidates it; an absent entry is fetched inline.
    pub async fn read_through(&self, key: &QueryKey) -> SyncResult<Value> {
        if let Some(entry) = self.cache.read(key) {
            let fresh = entry.is_fresh(Utc::now());
            if let Some(value) = entry.value {
                if !fresh {
                    self.spawn_refetch(key.clone());
                }
                return Ok(value);
            }
        }
        self.refetch(key).await
    }

    /// Fetch the authoritative value, canonicalize its timestamps, and write
    /// it into the cache.
    pub async fn refetch(&self, key: &QueryKey) -> SyncResult<Value> {
        let mut value = self.remote.query(key.kind(), key.params()).await?;
        normalize_timestamp_fields(&mut value, TIMESTAMP_FIELDS)?;
        self.cache.write(key, |_| Some(value.clone()));
        Ok(value)
    }

    fn spawn_refetch(&self, key: QueryKey) {
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            match remote.query(key.kind(), key.params()).await {
                Ok(mut value) => match normalize_timestamp_fields(&mut value, TIMESTAMP_FIELDS) {
                    Ok(()) => {
                        cache.write(&key, |_| Some(value.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "discarding refetched value");
                    }
                },
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "background refetch failed");
                }
            }
        });
    }
}
