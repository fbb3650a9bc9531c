//! Session repository: the entry point session-management code uses.
//!
//! Combines the local context pool with the configured context store and
//! identifier index. Lookups hit the pool first and fall back to the store;
//! anything loaded from the store is adopted into the pool so later lookups
//! on this instance return the same live context.

use std::sync::Arc;

use smf_core::{SmContext, SmfStoreConfig};

use crate::backend::{collections, DocumentStore, KeyValueCache};
use crate::error::{Result, StoreError};
use crate::index::{CachedIndex, DurableIndex, IdentifierIndex};
use crate::pipeline::{PipelineStats, WriteBehind};
use crate::pool::ContextPool;
use crate::store::{CachedContextStore, ContextStore, DurableContextStore, StoreMode};
use crate::supervisor::Supervisor;

const UNIQUE_INDEXES: [(&str, &str); 3] = [
    (collections::SM_CONTEXT, "ref"),
    (collections::SEID_SM_CONTEXT, "seid"),
    (collections::REF_TO_SEID, "ref"),
];

pub struct SessionRepository {
    pool: ContextPool,
    contexts: Arc<dyn ContextStore>,
    index: Arc<dyn IdentifierIndex>,
    pipeline: Option<WriteBehind>,
    mode: StoreMode,
    instance_id: u64,
}

impl SessionRepository {
    /// Prepare the database, claim an instance identity and wire the store
    /// for the configured mode. In distributed mode the write-behind workers
    /// are started under `supervisor`.
    pub async fn open(
        config: &SmfStoreConfig,
        db: Arc<dyn DocumentStore>,
        cache: Option<Arc<dyn KeyValueCache>>,
        supervisor: &mut Supervisor,
    ) -> Result<Self> {
        for (collection, field) in UNIQUE_INDEXES {
            if let Err(e) = db.create_index(collection, field).await {
                tracing::warn!(collection, field, error = %e, "failed to create index");
            }
        }
        let instance_id = db.unique_identity(collections::SMF_COUNT).await?;

        let (contexts, index, pipeline, mode): (
            Arc<dyn ContextStore>,
            Arc<dyn IdentifierIndex>,
            Option<WriteBehind>,
            StoreMode,
        ) = if config.scaling.enabled {
            let cache = cache.ok_or(StoreError::MissingCache)?;
            let (pipeline, workers) = WriteBehind::new(cache.clone(), &config.pipeline);
            workers.spawn(supervisor);
            let index = Arc::new(CachedIndex::new(cache.clone(), pipeline.clone()));
            let contexts = Arc::new(CachedContextStore::new(cache, index.clone(), pipeline.clone()));
            (contexts, index, Some(pipeline), StoreMode::Distributed)
        } else {
            let index = Arc::new(DurableIndex::new(db.clone()));
            let contexts = Arc::new(DurableContextStore::new(db, index.clone()));
            (contexts, index, None, StoreMode::Durable)
        };

        tracing::info!(instance_id, mode = %mode, "session repository ready");
        Ok(Self {
            pool: ContextPool::new(),
            contexts,
            index,
            pipeline,
            mode,
            instance_id,
        })
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    pub fn index(&self) -> &dyn IdentifierIndex {
        self.index.as_ref()
    }

    pub fn contexts(&self) -> &dyn ContextStore {
        self.contexts.as_ref()
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Value of the shared instance counter claimed at startup.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn pipeline_stats(&self) -> Option<PipelineStats> {
        self.pipeline.as_ref().map(WriteBehind::stats)
    }

    /// Wait for queued write-behind requests. No-op in durable mode.
    pub async fn flush(&self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.flush().await;
        }
    }

    /// Make `ctx` the live instance for its reference and persist it.
    pub async fn store(&self, ctx: Arc<SmContext>) -> Result<()> {
        let seid = ctx.lock().await.seid;
        self.pool.store(ctx.clone());
        if let Some(seid) = seid {
            self.pool.bind_seid(seid, ctx.reference());
        }
        self.contexts.store(&ctx).await
    }

    /// Record the SEID on the context, index it and persist the context.
    pub async fn associate_seid(&self, ctx: &Arc<SmContext>, seid: u64) -> Result<()> {
        ctx.lock().await.seid = Some(seid);
        self.pool.bind_seid(seid, ctx.reference());
        self.index.put(ctx.reference(), seid).await?;
        self.contexts.store(ctx).await
    }

    pub async fn find_by_reference(&self, reference: &str) -> Result<Option<Arc<SmContext>>> {
        if let Some(ctx) = self.pool.get(reference) {
            return Ok(Some(ctx));
        }
        match self.contexts.get_by_reference(reference).await? {
            Some(loaded) => Ok(Some(self.adopt(loaded).await)),
            None => Ok(None),
        }
    }

    pub async fn find_by_seid(&self, seid: u64) -> Result<Option<Arc<SmContext>>> {
        if let Some(ctx) = self.pool.get_by_seid(seid) {
            return Ok(Some(ctx));
        }
        match self.contexts.get_by_seid(seid).await? {
            Some(loaded) => {
                let ctx = self.adopt(loaded).await;
                self.pool.bind_seid(seid, ctx.reference());
                Ok(Some(ctx))
            }
            None => Ok(None),
        }
    }

    /// Remove the session everywhere: pool, context record, index entries.
    /// Both persistent deletes are attempted; the first failure is returned.
    pub async fn retire(&self, reference: &str) -> Result<()> {
        self.pool.delete(reference);
        let contexts = self.contexts.delete_by_reference(reference).await;
        let index = self.index.delete(reference).await;
        tracing::debug!(reference, "session retired");
        contexts.and(index)
    }

    pub async fn retire_by_seid(&self, seid: u64) -> Result<()> {
        match self.pool.get_by_seid(seid) {
            Some(ctx) => self.retire(ctx.reference()).await,
            None => self.contexts.delete_by_seid(seid).await,
        }
    }

    /// Drop the live instance without touching persisted state.
    pub fn clear_in_memory(&self, reference: &str) -> Option<Arc<SmContext>> {
        self.pool.delete(reference)
    }

    async fn adopt(&self, loaded: SmContext) -> Arc<SmContext> {
        let ctx = self.pool.adopt(Arc::new(loaded));
        let seid = ctx.lock().await.seid;
        if let Some(seid) = seid {
            self.pool.bind_seid(seid, ctx.reference());
        }
        ctx
    }
}
