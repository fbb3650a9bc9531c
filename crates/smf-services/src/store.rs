//! Context store: persisted session contexts keyed by reference.
//!
//! Reads that find a record the codec cannot decode log the failure and
//! report a miss; the caller then treats the session as unknown. Backend
//! failures are returned as `StoreError::BackendUnavailable`, never as a miss.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use smf_core::codec::{self, SmContextRecord};
use smf_core::{CodecError, SmContext};

use crate::backend::{collections, keys, DocumentStore, Filter, KeyValueCache};
use crate::error::{Result, StoreError};
use crate::index::{CachedIndex, DurableIndex, IdentifierIndex};
use crate::pipeline::{DeleteRequest, WriteBehind};

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Persist the current state of `ctx`, replacing any previous record.
    async fn store(&self, ctx: &Arc<SmContext>) -> Result<()>;

    async fn get_by_reference(&self, reference: &str) -> Result<Option<SmContext>>;

    async fn get_by_seid(&self, seid: u64) -> Result<Option<SmContext>>;

    async fn delete_by_reference(&self, reference: &str) -> Result<()>;

    /// Delete the context and both index entries of the reference `seid` maps to.
    async fn delete_by_seid(&self, seid: u64) -> Result<()>;
}

/// Where contexts live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Synchronous document-database reads and writes.
    Durable,
    /// Shared cache reads, write-behind writes.
    Distributed,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => f.write_str("durable"),
            Self::Distributed => f.write_str("distributed"),
        }
    }
}

fn decoded(reference: &str, record: std::result::Result<SmContextRecord, CodecError>) -> Option<SmContext> {
    match record.and_then(codec::decode) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            tracing::error!(reference, error = %e, "stored context is unreadable");
            None
        }
    }
}

/// Resolve a SEID, mapping a miss to `None` and an unreadable entry to a
/// logged miss.
async fn resolve(index: &dyn IdentifierIndex, seid: u64) -> Result<Option<String>> {
    match index.reference_by_seid(seid).await {
        Ok(reference) => Ok(Some(reference)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(StoreError::Codec(e)) => {
            tracing::error!(seid, error = %e, "index entry is unreadable");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ── Durable ───────────────────────────────────────────────────────────────────

pub struct DurableContextStore {
    db: Arc<dyn DocumentStore>,
    index: Arc<DurableIndex>,
}

impl DurableContextStore {
    pub fn new(db: Arc<dyn DocumentStore>, index: Arc<DurableIndex>) -> Self {
        Self { db, index }
    }
}

#[async_trait]
impl ContextStore for DurableContextStore {
    async fn store(&self, ctx: &Arc<SmContext>) -> Result<()> {
        let record = codec::snapshot(ctx).await?;
        let document = codec::to_document(&record)?;
        self.db
            .upsert(
                collections::SM_CONTEXT,
                &Filter::eq("ref", ctx.reference()),
                document,
            )
            .await
            .map_err(|e| {
                tracing::warn!(reference = ctx.reference(), error = %e, "context store failed");
                StoreError::from(e)
            })?;
        tracing::debug!(reference = ctx.reference(), "context stored");
        Ok(())
    }

    async fn get_by_reference(&self, reference: &str) -> Result<Option<SmContext>> {
        let found = self
            .db
            .find_one(collections::SM_CONTEXT, &Filter::eq("ref", reference))
            .await?;
        Ok(found.and_then(|document| decoded(reference, codec::from_document(document))))
    }

    async fn get_by_seid(&self, seid: u64) -> Result<Option<SmContext>> {
        match resolve(self.index.as_ref(), seid).await? {
            Some(reference) => self.get_by_reference(&reference).await,
            None => Ok(None),
        }
    }

    async fn delete_by_reference(&self, reference: &str) -> Result<()> {
        let existed = self
            .db
            .delete_one(collections::SM_CONTEXT, &Filter::eq("ref", reference))
            .await?;
        tracing::debug!(reference, existed, "context deleted");
        Ok(())
    }

    async fn delete_by_seid(&self, seid: u64) -> Result<()> {
        let Some(reference) = resolve(self.index.as_ref(), seid).await? else {
            tracing::debug!(seid, "delete for unknown seid ignored");
            return Ok(());
        };
        self.delete_by_reference(&reference).await?;
        self.index.delete(&reference).await
    }
}

// ── Cached ────────────────────────────────────────────────────────────────────

pub struct CachedContextStore {
    cache: Arc<dyn KeyValueCache>,
    index: Arc<CachedIndex>,
    pipeline: WriteBehind,
}

impl CachedContextStore {
    pub fn new(cache: Arc<dyn KeyValueCache>, index: Arc<CachedIndex>, pipeline: WriteBehind) -> Self {
        Self {
            cache,
            index,
            pipeline,
        }
    }
}

#[async_trait]
impl ContextStore for CachedContextStore {
    async fn store(&self, ctx: &Arc<SmContext>) -> Result<()> {
        self.pipeline.enqueue_context_write(ctx.clone()).await
    }

    async fn get_by_reference(&self, reference: &str) -> Result<Option<SmContext>> {
        let found = self.cache.get(&keys::context(reference)).await?;
        Ok(found.and_then(|json| decoded(reference, codec::from_json(&json))))
    }

    async fn get_by_seid(&self, seid: u64) -> Result<Option<SmContext>> {
        match resolve(self.index.as_ref(), seid).await? {
            Some(reference) => self.get_by_reference(&reference).await,
            None => Ok(None),
        }
    }

    async fn delete_by_reference(&self, reference: &str) -> Result<()> {
        self.pipeline
            .enqueue_delete(DeleteRequest::Context(reference.to_string()))
            .await
    }

    async fn delete_by_seid(&self, seid: u64) -> Result<()> {
        self.pipeline.enqueue_delete(DeleteRequest::Seid(seid)).await
    }
}
