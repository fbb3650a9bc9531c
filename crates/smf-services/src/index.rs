//! Identifier index: the bidirectional reference ↔ SEID mapping.
//!
//! The durable index keeps one document per direction, each carrying both
//! identifiers. The cached index reads from the cache and writes through the
//! write-behind pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use smf_core::codec;
use smf_core::{seid, SeidSmContextRef};

use crate::backend::{collections, keys, DocumentStore, Filter, KeyValueCache};
use crate::error::{Result, StoreError};
use crate::pipeline::{DeleteRequest, WriteBehind};

#[async_trait]
pub trait IdentifierIndex: Send + Sync {
    /// Bind `reference` to `seid`, replacing any earlier binding of either one.
    async fn put(&self, reference: &str, seid: u64) -> Result<()>;

    /// `StoreError::NotFound` when the reference is not bound.
    async fn seid_by_reference(&self, reference: &str) -> Result<u64>;

    /// `StoreError::NotFound` when the SEID is not bound.
    async fn reference_by_seid(&self, seid: u64) -> Result<String>;

    /// Remove both directions for `reference`. Deleting an absent binding succeeds.
    async fn delete(&self, reference: &str) -> Result<()>;
}

// ── Durable ───────────────────────────────────────────────────────────────────

pub struct DurableIndex {
    db: Arc<dyn DocumentStore>,
}

impl DurableIndex {
    pub fn new(db: Arc<dyn DocumentStore>) -> Self {
        Self { db }
    }

    async fn entry_by_reference(&self, reference: &str) -> Result<Option<SeidSmContextRef>> {
        let found = self
            .db
            .find_one(collections::REF_TO_SEID, &Filter::eq("ref", reference))
            .await?;
        Ok(found.map(codec::from_document).transpose()?)
    }

    async fn entry_by_seid(&self, seid_hex: &str) -> Result<Option<SeidSmContextRef>> {
        let found = self
            .db
            .find_one(collections::SEID_SM_CONTEXT, &Filter::eq("seid", seid_hex))
            .await?;
        Ok(found.map(codec::from_document).transpose()?)
    }

    /// Drop the by-SEID row only while it still names `reference`.
    async fn release_seid(&self, seid_hex: &str, reference: &str) -> Result<()> {
        match self.entry_by_seid(seid_hex).await {
            Ok(Some(owner)) if owner.reference != reference => return Ok(()),
            Ok(None) => return Ok(()),
            Ok(Some(_)) => {}
            Err(StoreError::Codec(e)) => {
                tracing::warn!(seid = seid_hex, error = %e, "removing unreadable index entry");
            }
            Err(e) => return Err(e),
        }
        self.db
            .delete_one(collections::SEID_SM_CONTEXT, &Filter::eq("seid", seid_hex))
            .await?;
        Ok(())
    }

    /// Drop the by-reference row of whoever else holds `seid_hex`.
    async fn evict_previous_owner(&self, seid_hex: &str, reference: &str) -> Result<()> {
        let owner = match self.entry_by_seid(seid_hex).await {
            Ok(Some(owner)) if owner.reference != reference => owner.reference,
            Ok(_) => return Ok(()),
            Err(StoreError::Codec(e)) => {
                tracing::warn!(seid = seid_hex, error = %e, "replacing unreadable index entry");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Ok(Some(stale)) = self.entry_by_reference(&owner).await {
            if stale.seid == seid_hex {
                self.db
                    .delete_one(collections::REF_TO_SEID, &Filter::eq("ref", owner.as_str()))
                    .await?;
                tracing::debug!(reference = %owner, seid = seid_hex, "seid moved away from reference");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdentifierIndex for DurableIndex {
    async fn put(&self, reference: &str, seid: u64) -> Result<()> {
        let entry = SeidSmContextRef::new(reference, seid);
        match self.entry_by_reference(reference).await {
            Ok(Some(previous)) if previous.seid != entry.seid => {
                self.release_seid(&previous.seid, reference).await?;
            }
            Ok(_) => {}
            Err(StoreError::Codec(e)) => {
                tracing::warn!(reference, error = %e, "replacing unreadable index entry");
            }
            Err(e) => return Err(e),
        }
        self.evict_previous_owner(&entry.seid, reference).await?;

        let document = codec::to_document(&entry)?;
        self.db
            .upsert(
                collections::SEID_SM_CONTEXT,
                &Filter::eq("seid", entry.seid.clone()),
                document.clone(),
            )
            .await?;
        self.db
            .upsert(collections::REF_TO_SEID, &Filter::eq("ref", reference), document)
            .await?;
        tracing::debug!(reference, seid, "index entry stored");
        Ok(())
    }

    async fn seid_by_reference(&self, reference: &str) -> Result<u64> {
        match self.entry_by_reference(reference).await? {
            Some(entry) => Ok(entry.seid()?),
            None => Err(StoreError::NotFound(format!("reference {reference}"))),
        }
    }

    async fn reference_by_seid(&self, seid: u64) -> Result<String> {
        let found = self
            .db
            .find_one(
                collections::SEID_SM_CONTEXT,
                &Filter::eq("seid", seid::to_hex(seid)),
            )
            .await?;
        match found {
            Some(document) => {
                let entry: SeidSmContextRef = codec::from_document(document)?;
                Ok(entry.reference)
            }
            None => Err(StoreError::NotFound(format!("seid {seid:#x}"))),
        }
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        match self.entry_by_reference(reference).await {
            Ok(Some(entry)) => self.release_seid(&entry.seid, reference).await?,
            Ok(None) => {}
            Err(StoreError::Codec(e)) => {
                tracing::warn!(reference, error = %e, "removing unreadable index entry");
            }
            Err(e) => return Err(e),
        }
        self.db
            .delete_one(collections::REF_TO_SEID, &Filter::eq("ref", reference))
            .await?;
        Ok(())
    }
}

// ── Cached ────────────────────────────────────────────────────────────────────

pub struct CachedIndex {
    cache: Arc<dyn KeyValueCache>,
    pipeline: WriteBehind,
}

impl CachedIndex {
    pub fn new(cache: Arc<dyn KeyValueCache>, pipeline: WriteBehind) -> Self {
        Self { cache, pipeline }
    }

    async fn entry(&self, key: &str) -> Result<Option<SeidSmContextRef>> {
        match self.cache.get(key).await? {
            Some(json) => Ok(Some(codec::from_json(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl IdentifierIndex for CachedIndex {
    async fn put(&self, reference: &str, seid: u64) -> Result<()> {
        self.pipeline
            .enqueue_index_write(SeidSmContextRef::new(reference, seid))
            .await
    }

    async fn seid_by_reference(&self, reference: &str) -> Result<u64> {
        match self.entry(&keys::ref_to_seid(reference)).await? {
            Some(entry) => Ok(entry.seid()?),
            None => Err(StoreError::NotFound(format!("reference {reference}"))),
        }
    }

    async fn reference_by_seid(&self, seid: u64) -> Result<String> {
        match self.entry(&keys::seid_to_ref(seid)).await? {
            Some(entry) => Ok(entry.reference),
            None => Err(StoreError::NotFound(format!("seid {seid:#x}"))),
        }
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        self.pipeline
            .enqueue_delete(DeleteRequest::Index(reference.to_string()))
            .await
    }
}
