//! Storage backends behind the context store and identifier index.
//!
//! Two seams: a document database addressed by collection and equality
//! filter, and a flat string key-value cache. The in-process `memory`
//! implementations serve as the embedded store and as test doubles; the
//! networked ones are feature-gated.

use async_trait::async_trait;
use smf_core::Document;

use crate::error::BackendError;

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use memory::{MemoryCache, MemoryDocumentStore};

/// Collection names, shared with every other instance of the deployment.
pub mod collections {
    pub const SM_CONTEXT: &str = "smf.data.smContext";
    pub const SEID_SM_CONTEXT: &str = "smf.data.seidSmContext";
    pub const REF_TO_SEID: &str = "smf.data.refToSeid";
    /// Counter backing the per-instance unique identity.
    pub const SMF_COUNT: &str = "smf.data.smfCount";
}

/// Cache key layout. Each record kind has its own prefix so that a reference
/// can never collide with a SEID or with another record kind.
pub mod keys {
    use smf_core::seid;

    pub fn context(reference: &str) -> String {
        format!("smctx:{reference}")
    }

    pub fn ref_to_seid(reference: &str) -> String {
        format!("ref2seid:{reference}")
    }

    pub fn seid_to_ref(seid: u64) -> String {
        format!("seid2ref:{}", seid::to_hex(seid))
    }
}

/// Equality match on a single top-level string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: &'static str,
    pub value: String,
}

impl Filter {
    pub fn eq(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        document
            .get(self.field)
            .and_then(|v| v.as_str())
            .is_some_and(|v| v == self.value)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// First document matching `filter`, or `None`.
    async fn find_one(&self, collection: &str, filter: &Filter)
        -> Result<Option<Document>, BackendError>;

    /// Replace the document matching `filter`, inserting it if absent.
    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<(), BackendError>;

    /// Delete the document matching `filter`. Returns whether one existed.
    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, BackendError>;

    /// Ensure a unique index on `field`.
    async fn create_index(&self, collection: &str, field: &'static str)
        -> Result<(), BackendError>;

    /// Atomically increment the named counter and return the new value.
    async fn unique_identity(&self, counter: &str) -> Result<u64, BackendError>;
}

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;
}
