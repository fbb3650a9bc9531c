//! In-process backends.
//!
//! `MemoryDocumentStore` is the embedded store used when no database URL is
//! configured. Both types can be taken offline, which makes every call fail
//! with a `BackendError`, and `MemoryCache` can inject per-call latency.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use smf_core::Document;

use super::{DocumentStore, Filter, KeyValueCache};
use crate::error::BackendError;

// ── Document store ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<DashMap<String, Vec<Document>>>,
    indexes: Arc<DashMap<String, Vec<&'static str>>>,
    counters: Arc<DashMap<String, u64>>,
    offline: Arc<AtomicBool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Fields with a unique index on `collection`.
    pub fn indexes(&self, collection: &str) -> Vec<&'static str> {
        self.indexes
            .get(collection)
            .map(|fields| fields.clone())
            .unwrap_or_default()
    }

    fn check(&self, operation: &'static str) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::new(operation, "document store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, BackendError> {
        self.check("find_one")?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)).cloned()))
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<(), BackendError> {
        self.check("upsert")?;
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| filter.matches(d)) {
            Some(existing) => *existing = document,
            None => docs.push(document),
        }
        Ok(())
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, BackendError> {
        self.check("delete_one")?;
        let Some(mut docs) = self.collections.get_mut(collection) else {
            return Ok(false);
        };
        match docs.iter().position(|d| filter.matches(d)) {
            Some(i) => {
                docs.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_index(
        &self,
        collection: &str,
        field: &'static str,
    ) -> Result<(), BackendError> {
        self.check("create_index")?;
        let mut fields = self.indexes.entry(collection.to_string()).or_default();
        if !fields.contains(&field) {
            fields.push(field);
        }
        Ok(())
    }

    async fn unique_identity(&self, counter: &str) -> Result<u64, BackendError> {
        self.check("unique_identity")?;
        let mut count = self.counters.entry(counter.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, String>>,
    offline: Arc<AtomicBool>,
    latency_micros: Arc<AtomicU64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Raw value, bypassing latency and the offline switch.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    async fn check(&self, operation: &'static str) -> Result<(), BackendError> {
        let micros = self.latency_micros.load(Ordering::SeqCst);
        if micros > 0 {
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::new(operation, "cache offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.check("get").await?;
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BackendError> {
        self.check("set").await?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.check("delete").await?;
        Ok(self.entries.remove(key).is_some())
    }
}
