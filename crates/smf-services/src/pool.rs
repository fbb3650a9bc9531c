//! Local context pool.
//!
//! The per-instance set of live contexts, keyed by reference, plus the SEID
//! bindings used by PFCP lookups. Clones share the same maps.

use std::sync::Arc;

use dashmap::DashMap;
use smf_core::SmContext;

#[derive(Clone, Default)]
pub struct ContextPool {
    contexts: Arc<DashMap<String, Arc<SmContext>>>,
    by_seid: Arc<DashMap<u64, String>>,
    seid_of: Arc<DashMap<String, u64>>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the context under its reference. Returns the
    /// instance it replaced.
    pub fn store(&self, ctx: Arc<SmContext>) -> Option<Arc<SmContext>> {
        self.contexts.insert(ctx.reference().to_string(), ctx)
    }

    /// Insert `ctx` unless the reference is already live, and return the
    /// instance that ends up in the pool.
    pub fn adopt(&self, ctx: Arc<SmContext>) -> Arc<SmContext> {
        self.contexts
            .entry(ctx.reference().to_string())
            .or_insert(ctx)
            .value()
            .clone()
    }

    pub fn get(&self, reference: &str) -> Option<Arc<SmContext>> {
        self.contexts.get(reference).map(|c| c.value().clone())
    }

    /// Drop the context and its SEID binding. Returns the removed context.
    pub fn delete(&self, reference: &str) -> Option<Arc<SmContext>> {
        if let Some((_, seid)) = self.seid_of.remove(reference) {
            self.by_seid.remove_if(&seid, |_, r| r == reference);
        }
        self.contexts.remove(reference).map(|(_, ctx)| ctx)
    }

    /// Bind `seid` to `reference`, replacing any earlier binding of either.
    pub fn bind_seid(&self, seid: u64, reference: &str) {
        if let Some(previous) = self.by_seid.insert(seid, reference.to_string()) {
            if previous != reference {
                self.seid_of.remove_if(&previous, |_, s| *s == seid);
            }
        }
        if let Some(previous) = self.seid_of.insert(reference.to_string(), seid) {
            if previous != seid {
                self.by_seid.remove_if(&previous, |_, r| r == reference);
            }
        }
    }

    pub fn get_by_seid(&self, seid: u64) -> Option<Arc<SmContext>> {
        let reference = self.by_seid.get(&seid).map(|r| r.value().clone())?;
        self.get(&reference)
    }

    pub fn seid_of(&self, reference: &str) -> Option<u64> {
        self.seid_of.get(reference).map(|s| *s)
    }

    /// Visit every live context. The visitor runs over a snapshot, so it may
    /// call back into the pool.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<SmContext>)) {
        for ctx in &self.snapshot() {
            visitor(ctx);
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<SmContext>> {
        self.contexts.iter().map(|c| c.value().clone()).collect()
    }

    pub fn references(&self) -> Vec<String> {
        let mut references: Vec<String> = self.contexts.iter().map(|c| c.key().clone()).collect();
        references.sort();
        references
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Log one line per live context.
    pub fn log_contents(&self) {
        tracing::info!(count = self.len(), "context pool snapshot");
        self.for_each(|ctx| match ctx.try_lock() {
            Some(state) => tracing::info!(
                reference = ctx.reference(),
                supi = %state.supi,
                status = ?state.status,
                seid = ?state.seid,
                "  context"
            ),
            None => tracing::info!(reference = ctx.reference(), "  context (busy)"),
        });
    }
}
