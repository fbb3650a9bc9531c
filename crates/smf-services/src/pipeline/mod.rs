//! Write-behind pipeline.
//!
//! In distributed mode callers never wait on the cache for writes: context
//! writes, index writes and deletes go onto three bounded queues, each
//! drained by a pool of workers. A full queue makes the enqueuing caller
//! wait. Worker failures are logged and the request is dropped; the next
//! write for the same context repairs the cache.
//!
//! Requests for one reference may be processed by different workers in any
//! order. `Sequencer` tickets make the final cache state match the most
//! recently enqueued request per reference.

mod sequencer;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use smf_core::codec;
use smf_core::config::PipelineConfig;
use smf_core::{SeidSmContextRef, SmContext};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::backend::{keys, KeyValueCache};
use crate::error::{Result, StoreError};
use crate::supervisor::Supervisor;
use sequencer::{Op, Sequencer};

/// What a delete removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteRequest {
    /// The context record for a reference.
    Context(String),
    /// Both index entries for a reference.
    Index(String),
    /// Context and index entries of whichever reference the SEID maps to.
    Seid(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub context_queued: usize,
    pub index_queued: usize,
    pub delete_queued: usize,
    pub capacity: usize,
    pub in_flight: usize,
}

struct ContextJob {
    ctx: Arc<SmContext>,
    ticket: u64,
}

struct IndexJob {
    entry: SeidSmContextRef,
    seid: u64,
    ticket: u64,
}

enum DeleteJob {
    Keyed {
        reference: String,
        ops: &'static [Op],
        ticket: u64,
    },
    BySeid {
        seid: u64,
        ticket: u64,
    },
}

const CONTEXT_DELETE: &[Op] = &[Op::ContextDelete];
const INDEX_DELETE: &[Op] = &[Op::IndexDelete];
const SESSION_DELETE: &[Op] = &[Op::ContextDelete, Op::IndexDelete];

struct Shared {
    sequencer: Sequencer,
    /// SEIDs of index writes that are queued but not yet applied.
    queued_seids: DashMap<u64, String>,
    in_flight: AtomicUsize,
    context_tx: mpsc::Sender<ContextJob>,
    index_tx: mpsc::Sender<IndexJob>,
    delete_tx: mpsc::Sender<DeleteJob>,
}

impl Shared {
    fn done(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Enqueuing handle. Cheap to clone.
#[derive(Clone)]
pub struct WriteBehind {
    shared: Arc<Shared>,
}

/// Receiving side, handed to `spawn` once the caller is ready to drain.
pub struct WriteBehindWorkers {
    shared: Arc<Shared>,
    cache: Arc<dyn KeyValueCache>,
    context_rx: mpsc::Receiver<ContextJob>,
    index_rx: mpsc::Receiver<IndexJob>,
    delete_rx: mpsc::Receiver<DeleteJob>,
    workers: usize,
}

impl WriteBehind {
    pub fn new(cache: Arc<dyn KeyValueCache>, config: &PipelineConfig) -> (Self, WriteBehindWorkers) {
        let capacity = config.queue_capacity.max(1);
        let (context_tx, context_rx) = mpsc::channel(capacity);
        let (index_tx, index_rx) = mpsc::channel(capacity);
        let (delete_tx, delete_rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            sequencer: Sequencer::default(),
            queued_seids: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            context_tx,
            index_tx,
            delete_tx,
        });
        let workers = WriteBehindWorkers {
            shared: shared.clone(),
            cache,
            context_rx,
            index_rx,
            delete_rx,
            workers: config.workers.max(1),
        };
        (Self { shared }, workers)
    }

    /// Queue a snapshot write of `ctx`. The snapshot is taken when a worker
    /// picks the request up, so it reflects the latest state at that time.
    pub async fn enqueue_context_write(&self, ctx: Arc<SmContext>) -> Result<()> {
        let reference = ctx.reference().to_string();
        let ticket = self.begin(&reference, &[Op::ContextWrite]);
        if self.shared.context_tx.send(ContextJob { ctx, ticket }).await.is_err() {
            return Err(self.abandon(&reference));
        }
        Ok(())
    }

    pub async fn enqueue_index_write(&self, entry: SeidSmContextRef) -> Result<()> {
        let seid = entry.seid()?;
        let reference = entry.reference.clone();
        let ticket = self.begin(&reference, &[Op::IndexWrite]);
        self.shared.queued_seids.insert(seid, reference.clone());
        let job = IndexJob {
            entry,
            seid,
            ticket,
        };
        if self.shared.index_tx.send(job).await.is_err() {
            self.shared.queued_seids.remove_if(&seid, |_, r| *r == reference);
            return Err(self.abandon(&reference));
        }
        Ok(())
    }

    pub async fn enqueue_delete(&self, request: DeleteRequest) -> Result<()> {
        let (reference, ops) = match request {
            DeleteRequest::Context(reference) => (reference, CONTEXT_DELETE),
            DeleteRequest::Index(reference) => (reference, INDEX_DELETE),
            DeleteRequest::Seid(seid) => {
                let queued = self.shared.queued_seids.get(&seid).map(|r| r.value().clone());
                match queued {
                    Some(reference) => (reference, SESSION_DELETE),
                    None => {
                        let ticket = self.shared.sequencer.ticket();
                        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
                        let job = DeleteJob::BySeid { seid, ticket };
                        if self.shared.delete_tx.send(job).await.is_err() {
                            self.shared.done();
                            return Err(StoreError::PipelineClosed);
                        }
                        return Ok(());
                    }
                }
            }
        };
        let ticket = self.begin(&reference, ops);
        let job = DeleteJob::Keyed {
            reference: reference.clone(),
            ops,
            ticket,
        };
        if self.shared.delete_tx.send(job).await.is_err() {
            return Err(self.abandon(&reference));
        }
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let queued = |max: usize, free: usize| max.saturating_sub(free);
        let s = &self.shared;
        PipelineStats {
            context_queued: queued(s.context_tx.max_capacity(), s.context_tx.capacity()),
            index_queued: queued(s.index_tx.max_capacity(), s.index_tx.capacity()),
            delete_queued: queued(s.delete_tx.max_capacity(), s.delete_tx.capacity()),
            capacity: s.context_tx.max_capacity(),
            in_flight: s.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Wait until no request is queued or being processed.
    pub async fn flush(&self) {
        while self.shared.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn begin(&self, reference: &str, ops: &[Op]) -> u64 {
        let ticket = self.shared.sequencer.ticket();
        self.shared.sequencer.enqueued(reference, ops, ticket);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        ticket
    }

    fn abandon(&self, reference: &str) -> StoreError {
        self.shared.sequencer.finished(reference, true);
        self.shared.done();
        StoreError::PipelineClosed
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

struct Processor {
    shared: Arc<Shared>,
    cache: Arc<dyn KeyValueCache>,
}

impl WriteBehindWorkers {
    /// Start the worker pools under `supervisor`. Each worker stops at
    /// shutdown after the queue it drains is empty.
    pub fn spawn(self, supervisor: &mut Supervisor) {
        let processor = Arc::new(Processor {
            shared: self.shared,
            cache: self.cache,
        });
        let context_rx = Arc::new(Mutex::new(self.context_rx));
        let index_rx = Arc::new(Mutex::new(self.index_rx));
        let delete_rx = Arc::new(Mutex::new(self.delete_rx));

        for i in 0..self.workers {
            let p = processor.clone();
            supervisor.spawn(
                format!("context-writer-{i}"),
                drain(context_rx.clone(), supervisor.subscribe(), move |job| {
                    let p = p.clone();
                    async move { p.write_context(job).await }
                }),
            );
            let p = processor.clone();
            supervisor.spawn(
                format!("index-writer-{i}"),
                drain(index_rx.clone(), supervisor.subscribe(), move |job| {
                    let p = p.clone();
                    async move { p.write_index(job).await }
                }),
            );
            let p = processor.clone();
            supervisor.spawn(
                format!("deleter-{i}"),
                drain(delete_rx.clone(), supervisor.subscribe(), move |job| {
                    let p = p.clone();
                    async move { p.delete(job).await }
                }),
            );
        }
        tracing::info!(workers = self.workers, "write-behind workers started");
    }
}

async fn drain<T, F, Fut>(rx: SharedReceiver<T>, mut shutdown: broadcast::Receiver<()>, handle: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.recv() => {
                    while let Ok(job) = rx.try_recv() {
                        handle(job).await;
                    }
                    None
                }
            }
        };
        match job {
            Some(job) => handle(job).await,
            None => break,
        }
    }
}

impl Processor {
    async fn write_context(&self, job: ContextJob) {
        let reference = job.ctx.reference().to_string();
        let seq = &self.shared.sequencer;
        let guard = seq.lock(&reference).await;
        if seq.superseded(&reference, Op::ContextWrite, job.ticket) {
            tracing::debug!(reference = %reference, "context write superseded by delete");
        } else if let Err(e) = self.apply_context_write(&job.ctx).await {
            tracing::warn!(reference = %reference, error = %e, "context write dropped");
        }
        drop(guard);
        seq.finished(&reference, true);
        self.shared.done();
    }

    async fn apply_context_write(&self, ctx: &SmContext) -> Result<()> {
        let record = codec::snapshot(ctx).await?;
        let json = codec::to_json(&record)?;
        self.cache.set(&keys::context(ctx.reference()), json).await?;
        Ok(())
    }

    async fn write_index(&self, job: IndexJob) {
        let reference = job.entry.reference.clone();
        let seq = &self.shared.sequencer;
        let guard = seq.lock(&reference).await;
        if seq.superseded(&reference, Op::IndexWrite, job.ticket) {
            tracing::debug!(reference = %reference, "index write superseded by delete");
        } else if let Err(e) = self.apply_index_write(&job.entry, job.seid).await {
            tracing::warn!(reference = %reference, seid = job.seid, error = %e, "index write dropped");
        }
        self.shared
            .queued_seids
            .remove_if(&job.seid, |_, r| *r == reference);
        drop(guard);
        seq.finished(&reference, true);
        self.shared.done();
    }

    async fn apply_index_write(&self, entry: &SeidSmContextRef, seid: u64) -> Result<()> {
        if let Some(previous) = self.current_seid(&entry.reference).await? {
            if previous != seid {
                self.release_seid(previous, &entry.reference).await?;
            }
        }
        match self.owner_of(seid).await {
            Ok(Some(owner)) if owner != entry.reference => {
                if self.current_seid(&owner).await.ok().flatten() == Some(seid) {
                    self.cache.delete(&keys::ref_to_seid(&owner)).await?;
                    tracing::debug!(reference = %owner, seid, "seid moved away from reference");
                }
            }
            Ok(_) => {}
            Err(StoreError::Codec(e)) => {
                tracing::warn!(seid, error = %e, "replacing unreadable index entry")
            }
            Err(e) => return Err(e),
        }
        let json = codec::to_json(entry)?;
        self.cache
            .set(&keys::ref_to_seid(&entry.reference), json.clone())
            .await?;
        self.cache.set(&keys::seid_to_ref(seid), json).await?;
        Ok(())
    }

    async fn owner_of(&self, seid: u64) -> Result<Option<String>> {
        let Some(json) = self.cache.get(&keys::seid_to_ref(seid)).await? else {
            return Ok(None);
        };
        let entry: SeidSmContextRef = codec::from_json(&json)?;
        Ok(Some(entry.reference))
    }

    /// Drop `seid2ref:<seid>` only while it still names `reference`.
    async fn release_seid(&self, seid: u64, reference: &str) -> Result<()> {
        match self.owner_of(seid).await {
            Ok(Some(owner)) if owner != reference => return Ok(()),
            Ok(None) => return Ok(()),
            Ok(Some(_)) => {}
            Err(StoreError::Codec(e)) => {
                tracing::warn!(seid, error = %e, "unreadable index entry removed")
            }
            Err(e) => return Err(e),
        }
        self.cache.delete(&keys::seid_to_ref(seid)).await?;
        Ok(())
    }

    async fn current_seid(&self, reference: &str) -> Result<Option<u64>> {
        let Some(json) = self.cache.get(&keys::ref_to_seid(reference)).await? else {
            return Ok(None);
        };
        let entry: SeidSmContextRef = codec::from_json(&json)?;
        Ok(Some(entry.seid()?))
    }

    async fn delete(&self, job: DeleteJob) {
        match job {
            DeleteJob::Keyed {
                reference,
                ops,
                ticket,
            } => {
                let guard = self.shared.sequencer.lock(&reference).await;
                self.apply_delete(&reference, ops, ticket).await;
                drop(guard);
                self.shared.sequencer.finished(&reference, true);
            }
            DeleteJob::BySeid { seid, ticket } => {
                match self.cache.get(&keys::seid_to_ref(seid)).await {
                    Ok(Some(json)) => match codec::from_json::<SeidSmContextRef>(&json) {
                        Ok(entry) => {
                            let seq = &self.shared.sequencer;
                            let guard = seq.lock(&entry.reference).await;
                            seq.observe(&entry.reference, SESSION_DELETE, ticket);
                            self.apply_delete(&entry.reference, SESSION_DELETE, ticket)
                                .await;
                            drop(guard);
                            seq.finished(&entry.reference, false);
                        }
                        Err(e) => {
                            tracing::warn!(seid, error = %e, "unreadable index entry, delete dropped")
                        }
                    },
                    Ok(None) => tracing::debug!(seid, "delete for unknown seid ignored"),
                    Err(e) => tracing::warn!(seid, error = %e, "delete dropped"),
                }
            }
        }
        self.shared.done();
    }

    async fn apply_delete(&self, reference: &str, ops: &[Op], ticket: u64) {
        let seq = &self.shared.sequencer;
        for op in ops {
            if seq.superseded(reference, *op, ticket) {
                tracing::debug!(reference, op = ?op, "delete superseded by write");
                continue;
            }
            let result = match op {
                Op::ContextDelete => self
                    .cache
                    .delete(&keys::context(reference))
                    .await
                    .map(|_| ())
                    .map_err(StoreError::from),
                Op::IndexDelete => self.apply_index_delete(reference).await,
                Op::ContextWrite | Op::IndexWrite => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(reference, op = ?op, error = %e, "delete dropped");
            }
        }
    }

    async fn apply_index_delete(&self, reference: &str) -> Result<()> {
        match self.current_seid(reference).await {
            Ok(Some(seid)) => self.release_seid(seid, reference).await?,
            Ok(None) => {}
            Err(StoreError::Codec(e)) => {
                tracing::warn!(reference, error = %e, "unreadable index entry removed")
            }
            Err(e) => return Err(e),
        }
        self.cache.delete(&keys::ref_to_seid(reference)).await?;
        Ok(())
    }
}
