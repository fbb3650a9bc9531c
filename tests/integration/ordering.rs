use std::time::Duration;

use smf_core::config::PipelineConfig;
use smf_services::{DeleteRequest, WriteBehind};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Write-behind ordering and backpressure
// ══════════════════════════════════════════════════════════════════════════════

/// Tiny deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// With the queue full, one more enqueue from another task waits until a
/// worker takes an item; nothing is dropped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_blocks_caller() -> Result<()> {
    let cache = MemoryCache::new();
    let (pipeline, workers) = WriteBehind::new(
        Arc::new(cache.clone()),
        &PipelineConfig {
            queue_capacity: 4,
            workers: 2,
        },
    );
    for i in 0..4 {
        pipeline.enqueue_context_write(session(&format!("ref-q{i}"))).await?;
    }
    assert_eq!(pipeline.stats().context_queued, 4);

    let extra = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.enqueue_context_write(session("ref-extra")).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!extra.is_finished(), "enqueue on a full queue returned early");

    let mut supervisor = Supervisor::new();
    workers.spawn(&mut supervisor);
    tokio::time::timeout(Duration::from_secs(5), extra)
        .await
        .context("blocked enqueue never resumed")???;
    pipeline.flush().await;

    assert_eq!(cache.len(), 5);
    assert!(cache.contains_key("smctx:ref-extra"));
    Ok(())
}

/// Random store/delete sequences over a few references, processed by many
/// slow workers. The cache must end up reflecting the last request made
/// for each reference.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_request_wins_for_any_interleaving() -> Result<()> {
    let h = Harness::distributed().await?;
    h.cache.set_latency(Duration::from_micros(300));
    let references = ["ref-o0", "ref-o1", "ref-o2"];
    let mut rng = Lcg(7);

    for round in 0..10 {
        let mut expected = [false; 3];
        for _ in 0..30 {
            let slot = (rng.next() % 3) as usize;
            let reference = references[slot];
            match rng.next() % 4 {
                0 | 1 => {
                    h.repo.contexts().store(&session(reference)).await?;
                    expected[slot] = true;
                }
                2 => {
                    h.repo.contexts().delete_by_reference(reference).await?;
                    expected[slot] = false;
                }
                _ => {
                    h.repo.index().put(reference, slot as u64 + 100).await?;
                    h.repo.index().delete(reference).await?;
                }
            }
        }
        h.repo.flush().await;

        for (slot, reference) in references.iter().enumerate() {
            assert_eq!(
                h.cache.contains_key(&format!("smctx:{reference}")),
                expected[slot],
                "round {round}: wrong final state for {reference}"
            );
            assert!(!h.cache.contains_key(&format!("ref2seid:{reference}")));
        }
    }
    Ok(())
}

/// A delete by SEID issued while the index write is still queued removes
/// the session; a store issued after it brings the context back.
#[tokio::test]
async fn test_seid_delete_then_store() -> Result<()> {
    let h = Harness::distributed().await?;
    h.cache.set_latency(Duration::from_millis(1));
    let ctx = session("ref-s");
    h.repo.store(ctx.clone()).await?;
    h.repo.associate_seid(&ctx, 0x5e1d).await?;
    h.repo.contexts().delete_by_seid(0x5e1d).await?;
    h.repo.flush().await;

    assert!(!h.cache.contains_key("smctx:ref-s"));
    assert!(!h.cache.contains_key("seid2ref:5e1d"));

    h.repo.contexts().store(&ctx).await?;
    h.repo.flush().await;
    assert!(h.cache.contains_key("smctx:ref-s"));
    assert!(!h.cache.contains_key("ref2seid:ref-s"));
    Ok(())
}

/// Deletes enqueued directly on the pipeline follow the same rule.
#[tokio::test]
async fn test_raw_delete_requests() -> Result<()> {
    let cache = MemoryCache::new();
    let (pipeline, workers) = WriteBehind::new(
        Arc::new(cache.clone()),
        &PipelineConfig {
            queue_capacity: 16,
            workers: 3,
        },
    );
    let mut supervisor = Supervisor::new();
    workers.spawn(&mut supervisor);

    pipeline.enqueue_context_write(session("ref-r")).await?;
    pipeline
        .enqueue_index_write(smf_core::SeidSmContextRef::new("ref-r", 12))
        .await?;
    pipeline.flush().await;
    assert_eq!(cache.len(), 3);

    pipeline
        .enqueue_delete(DeleteRequest::Index("ref-r".into()))
        .await?;
    pipeline.flush().await;
    assert_eq!(cache.len(), 1);

    pipeline
        .enqueue_delete(DeleteRequest::Context("ref-r".into()))
        .await?;
    pipeline.flush().await;
    assert!(cache.is_empty());

    let exits = supervisor.shutdown().await;
    assert_eq!(exits.len(), 9);
    assert!(exits.iter().all(|e| !e.is_panic()));
    Ok(())
}
