use smf_core::CodecError;
use smf_services::{KeyValueCache, StoreError};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Backend failures, misses and unreadable records
// ══════════════════════════════════════════════════════════════════════════════

/// An absent key is `None`; an unreachable backend is an error. Callers must
/// be able to tell the two apart.
#[tokio::test]
async fn test_miss_is_not_a_failure() -> Result<()> {
    let durable = Harness::durable().await?;
    assert!(durable.repo.find_by_reference("ghost").await?.is_none());
    assert!(durable.repo.find_by_seid(5).await?.is_none());
    durable.db.set_offline(true);
    assert!(matches!(
        durable.repo.find_by_reference("ghost").await,
        Err(StoreError::BackendUnavailable(_))
    ));
    assert!(matches!(
        durable.repo.find_by_seid(5).await,
        Err(StoreError::BackendUnavailable(_))
    ));

    let distributed = Harness::distributed().await?;
    assert!(distributed.repo.find_by_reference("ghost").await?.is_none());
    distributed.cache.set_offline(true);
    assert!(matches!(
        distributed.repo.find_by_reference("ghost").await,
        Err(StoreError::BackendUnavailable(_))
    ));
    assert!(matches!(
        distributed.repo.index().seid_by_reference("ghost").await,
        Err(StoreError::BackendUnavailable(_))
    ));
    Ok(())
}

/// A failed durable write is reported to the caller; the live instance
/// stays pooled.
#[tokio::test]
async fn test_durable_write_failure_is_returned() -> Result<()> {
    let h = Harness::durable().await?;
    h.db.set_offline(true);
    let result = h.repo.store(session("ref-f")).await;
    assert!(matches!(result, Err(StoreError::BackendUnavailable(_))));
    assert!(h.repo.pool().get("ref-f").is_some());

    h.db.set_offline(false);
    h.repo.clear_in_memory("ref-f");
    assert!(h.repo.find_by_reference("ref-f").await?.is_none());
    Ok(())
}

/// A write-behind failure is dropped; the caller is not told and the
/// daemon keeps running. The next write repairs the cache.
#[tokio::test]
async fn test_dropped_write_is_repaired_by_next_write() -> Result<()> {
    let mut h = Harness::distributed().await?;
    let ctx = session("ref-w");

    h.cache.set_offline(true);
    h.repo.store(ctx.clone()).await?;
    h.repo.flush().await;
    h.cache.set_offline(false);
    assert!(!h.cache.contains_key("smctx:ref-w"));
    assert!(h.repo.pool().get("ref-w").is_some());

    h.repo.store(ctx).await?;
    h.repo.flush().await;
    assert!(h.cache.contains_key("smctx:ref-w"));

    let still_running =
        tokio::time::timeout(std::time::Duration::from_millis(20), h.supervisor.next_exit()).await;
    assert!(still_running.is_err(), "a worker exited after a backend failure");
    Ok(())
}

/// A record the codec cannot read is logged and treated as absent.
#[tokio::test]
async fn test_unreadable_records_read_as_absent() -> Result<()> {
    let h = Harness::distributed().await?;
    h.cache.set("smctx:ref-bad", "{not json".into()).await?;
    h.cache
        .set("seid2ref:77", r#"{"ref":"ref-bad","seid":"77"}"#.into())
        .await?;
    h.cache.set("seid2ref:78", "[]".into()).await?;

    assert!(h.repo.find_by_reference("ref-bad").await?.is_none());
    assert!(h.repo.find_by_seid(0x77).await?.is_none());
    assert!(h.repo.find_by_seid(0x78).await?.is_none());
    assert!(h.repo.pool().is_empty());
    Ok(())
}

/// A stored SEID wider than 64 bits is a range error, not a truncation.
#[tokio::test]
async fn test_oversized_seid_is_rejected() -> Result<()> {
    let h = Harness::distributed().await?;
    h.cache
        .set(
            "ref2seid:ref-big",
            r#"{"ref":"ref-big","seid":"1ffffffffffffffff"}"#.into(),
        )
        .await?;
    let err = h.repo.index().seid_by_reference("ref-big").await.unwrap_err();
    assert!(
        matches!(err, StoreError::Codec(CodecError::NumericRange { .. })),
        "unexpected error: {err}"
    );
    Ok(())
}

/// Failing to create indexes at startup is not fatal; failing to claim an
/// instance identity is.
#[tokio::test]
async fn test_startup_requires_identity() -> Result<()> {
    let h = Harness::durable().await?;
    h.db.set_offline(true);
    assert!(h.sibling(false).await.is_err());
    h.db.set_offline(false);
    assert_eq!(h.sibling(false).await?.repo.instance_id(), 2);
    Ok(())
}
