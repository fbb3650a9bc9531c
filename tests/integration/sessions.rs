use smf_core::codec;
use smf_services::{Filter, DocumentStore, StoreError};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Session lifecycle: association, concurrent stores and retirement
// ══════════════════════════════════════════════════════════════════════════════

/// A context with no SEID is not reachable by SEID. Once associated, both
/// directions of the index resolve.
async fn seid_association(h: &Harness) -> Result<()> {
    let ctx = session("ref-1");
    h.repo.store(ctx.clone()).await?;
    h.repo.flush().await;

    for seid in [0, 1, 0x1A2B, u64::MAX] {
        assert!(h.repo.contexts().get_by_seid(seid).await?.is_none());
        assert!(h.repo.index().reference_by_seid(seid).await.unwrap_err().is_not_found());
    }

    h.repo.associate_seid(&ctx, 0x1A2B).await?;
    h.repo.flush().await;
    assert_eq!(h.repo.index().reference_by_seid(0x1A2B).await?, "ref-1");
    assert_eq!(h.repo.index().seid_by_reference("ref-1").await?, 0x1A2B);
    let stored = h
        .repo
        .contexts()
        .get_by_seid(0x1A2B)
        .await?
        .context("context not reachable by seid")?;
    assert_eq!(stored.reference(), "ref-1");
    Ok(())
}

#[tokio::test]
async fn test_seid_association_durable() -> Result<()> {
    seid_association(&Harness::durable().await?).await
}

#[tokio::test]
async fn test_seid_association_distributed() -> Result<()> {
    seid_association(&Harness::distributed().await?).await
}

/// Every put leaves the index a bijection: rebinding a reference frees its
/// old SEID, and rebinding a SEID moves it to the new reference.
#[tokio::test]
async fn test_index_stays_bijective() -> Result<()> {
    for h in [Harness::durable().await?, Harness::distributed().await?] {
        let index = h.repo.index();
        index.put("ref-a", 1).await?;
        index.put("ref-b", 2).await?;
        h.repo.flush().await;
        index.put("ref-a", 3).await?;
        h.repo.flush().await;

        for (reference, seid) in [("ref-a", 3), ("ref-b", 2)] {
            assert_eq!(index.seid_by_reference(reference).await?, seid);
            assert_eq!(index.reference_by_seid(seid).await?, reference);
        }
        assert!(index.reference_by_seid(1).await.unwrap_err().is_not_found());

        // SEID 2 moves from ref-b to ref-c; retiring ref-b must not take it along.
        index.put("ref-c", 2).await?;
        h.repo.flush().await;
        assert!(index.seid_by_reference("ref-b").await.unwrap_err().is_not_found());
        assert_eq!(index.reference_by_seid(2).await?, "ref-c");
        index.delete("ref-b").await?;
        h.repo.flush().await;
        assert_eq!(index.reference_by_seid(2).await?, "ref-c");
        assert_eq!(index.seid_by_reference("ref-c").await?, 2);
    }
    Ok(())
}

/// Two tasks store different instances for one reference at the same time.
/// The pool ends with one of them and the stored record is one of the two
/// writes in full.
async fn concurrent_stores(h: &Harness) -> Result<()> {
    for round in 0..20 {
        let reference = format!("ref-c-{round}");
        let a = session(&reference);
        let b = session(&reference);
        {
            let mut state = b.lock().await;
            state.supi = "imsi-208930000000999".into();
            state.dnn = "ims".into();
            state.pdu_session_id = 99;
            state.status = SmContextStatus::InactivePending;
        }

        let (ra, rb) = tokio::join!(
            tokio::spawn({
                let repo = h.repo.clone();
                let a = a.clone();
                async move { repo.store(a).await }
            }),
            tokio::spawn({
                let repo = h.repo.clone();
                let b = b.clone();
                async move { repo.store(b).await }
            }),
        );
        ra??;
        rb??;
        h.repo.flush().await;

        assert_eq!(
            h.repo.pool().references().iter().filter(|r| **r == reference).count(),
            1
        );
        let pooled = h.repo.pool().get(&reference).context("pool entry missing")?;
        assert!(Arc::ptr_eq(&pooled, &a) || Arc::ptr_eq(&pooled, &b));

        let record = persisted(h, &reference).await?;
        let fields = (
            record.supi.as_str(),
            record.dnn.as_str(),
            record.pdu_session_id,
            record.sm_context_state,
        );
        assert!(
            fields == ("imsi-208930000000003", "internet", 10, SmContextStatus::Active)
                || fields == ("imsi-208930000000999", "ims", 99, SmContextStatus::InactivePending),
            "torn record in round {round}: {fields:?}"
        );
    }
    Ok(())
}

/// The raw stored record for `reference`, read around the repository.
async fn persisted(h: &Harness, reference: &str) -> Result<codec::SmContextRecord> {
    let record = if h.repo.pipeline_stats().is_some() {
        let raw = h
            .cache
            .peek(&format!("smctx:{reference}"))
            .context("record not cached")?;
        codec::from_json(&raw)?
    } else {
        let document = h
            .db
            .find_one("smf.data.smContext", &Filter::eq("ref", reference))
            .await?
            .context("record not stored")?;
        codec::from_document(document)?
    };
    Ok(record)
}

#[tokio::test]
async fn test_concurrent_stores_durable() -> Result<()> {
    concurrent_stores(&Harness::durable().await?).await
}

#[tokio::test]
async fn test_concurrent_stores_distributed() -> Result<()> {
    concurrent_stores(&Harness::distributed().await?).await
}

/// A mutation in progress holds the context lock, so a concurrent store
/// sees either none or all of it.
#[tokio::test]
async fn test_store_waits_for_mutation() -> Result<()> {
    for h in [Harness::durable().await?, Harness::distributed().await?] {
        let ctx = session("ref-m");
        h.repo.store(ctx.clone()).await?;
        h.repo.flush().await;

        let mut state = ctx.lock().await;
        let store = tokio::spawn({
            let repo = h.repo.clone();
            let ctx = ctx.clone();
            async move { repo.store(ctx).await }
        });
        state.supi = "imsi-208930000000777".into();
        tokio::task::yield_now().await;
        state.dnn = "ims".into();
        tokio::task::yield_now().await;
        state.pdu_session_id = 77;
        drop(state);
        store.await??;
        h.repo.flush().await;

        let record = persisted(&h, "ref-m").await?;
        assert_eq!(
            (record.supi.as_str(), record.dnn.as_str(), record.pdu_session_id),
            ("imsi-208930000000777", "ims", 77)
        );
    }
    Ok(())
}

/// Retiring twice, or retiring something that never existed, succeeds.
#[tokio::test]
async fn test_deletes_are_idempotent() -> Result<()> {
    for h in [Harness::durable().await?, Harness::distributed().await?] {
        let ctx = session("ref-d");
        h.repo.store(ctx.clone()).await?;
        h.repo.associate_seid(&ctx, 44).await?;

        h.repo.retire("ref-d").await?;
        h.repo.retire("ref-d").await?;
        h.repo.retire("never-existed").await?;
        h.repo.contexts().delete_by_seid(44).await?;
        h.repo.contexts().delete_by_seid(0xffff).await?;
        h.repo.index().delete("never-existed").await?;
        h.repo.flush().await;

        assert!(h.repo.find_by_reference("ref-d").await?.is_none());
        assert!(h.repo.find_by_seid(44).await?.is_none());
        assert!(matches!(
            h.repo.index().seid_by_reference("ref-d").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(h.cache.is_empty());
        assert_eq!(h.db.count("smf.data.smContext"), 0);
    }
    Ok(())
}
