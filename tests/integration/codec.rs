use std::collections::BTreeMap;

use smf_core::{PfcpSessionContext, Pdr, UpTunnel};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Storage round trip: what goes in comes back after a restart
// ══════════════════════════════════════════════════════════════════════════════

async fn harness(scaling: bool) -> Result<Harness> {
    if scaling {
        Harness::distributed().await
    } else {
        Harness::durable().await
    }
}

/// Two data paths, one of them a branching chain, must come back with the
/// same node order, flags and predecessor links.
async fn tunnel_round_trip(scaling: bool) -> Result<()> {
    let h = harness(scaling).await?;
    h.repo.store(session_with_tunnel("ref-b")).await?;
    h.repo.flush().await;

    let restarted = h.sibling(scaling).await?;
    let loaded = restarted
        .repo
        .find_by_reference("ref-b")
        .await?
        .context("context missing after restart")?;
    let state = loaded.lock().await;

    assert_eq!(state.supi, "imsi-208930000000003");
    assert_eq!(state.snssai.as_ref().map(|s| s.sst), Some(1));
    assert_eq!(state.pdu_address, Some("10.60.0.1".parse::<std::net::Ipv4Addr>()?));
    assert_eq!(state.status, SmContextStatus::Active);

    let tunnel = state.tunnel.as_ref().context("tunnel missing")?;
    assert_eq!(tunnel.an_information.as_ref().map(|a| a.teid), Some(0x100));
    assert_eq!(tunnel.data_path_pool.len(), 2);

    let (_, default) = tunnel.default_path().context("no default path")?;
    assert!(default.activated);
    assert_eq!(default.upf_chain(), vec!["upf-edge"]);

    let chain = tunnel
        .data_path_pool
        .values()
        .find(|p| !p.is_default_path)
        .context("branching path missing")?;
    assert!(chain.has_branching_point);
    assert!(!chain.activated);
    assert_eq!(
        chain.upf_chain(),
        vec!["upf-i", "upf-branch", "upf-psa1", "upf-psa2"]
    );

    let nodes = chain.nodes();
    assert!(nodes[0].read().prev().is_none());
    assert!(nodes[1].read().is_branching_point());
    for (child, parent) in [(1, 0), (2, 1), (3, 1)] {
        let prev = nodes[child].read().prev().context("predecessor missing")?;
        assert!(Arc::ptr_eq(&prev, &nodes[parent]), "wrong predecessor for node {child}");
    }
    let uplink = nodes[0].read().uplink.clone().context("uplink missing")?;
    assert_eq!(uplink.teid, 1);
    assert_eq!(uplink.pdr_ids, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_branching_tunnel_round_trip_durable() -> Result<()> {
    tunnel_round_trip(false).await
}

#[tokio::test]
async fn test_branching_tunnel_round_trip_distributed() -> Result<()> {
    tunnel_round_trip(true).await
}

/// SEIDs at both ends of the 64-bit range survive the context record, the
/// PFCP state and the index.
#[tokio::test]
async fn test_extreme_seids_survive() -> Result<()> {
    for scaling in [false, true] {
        let h = harness(scaling).await?;
        for (reference, seid) in [("ref-zero", 0u64), ("ref-max", u64::MAX)] {
            let ctx = session(reference);
            {
                let mut state = ctx.lock().await;
                let mut pdrs = BTreeMap::new();
                pdrs.insert(
                    1,
                    Pdr {
                        pdr_id: 1,
                        precedence: 255,
                        far_id: Some(1),
                        qer_ids: vec![1],
                    },
                );
                state.pfcp_contexts.insert(
                    "upf-1".into(),
                    PfcpSessionContext {
                        node_id: "upf-1".into(),
                        pdrs,
                        local_seid: seid,
                        remote_seid: u64::MAX - seid,
                    },
                );
            }
            h.repo.store(ctx.clone()).await?;
            h.repo.associate_seid(&ctx, seid).await?;
        }
        h.repo.flush().await;

        let restarted = h.sibling(scaling).await?;
        for (reference, seid) in [("ref-zero", 0u64), ("ref-max", u64::MAX)] {
            let loaded = restarted
                .repo
                .find_by_seid(seid)
                .await?
                .with_context(|| format!("{reference} missing (scaling={scaling})"))?;
            assert_eq!(loaded.reference(), reference);
            let state = loaded.lock().await;
            assert_eq!(state.seid, Some(seid));
            let pfcp = state.pfcp_contexts.get("upf-1").context("pfcp state missing")?;
            assert_eq!(pfcp.local_seid, seid);
            assert_eq!(pfcp.remote_seid, u64::MAX - seid);
            assert_eq!(pfcp.pdrs[&1u16].far_id, Some(1));
            assert_eq!(restarted.repo.index().seid_by_reference(reference).await?, seid);
        }
    }
    Ok(())
}

/// "No tunnel yet" and "tunnel with no paths" are different states and
/// must stay different.
#[tokio::test]
async fn test_absent_and_empty_tunnels_stay_distinct() -> Result<()> {
    let h = Harness::durable().await?;
    let without = session("ref-none");
    let empty = session("ref-empty");
    empty.lock().await.tunnel = Some(UpTunnel::new());
    h.repo.store(without).await?;
    h.repo.store(empty).await?;

    let restarted = h.sibling(false).await?;
    let without = restarted.repo.find_by_reference("ref-none").await?.context("missing")?;
    let empty = restarted.repo.find_by_reference("ref-empty").await?.context("missing")?;
    assert!(without.lock().await.tunnel.is_none());
    let state = empty.lock().await;
    let tunnel = state.tunnel.as_ref().context("empty tunnel lost")?;
    assert!(tunnel.data_path_pool.is_empty());
    Ok(())
}

/// The stored document is plain JSON with the SEID in hex.
#[tokio::test]
async fn test_stored_record_layout() -> Result<()> {
    let h = Harness::distributed().await?;
    let ctx = session("ref-json");
    h.repo.store(ctx.clone()).await?;
    h.repo.associate_seid(&ctx, 0x1A2B).await?;
    h.repo.flush().await;

    let raw = h.cache.peek("smctx:ref-json").context("context not cached")?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(value["ref"], "ref-json");
    assert_eq!(value["seid"], "1a2b");
    assert_eq!(value["tunnel"], serde_json::json!({}));

    let index: serde_json::Value =
        serde_json::from_str(&h.cache.peek("seid2ref:1a2b").context("index not cached")?)?;
    assert_eq!(index["ref"], "ref-json");
    Ok(())
}
