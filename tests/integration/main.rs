//! SMF session store integration test harness.
//!
//! Tests run against the embedded in-process backends, in both durable and
//! distributed mode. No external services are needed:
//!
//!   cargo test --test integration
//!
//! Each test builds its own `Harness`; nothing is shared between tests.

use std::sync::Arc;

use anyhow::{Context, Result};

use smf_core::{
    AnInformation, DataPath, DataPathNode, GtpTunnel, SmContext, SmContextState, SmContextStatus,
    SmfStoreConfig, Snssai, UpTunnel,
};
use smf_services::{MemoryCache, MemoryDocumentStore, SessionRepository, Supervisor};

mod codec;
mod failures;
mod ordering;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A repository plus direct handles on its backends.
pub struct Harness {
    pub repo: Arc<SessionRepository>,
    pub db: MemoryDocumentStore,
    pub cache: MemoryCache,
    /// Keeps the write-behind workers alive.
    pub supervisor: Supervisor,
}

impl Harness {
    pub async fn durable() -> Result<Self> {
        Self::open(MemoryDocumentStore::new(), MemoryCache::new(), config(false)).await
    }

    pub async fn distributed() -> Result<Self> {
        Self::open(MemoryDocumentStore::new(), MemoryCache::new(), config(true)).await
    }

    /// A second instance over the same backends, as after a restart or on a
    /// sibling node.
    pub async fn sibling(&self, scaling: bool) -> Result<Self> {
        Self::open(self.db.clone(), self.cache.clone(), config(scaling)).await
    }

    async fn open(db: MemoryDocumentStore, cache: MemoryCache, config: SmfStoreConfig) -> Result<Self> {
        let mut supervisor = Supervisor::new();
        let repo = SessionRepository::open(
            &config,
            Arc::new(db.clone()),
            Some(Arc::new(cache.clone())),
            &mut supervisor,
        )
        .await
        .context("failed to open repository")?;
        Ok(Self {
            repo: Arc::new(repo),
            db,
            cache,
            supervisor,
        })
    }
}

pub fn config(scaling: bool) -> SmfStoreConfig {
    let mut config = SmfStoreConfig::default();
    config.scaling.enabled = scaling;
    config.pipeline.queue_capacity = 64;
    config.pipeline.workers = 4;
    config
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// A registered session with descriptive fields filled in and no tunnel.
pub fn session(reference: &str) -> Arc<SmContext> {
    Arc::new(SmContext::with_state(
        reference,
        SmContextState {
            supi: "imsi-208930000000003".into(),
            pei: "imeisv-4370816125816151".into(),
            gpsi: "msisdn-0900000000".into(),
            pdu_session_id: 10,
            dnn: "internet".into(),
            snssai: Some(Snssai {
                sst: 1,
                sd: Some("010203".into()),
            }),
            serving_nf_id: "amf-1".into(),
            an_type: "3GPP_ACCESS".into(),
            rat_type: "NR".into(),
            pdu_address: Some("10.60.0.1".parse().expect("valid address")),
            status: SmContextStatus::Active,
            ..Default::default()
        },
    ))
}

/// The session of `session`, plus a tunnel with two data paths: a default
/// single-hop path and a three-node chain whose middle node branches.
pub fn session_with_tunnel(reference: &str) -> Arc<SmContext> {
    let ctx = session(reference);
    let mut tunnel = UpTunnel::new();
    tunnel.an_information = Some(AnInformation {
        ip_address: Some("192.168.1.20".parse().expect("valid address")),
        teid: 0x100,
    });

    let mut default = DataPath::through(&["upf-edge"]);
    default.is_default_path = true;
    default.activated = true;
    tunnel.add_data_path(default);

    let mut chain = DataPath::through(&["upf-i", "upf-branch", "upf-psa1"]);
    if let Some(first) = &chain.first_dp_node {
        first.write().uplink = Some(GtpTunnel {
            teid: 1,
            pdr_ids: vec![1, 2],
        });
        let branch = first.read().next()[0].clone();
        DataPathNode::link(&branch, &DataPathNode::new("upf-psa2"));
    }
    chain.has_branching_point = true;
    tunnel.add_data_path(chain);

    if let Some(mut state) = ctx.try_lock() {
        state.tunnel = Some(tunnel);
    }
    ctx
}
