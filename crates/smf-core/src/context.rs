//! Session context model.
//!
//! One `SmContext` per PDU session. The reference is immutable; everything
//! else lives in `SmContextState` behind the context's own lock. Protocol
//! handlers hold that lock across read-modify-write sequences, and the codec
//! holds it for every encode.
//!
//! The user-plane tunnel is a pointer graph: data-path nodes are shared
//! (`NodeRef`) and link to their successors strongly and to their
//! predecessor weakly. The codec flattens it into a tree for storage.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

// ── Context ───────────────────────────────────────────────────────────────────

/// A live session context.
pub struct SmContext {
    reference: String,
    state: Mutex<SmContextState>,
}

impl SmContext {
    /// Fresh context with default state.
    pub fn new(reference: impl Into<String>) -> Self {
        Self::with_state(reference, SmContextState::default())
    }

    pub fn with_state(reference: impl Into<String>, state: SmContextState) -> Self {
        Self {
            reference: reference.into(),
            state: Mutex::new(state),
        }
    }

    /// Opaque, globally unique identity of this session.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Acquire the context lock.
    pub async fn lock(&self) -> MutexGuard<'_, SmContextState> {
        self.state.lock().await
    }

    /// Acquire the context lock without waiting.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, SmContextState>> {
        self.state.try_lock().ok()
    }
}

impl std::fmt::Debug for SmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmContext")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a session context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmContextStatus {
    #[default]
    Init,
    ActivePending,
    Active,
    InactivePending,
    Inactive,
    ModificationPending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snssai {
    pub sst: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd: Option<String>,
}

/// Mutable part of a session context.
#[derive(Debug, Default)]
pub struct SmContextState {
    /// Local SEID, set once the PFCP association completes.
    pub seid: Option<u64>,
    pub supi: String,
    pub pei: String,
    pub gpsi: String,
    pub pdu_session_id: u8,
    pub dnn: String,
    pub snssai: Option<Snssai>,
    pub serving_nf_id: String,
    pub up_cnx_state: String,
    pub an_type: String,
    pub rat_type: String,
    pub pdu_address: Option<Ipv4Addr>,
    pub sm_status_notify_uri: String,
    pub status: SmContextStatus,
    /// None until the user-plane tunnel is established.
    pub tunnel: Option<UpTunnel>,
    /// PFCP state per UPF node id.
    pub pfcp_contexts: BTreeMap<String, PfcpSessionContext>,
}

// ── PFCP ──────────────────────────────────────────────────────────────────────

/// Packet detection rule installed on a UPF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pdr {
    pub pdr_id: u16,
    pub precedence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub far_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qer_ids: Vec<u32>,
}

/// PFCP session state towards one UPF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PfcpSessionContext {
    pub node_id: String,
    pub pdrs: BTreeMap<u16, Pdr>,
    pub local_seid: u64,
    pub remote_seid: u64,
}

// ── Tunnel ────────────────────────────────────────────────────────────────────

/// Access-network side of the N3 tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnInformation {
    pub ip_address: Option<Ipv4Addr>,
    pub teid: u32,
}

/// User-plane tunnel of a session: a pool of data paths.
#[derive(Debug, Default)]
pub struct UpTunnel {
    pub an_information: Option<AnInformation>,
    pub data_path_pool: BTreeMap<i64, DataPath>,
    path_ids: PathIdGenerator,
}

impl UpTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a data path under a freshly allocated id.
    /// Returns None when the id space is exhausted.
    pub fn add_data_path(&mut self, path: DataPath) -> Option<i64> {
        let pool = &self.data_path_pool;
        let id = self.path_ids.allocate(|id| pool.contains_key(&id))?;
        self.data_path_pool.insert(id, path);
        Some(id)
    }

    /// Insert a data path under a known id, replacing any previous one.
    pub fn insert_data_path(&mut self, id: i64, path: DataPath) -> Option<DataPath> {
        self.data_path_pool.insert(id, path)
    }

    pub fn remove_data_path(&mut self, id: i64) -> Option<DataPath> {
        self.data_path_pool.remove(&id)
    }

    /// The path flagged as default, if any.
    pub fn default_path(&self) -> Option<(i64, &DataPath)> {
        self.data_path_pool
            .iter()
            .find(|(_, p)| p.is_default_path)
            .map(|(id, p)| (*id, p))
    }
}

/// Allocates data-path ids in `[min, max]`, wrapping around and skipping
/// ids still in use. Its cursor is process-local and never persisted.
#[derive(Debug, Clone)]
pub struct PathIdGenerator {
    min: i64,
    max: i64,
    next: i64,
}

pub const PATH_ID_MIN: i64 = 1;
pub const PATH_ID_MAX: i64 = 2_147_483_647;

impl Default for PathIdGenerator {
    fn default() -> Self {
        Self::new(PATH_ID_MIN, PATH_ID_MAX)
    }
}

impl PathIdGenerator {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max, next: min }
    }

    pub fn allocate(&mut self, in_use: impl Fn(i64) -> bool) -> Option<i64> {
        let span = (self.max - self.min).checked_add(1)?;
        let mut candidate = self.next;
        for _ in 0..span {
            let following = if candidate >= self.max {
                self.min
            } else {
                candidate + 1
            };
            if !in_use(candidate) {
                self.next = following;
                return Some(candidate);
            }
            candidate = following;
        }
        None
    }
}

/// Where a data path leads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default)]
    pub destination_ip: String,
    #[serde(default)]
    pub destination_port: String,
    #[serde(default)]
    pub url: String,
}

/// One forwarding path through a chain of UPFs.
#[derive(Debug, Default)]
pub struct DataPath {
    pub activated: bool,
    pub is_default_path: bool,
    pub destination: Destination,
    pub has_branching_point: bool,
    pub first_dp_node: Option<NodeRef>,
}

impl DataPath {
    /// Build a linear path through the given UPFs, first node first.
    pub fn through(upf_node_ids: &[&str]) -> Self {
        let mut first: Option<NodeRef> = None;
        let mut last: Option<NodeRef> = None;
        for id in upf_node_ids {
            let node = DataPathNode::new(*id);
            match &last {
                Some(prev) => DataPathNode::link(prev, &node),
                None => first = Some(node.clone()),
            }
            last = Some(node);
        }
        Self {
            first_dp_node: first,
            ..Self::default()
        }
    }

    /// Nodes in depth-first order starting at the first node. Each node is
    /// visited once even if the graph is malformed.
    pub fn nodes(&self) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeRef> = self.first_dp_node.iter().cloned().collect();
        while let Some(node) = stack.pop() {
            if !seen.insert(Arc::as_ptr(&node)) {
                continue;
            }
            stack.extend(node.read().next.iter().rev().cloned());
            out.push(node);
        }
        out
    }

    /// UPF ids in depth-first order.
    pub fn upf_chain(&self) -> Vec<String> {
        self.nodes()
            .iter()
            .map(|n| n.read().upf_node_id.clone())
            .collect()
    }
}

/// Shared handle to a data-path node.
pub type NodeRef = Arc<RwLock<DataPathNode>>;

/// GTP-U leg between two hops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GtpTunnel {
    pub teid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pdr_ids: Vec<u16>,
}

/// One UPF hop of a data path.
#[derive(Debug, Default)]
pub struct DataPathNode {
    pub upf_node_id: String,
    pub uplink: Option<GtpTunnel>,
    pub downlink: Option<GtpTunnel>,
    prev: Weak<RwLock<DataPathNode>>,
    next: Vec<NodeRef>,
}

impl DataPathNode {
    pub fn new(upf_node_id: impl Into<String>) -> NodeRef {
        Arc::new(RwLock::new(Self {
            upf_node_id: upf_node_id.into(),
            ..Self::default()
        }))
    }

    /// Append `child` to `parent`'s successors. A second successor makes
    /// `parent` a branching point.
    pub fn link(parent: &NodeRef, child: &NodeRef) {
        child.write().prev = Arc::downgrade(parent);
        parent.write().next.push(child.clone());
    }

    pub fn next(&self) -> &[NodeRef] {
        &self.next
    }

    pub fn prev(&self) -> Option<NodeRef> {
        self.prev.upgrade()
    }

    pub fn is_branching_point(&self) -> bool {
        self.next.len() > 1
    }
}
