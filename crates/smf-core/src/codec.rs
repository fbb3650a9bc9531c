//! Storage codec for session contexts.
//!
//! `encode` turns a context into an `SmContextRecord`, a plain serde tree
//! that is stored as a database document or as a JSON cache value.
//! `decode` rebuilds a live context from it.
//!
//! Two things do not survive JSON as-is:
//!   - 64-bit SEIDs, stored as base-16 strings (see `seid`).
//!   - the data-path node graph, stored as nested `DataPathNodeRecord`s;
//!     predecessor links are restored on decode.
//!
//! A missing tunnel is stored as the empty sentinel `{}`. An established
//! tunnel always carries `dataPathPool`, even when it is empty.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::num::ParseIntError;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::{
    AnInformation, DataPath, DataPathNode, Destination, GtpTunnel, NodeRef, PfcpSessionContext,
    Pdr, SmContext, SmContextState, SmContextStatus, Snssai, UpTunnel,
};
use crate::seid;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed record: {0}")]
    MalformedRecord(#[source] serde_json::Error),
    #[error("malformed record: expected a JSON object")]
    NotAnObject,
    #[error("{field} is not a 64-bit hex value: {value:?}")]
    NumericRange {
        field: String,
        value: String,
        #[source]
        source: ParseIntError,
    },
    /// A chain that loops back, or two branches sharing one node. Stored
    /// paths are trees, so both are rejected on encode.
    #[error("data path node {0} is reachable twice")]
    RevisitedDataPathNode(String),
    #[error("failed to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Stored form of a session context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmContextRecord {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seid: Option<String>,
    #[serde(default)]
    pub supi: String,
    #[serde(default)]
    pub pei: String,
    #[serde(default)]
    pub gpsi: String,
    #[serde(default)]
    pub pdu_session_id: u8,
    #[serde(default)]
    pub dnn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snssai: Option<Snssai>,
    #[serde(default)]
    pub serving_nf_id: String,
    #[serde(default)]
    pub up_cnx_state: String,
    #[serde(default)]
    pub an_type: String,
    #[serde(default)]
    pub rat_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdu_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub sm_status_notify_uri: String,
    #[serde(default)]
    pub sm_context_state: SmContextStatus,
    #[serde(default)]
    pub pfcp_context: BTreeMap<String, PfcpSessionContextRecord>,
    pub tunnel: UpTunnelRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PfcpSessionContextRecord {
    pub node_id: String,
    #[serde(default)]
    pub pdrs: BTreeMap<u16, Pdr>,
    pub local_seid: String,
    pub remote_seid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpTunnelRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub an_information: Option<AnInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path_pool: Option<BTreeMap<i64, DataPathRecord>>,
}

impl UpTunnelRecord {
    /// The "no tunnel" sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.an_information.is_none() && self.data_path_pool.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPathRecord {
    #[serde(default)]
    pub activated: bool,
    #[serde(default)]
    pub is_default_path: bool,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub has_branching_point: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_dp_node: Option<DataPathNodeRecord>,
}

/// A data-path node and, nested, everything downstream of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPathNodeRecord {
    pub upf_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink: Option<GtpTunnel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink: Option<GtpTunnel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<DataPathNodeRecord>,
}

/// Index entry tying a reference to a SEID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeidSmContextRef {
    #[serde(rename = "ref")]
    pub reference: String,
    pub seid: String,
}

impl SeidSmContextRef {
    pub fn new(reference: impl Into<String>, seid: u64) -> Self {
        Self {
            reference: reference.into(),
            seid: seid::to_hex(seid),
        }
    }

    pub fn seid(&self) -> Result<u64, CodecError> {
        parse_seid("seid", &self.seid)
    }
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Encode a context while holding its lock.
pub async fn snapshot(ctx: &SmContext) -> Result<SmContextRecord, CodecError> {
    let state = ctx.lock().await;
    encode(ctx.reference(), &state)
}

/// Encode already-locked state.
pub fn encode(reference: &str, state: &SmContextState) -> Result<SmContextRecord, CodecError> {
    let tunnel = match &state.tunnel {
        Some(tunnel) => encode_tunnel(tunnel)?,
        None => UpTunnelRecord::default(),
    };

    let pfcp_context = state
        .pfcp_contexts
        .iter()
        .map(|(key, pfcp)| {
            let record = PfcpSessionContextRecord {
                node_id: pfcp.node_id.clone(),
                pdrs: pfcp.pdrs.clone(),
                local_seid: seid::to_hex(pfcp.local_seid),
                remote_seid: seid::to_hex(pfcp.remote_seid),
            };
            (key.clone(), record)
        })
        .collect();

    Ok(SmContextRecord {
        reference: reference.to_string(),
        seid: state.seid.map(seid::to_hex),
        supi: state.supi.clone(),
        pei: state.pei.clone(),
        gpsi: state.gpsi.clone(),
        pdu_session_id: state.pdu_session_id,
        dnn: state.dnn.clone(),
        snssai: state.snssai.clone(),
        serving_nf_id: state.serving_nf_id.clone(),
        up_cnx_state: state.up_cnx_state.clone(),
        an_type: state.an_type.clone(),
        rat_type: state.rat_type.clone(),
        pdu_address: state.pdu_address,
        sm_status_notify_uri: state.sm_status_notify_uri.clone(),
        sm_context_state: state.status,
        pfcp_context,
        tunnel,
    })
}

fn encode_tunnel(tunnel: &UpTunnel) -> Result<UpTunnelRecord, CodecError> {
    let mut pool = BTreeMap::new();
    for (id, path) in &tunnel.data_path_pool {
        let mut seen = HashSet::new();
        let first_dp_node = match &path.first_dp_node {
            Some(node) => Some(flatten_node(node, &mut seen)?),
            None => None,
        };
        pool.insert(
            *id,
            DataPathRecord {
                activated: path.activated,
                is_default_path: path.is_default_path,
                destination: path.destination.clone(),
                has_branching_point: path.has_branching_point,
                first_dp_node,
            },
        );
    }
    Ok(UpTunnelRecord {
        an_information: tunnel.an_information.clone(),
        data_path_pool: Some(pool),
    })
}

fn flatten_node(
    node: &NodeRef,
    seen: &mut HashSet<*const parking_lot::RwLock<DataPathNode>>,
) -> Result<DataPathNodeRecord, CodecError> {
    if !seen.insert(Arc::as_ptr(node)) {
        // An ancestor may still hold this node's read guard.
        let id = node.read_recursive().upf_node_id.clone();
        return Err(CodecError::RevisitedDataPathNode(id));
    }
    let guard = node.read();
    let next = guard
        .next()
        .iter()
        .map(|child| flatten_node(child, seen))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DataPathNodeRecord {
        upf_node_id: guard.upf_node_id.clone(),
        uplink: guard.uplink.clone(),
        downlink: guard.downlink.clone(),
        next,
    })
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Rebuild a live context. Transient state (lock, path-id cursor) is fresh.
pub fn decode(record: SmContextRecord) -> Result<SmContext, CodecError> {
    let seid = record
        .seid
        .as_deref()
        .map(|s| parse_seid("seid", s))
        .transpose()?;

    let mut pfcp_contexts = BTreeMap::new();
    for (key, pfcp) in record.pfcp_context {
        let local_seid = parse_seid(&format!("pfcpContext.{key}.localSeid"), &pfcp.local_seid)?;
        let remote_seid = parse_seid(&format!("pfcpContext.{key}.remoteSeid"), &pfcp.remote_seid)?;
        pfcp_contexts.insert(
            key,
            PfcpSessionContext {
                node_id: pfcp.node_id,
                pdrs: pfcp.pdrs,
                local_seid,
                remote_seid,
            },
        );
    }

    let tunnel = if record.tunnel.is_sentinel() {
        None
    } else {
        Some(decode_tunnel(record.tunnel))
    };

    let state = SmContextState {
        seid,
        supi: record.supi,
        pei: record.pei,
        gpsi: record.gpsi,
        pdu_session_id: record.pdu_session_id,
        dnn: record.dnn,
        snssai: record.snssai,
        serving_nf_id: record.serving_nf_id,
        up_cnx_state: record.up_cnx_state,
        an_type: record.an_type,
        rat_type: record.rat_type,
        pdu_address: record.pdu_address,
        sm_status_notify_uri: record.sm_status_notify_uri,
        status: record.sm_context_state,
        tunnel,
        pfcp_contexts,
    };
    Ok(SmContext::with_state(record.reference, state))
}

fn decode_tunnel(record: UpTunnelRecord) -> UpTunnel {
    let mut tunnel = UpTunnel::new();
    tunnel.an_information = record.an_information;
    for (id, path) in record.data_path_pool.unwrap_or_default() {
        let data_path = DataPath {
            activated: path.activated,
            is_default_path: path.is_default_path,
            destination: path.destination,
            has_branching_point: path.has_branching_point,
            first_dp_node: path.first_dp_node.map(rebuild_node),
        };
        tunnel.insert_data_path(id, data_path);
    }
    tunnel
}

fn rebuild_node(record: DataPathNodeRecord) -> NodeRef {
    let node = DataPathNode::new(record.upf_node_id);
    {
        let mut guard = node.write();
        guard.uplink = record.uplink;
        guard.downlink = record.downlink;
    }
    for child in record.next {
        let child = rebuild_node(child);
        DataPathNode::link(&node, &child);
    }
    node
}

fn parse_seid(field: &str, value: &str) -> Result<u64, CodecError> {
    seid::from_hex(value).map_err(|source| CodecError::NumericRange {
        field: field.to_string(),
        value: value.to_string(),
        source,
    })
}

// ── JSON / document helpers ───────────────────────────────────────────────────

pub fn to_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(CodecError::Serialize)
}

pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(CodecError::MalformedRecord)
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, CodecError> {
    match serde_json::to_value(value).map_err(CodecError::Serialize)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(CodecError::NotAnObject),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, CodecError> {
    serde_json::from_value(serde_json::Value::Object(document)).map_err(CodecError::MalformedRecord)
}
