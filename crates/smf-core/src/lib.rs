//! smf-core: session context model, storage codec, and configuration.
//! The service and daemon crates depend on this one.

pub mod codec;
pub mod config;
pub mod context;
pub mod seid;

pub use codec::{CodecError, Document, SeidSmContextRef, SmContextRecord};
pub use config::SmfStoreConfig;
pub use context::{
    AnInformation, DataPath, DataPathNode, Destination, GtpTunnel, NodeRef, PathIdGenerator, Pdr,
    PfcpSessionContext, SmContext, SmContextState, SmContextStatus, Snssai, UpTunnel,
};
