//! smf-services: session persistence for the SMF.
//!
//! Backends, the identifier index, the context store, the write-behind
//! pipeline and the local context pool, tied together by `SessionRepository`.

pub mod backend;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod pool;
pub mod repository;
pub mod store;
pub mod supervisor;

pub use backend::{DocumentStore, Filter, KeyValueCache, MemoryCache, MemoryDocumentStore};
pub use error::{BackendError, StoreError};
pub use index::{CachedIndex, DurableIndex, IdentifierIndex};
pub use pipeline::{DeleteRequest, PipelineStats, WriteBehind, WriteBehindWorkers};
pub use pool::ContextPool;
pub use repository::SessionRepository;
pub use store::{CachedContextStore, ContextStore, DurableContextStore, StoreMode};
pub use supervisor::{Supervisor, TaskExit};

#[cfg(feature = "mongodb")]
pub use backend::mongo::MongoDocumentStore;
#[cfg(feature = "redis")]
pub use backend::redis_cache::RedisCache;
