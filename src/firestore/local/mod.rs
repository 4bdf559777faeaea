pub mod collection_parent_index;
pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod overlay_arena;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod sync_engine;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
#[doc(inline)]
pub use persistence::{open_persistence, Persistence, PersistenceTransaction, Table, TransactionMode};
#[doc(inline)]
pub use query_engine::{QueryEngine, QueryStrategy};
#[doc(inline)]
pub use sync_engine::SyncEngine;
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
