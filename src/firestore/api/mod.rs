mod client;
pub(crate) mod operations;
mod write_batch;

pub use client::{FirestoreClient, ListenerRegistration};
pub use operations::{parse_set_data, parse_update_data, SetOptions};
pub use write_batch::WriteBatch;
