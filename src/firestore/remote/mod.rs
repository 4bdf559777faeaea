//! Everything that talks to the backend: the watch and write streams, their
//! JSON codecs and the [`RemoteStore`] that drives them.

pub mod backoff;
pub mod bloom_filter;
pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use datastore::{
    InMemoryStreamingDatastore, NoopTokenProvider, ServerStream, StreamHandle,
    StreamingDatastore, TokenProvider, TokenProviderArc,
};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
