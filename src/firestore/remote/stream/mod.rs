pub mod persistent;

pub use persistent::{PersistentStream, PersistentStreamDelegate, StreamKind, StreamState};
