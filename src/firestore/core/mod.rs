pub mod event_manager;
pub mod filter;
pub mod online_state;
pub mod order_by;
pub mod query;
pub mod target;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerEvent, SnapshotCallback};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use online_state::OnlineState;
pub use order_by::{Bound, Direction, OrderBy};
pub use query::{LimitType, Query};
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
