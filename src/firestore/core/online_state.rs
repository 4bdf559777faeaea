/// Best guess about the connection to the backend, shared with listeners so
/// they can decide when to raise cache-only snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Initial state, and the state after the network is re-enabled.
    #[default]
    Unknown,
    Online,
    Offline,
}
