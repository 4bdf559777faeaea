use crate::firestore::core::OnlineState;
use crate::firestore::error::FirestoreError;

/// Derives the [`OnlineState`] from watch stream health.
///
/// A failure while `Online` drops back to `Unknown`; otherwise the state
/// turns `Offline` once `max_failures` consecutive failures happened without
/// the stream ever delivering a snapshot. Every method returns the new state
/// when it changed.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    max_failures: u32,
    should_warn_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            max_failures: max_failures.max(1),
            should_warn_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures == 0 {
            return self.apply(OnlineState::Unknown);
        }
        None
    }

    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.apply(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures < self.max_failures {
            return None;
        }
        if self.should_warn_offline {
            log::warn!(
                "Could not reach the backend after {} attempts ({error}). Operating in offline mode until the connection succeeds.",
                self.watch_stream_failures
            );
            self.should_warn_offline = false;
        }
        self.apply(OnlineState::Offline)
    }

    /// Explicit transition, e.g. `Online` after the first snapshot or
    /// `Offline` when the network is disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_offline = false;
        }
        self.apply(state)
    }

    fn apply(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    #[test]
    fn failures_turn_offline_after_threshold() {
        let mut tracker = OnlineStateTracker::new(2);
        assert_eq!(tracker.handle_watch_stream_start(), None);
        assert_eq!(tracker.handle_watch_stream_failure(&unavailable("down")), None);
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("down")),
            Some(OnlineState::Offline)
        );
        assert_eq!(tracker.handle_watch_stream_failure(&unavailable("down")), None);
    }

    #[test]
    fn failure_while_online_returns_to_unknown() {
        let mut tracker = OnlineStateTracker::new(1);
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("down")),
            Some(OnlineState::Unknown)
        );
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("down")),
            Some(OnlineState::Offline)
        );
        assert_eq!(tracker.set(OnlineState::Unknown), Some(OnlineState::Unknown));
        assert_eq!(tracker.state(), OnlineState::Unknown);
    }
}
