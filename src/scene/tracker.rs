use crate::common::ids::PortId;

/// Outcome of one resolution attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerTick {
    Idle,
    Resolved(PortId),
    Pending,
    Exhausted(PortId),
}

/// Holds a selection request for an interface-port item that may not exist
/// yet (the backend can announce the port after the selection request
/// arrives). Bounded: the request is retried at most `retry_budget` times and
/// silently abandoned afterwards or when a new request supersedes it.
#[derive(Debug, Default)]
pub struct IfxPortTracker {
    pending: Option<(PortId, u32)>,
}

impl IfxPortTracker {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn request(&mut self, port: PortId, retry_budget: u32) {
        if let Some((old, _)) = self.pending.replace((port, retry_budget)) {
            log::debug!("port selection request {} superseded by {}", old, port);
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Tries to resolve the pending request; `resolve` returns whether the
    /// port's item exists now.
    pub fn tick(&mut self, resolve: impl FnOnce(PortId) -> bool) -> TrackerTick {
        let Some((port, retries_left)) = self.pending else {
            return TrackerTick::Idle;
        };
        if resolve(port) {
            self.pending = None;
            return TrackerTick::Resolved(port);
        }
        if retries_left == 0 {
            log::debug!("giving up on port selection request {}", port);
            self.pending = None;
            return TrackerTick::Exhausted(port);
        }
        self.pending = Some((port, retries_left - 1));
        TrackerTick::Pending
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolves_once_item_appears() {
        let mut tracker = IfxPortTracker::new();
        let port = PortId::now_v7();
        tracker.request(port, 3);
        assert_eq!(tracker.tick(|_| false), TrackerTick::Pending);
        assert_eq!(tracker.tick(|_| true), TrackerTick::Resolved(port));
        assert_eq!(tracker.tick(|_| true), TrackerTick::Idle);
    }

    #[test]
    fn test_bounded_retries_then_abandoned() {
        let mut tracker = IfxPortTracker::new();
        let port = PortId::now_v7();
        tracker.request(port, 2);
        assert_eq!(tracker.tick(|_| false), TrackerTick::Pending);
        assert_eq!(tracker.tick(|_| false), TrackerTick::Pending);
        assert_eq!(tracker.tick(|_| false), TrackerTick::Exhausted(port));
        assert!(!tracker.is_pending());
    }

    #[test]
    fn test_new_request_supersedes_pending_one() {
        let mut tracker = IfxPortTracker::new();
        let first = PortId::now_v7();
        let second = PortId::now_v7();
        tracker.request(first, 5);
        tracker.request(second, 5);
        assert_eq!(tracker.tick(|_| true), TrackerTick::Resolved(second));
    }
}
