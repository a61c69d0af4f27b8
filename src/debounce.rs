use std::time::Duration;

use serde::Serialize;

/// Minimum quiet interval between two delivered edges on one line.
///
/// This is configuration handed to the platform at bind time; the dispatcher
/// never looks at timestamps itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Debounce(Duration);

impl Debounce {
    pub fn new(interval: Duration) -> Self {
        Self(interval)
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn interval(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    pub fn is_disabled(&self) -> bool {
        self.0.is_zero()
    }
}

/// Suppression state for platforms without hardware debounce.
///
/// Timestamps are monotonic offsets from an arbitrary origin.
#[derive(Debug, Clone)]
pub struct DebounceFilter {
    debounce: Debounce,
    last_delivered: Option<Duration>,
}

impl DebounceFilter {
    pub fn new(debounce: Debounce) -> Self {
        Self {
            debounce,
            last_delivered: None,
        }
    }

    /// Returns whether an edge at `at` should be delivered, and records it if so.
    pub fn admit(&mut self, at: Duration) -> bool {
        let allow = self
            .last_delivered
            .map(|last| at.saturating_sub(last) >= self.debounce.interval())
            .unwrap_or(true);
        if allow {
            self.last_delivered = Some(at);
        }
        allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_edge_always_passes() {
        let mut filter = DebounceFilter::new(Debounce::from_millis(1000));
        assert!(filter.admit(Duration::from_millis(5)));
    }

    #[test]
    fn chatter_inside_interval_is_dropped() {
        let mut filter = DebounceFilter::new(Debounce::from_millis(1000));
        assert!(filter.admit(Duration::from_millis(0)));
        assert!(!filter.admit(Duration::from_millis(10)));
        assert!(!filter.admit(Duration::from_millis(999)));
        assert!(filter.admit(Duration::from_millis(1000)));
    }

    #[test]
    fn suppressed_edges_do_not_extend_the_window() {
        let mut filter = DebounceFilter::new(Debounce::from_millis(100));
        assert!(filter.admit(Duration::from_millis(0)));
        assert!(!filter.admit(Duration::from_millis(90)));
        assert!(filter.admit(Duration::from_millis(100)));
    }

    #[test]
    fn zero_interval_passes_everything() {
        let debounce = Debounce::default();
        assert!(debounce.is_disabled());
        let mut filter = DebounceFilter::new(debounce);
        let t = Duration::from_millis(1);
        assert!(filter.admit(t));
        assert!(filter.admit(t));
    }
}
