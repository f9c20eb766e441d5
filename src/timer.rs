//! Timer entries and their external handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Sequence numbers are process-global so a handle can never alias a timer
// it was not minted for.
static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

/// Opaque handle to a scheduled timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    #[inline]
    pub(crate) fn sequence(self) -> u64 {
        self.0
    }
}

/// A scheduled callback, one-shot or repeating.
pub(crate) struct Timer {
    callback: Box<dyn FnMut() + Send>,
    expiration: Instant,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut() + Send>,
        when: Instant,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    #[inline]
    pub(crate) fn expiration(&self) -> Instant {
        self.expiration
    }

    #[inline]
    pub(crate) fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    #[inline]
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub(crate) fn id(&self) -> TimerId {
        TimerId(self.sequence)
    }

    /// Move a repeating timer's expiration to `now + interval`.
    pub(crate) fn restart(&mut self, now: Instant) {
        match self.interval {
            Some(interval) => self.expiration = now + interval,
            None => self.expiration = now,
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("sequence", &self.sequence)
            .field("expiration", &self.expiration)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_strictly_increase() {
        let mk = || Timer::new(Box::new(|| {}), Instant::now(), None);
        let a = mk();
        let b = mk();
        let c = mk();
        assert!(a.sequence() < b.sequence());
        assert!(b.sequence() < c.sequence());
    }

    #[test]
    fn restart_advances_by_interval() {
        let interval = Duration::from_millis(250);
        let start = Instant::now();
        let mut t = Timer::new(Box::new(|| {}), start, Some(interval));
        assert!(t.repeat());
        let now = start + Duration::from_millis(10);
        t.restart(now);
        assert_eq!(t.expiration(), now + interval);
    }

    #[test]
    fn one_shot_does_not_repeat() {
        let t = Timer::new(Box::new(|| {}), Instant::now(), None);
        assert!(!t.repeat());
    }
}
