//! Timer queue for the daemon event loop.
//!
//! Timers are ordered by `(deadline, id)` where ids increase monotonically,
//! so entries with equal deadlines fire in insertion order. Periodic timers
//! re-arm drift-free: the new deadline is the old deadline plus the
//! interval, never "now plus interval".

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Opaque handle to a scheduled timer.
pub type TimerId = u64;

#[derive(Debug)]
struct TimerEntry<T> {
    interval: Option<Duration>,
    payload: T,
}

/// A timer that has fired and been removed from the queue. Pass it back to
/// [`Timers::requeue`] to re-arm it at `deadline + interval`.
#[derive(Debug)]
pub struct Expired<T> {
    pub id: TimerId,
    deadline: Instant,
    interval: Option<Duration>,
    pub payload: T,
}

/// Monotonic priority queue of timers.
#[derive(Debug)]
pub struct Timers<T> {
    queue: BTreeMap<(Instant, TimerId), TimerEntry<T>>,
    deadlines: HashMap<TimerId, Instant>,
    next_id: TimerId,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T> Timers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer. `interval` makes it periodic when requeued.
    pub fn schedule(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        payload: T,
    ) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.queue
            .insert((deadline, id), TimerEntry { interval, payload });
        self.deadlines.insert(id, deadline);
        id
    }

    /// Remove a timer; returns its payload if it was still queued.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.queue.remove(&(deadline, id)).map(|e| e.payload)
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Earliest deadline in the queue, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Delay until the earliest deadline: `None` means block indefinitely,
    /// `Some(ZERO)` means a timer is already due.
    pub fn timeout_next(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|d| d.saturating_duration_since(now))
    }

    /// Pop the earliest timer whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<Expired<T>> {
        let &(deadline, id) = self.queue.keys().next()?;
        if deadline > now {
            return None;
        }
        let entry = self.queue.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some(Expired {
            id,
            deadline,
            interval: entry.interval,
            payload: entry.payload,
        })
    }

    /// Re-arm a fired periodic timer at its old deadline plus its interval,
    /// keeping its id. One-shot timers are dropped and `None` is returned.
    pub fn requeue(&mut self, expired: Expired<T>) -> Option<TimerId> {
        let interval = expired.interval?;
        let deadline = expired.deadline + interval;
        self.queue.insert(
            (deadline, expired.id),
            TimerEntry {
                interval: Some(interval),
                payload: expired.payload,
            },
        );
        self.deadlines.insert(expired.id, deadline);
        Some(expired.id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        let late = timers.schedule(t0 + Duration::from_secs(2), None, "late");
        let a = timers.schedule(t0 + Duration::from_secs(1), None, "a");
        let b = timers.schedule(t0 + Duration::from_secs(1), None, "b");
        assert!(late > 0 && a > 0 && b > a);

        let now = t0 + Duration::from_secs(3);
        assert_eq!(timers.pop_due(now).unwrap().payload, "a");
        assert_eq!(timers.pop_due(now).unwrap().payload, "b");
        assert_eq!(timers.pop_due(now).unwrap().payload, "late");
        assert!(timers.pop_due(now).is_none());
    }

    #[test]
    fn timeout_next_reports_delay_or_block() {
        let t0 = Instant::now();
        let mut timers: Timers<()> = Timers::new();
        assert_eq!(timers.timeout_next(t0), None);

        timers.schedule(t0 + Duration::from_secs(5), None, ());
        assert_eq!(timers.timeout_next(t0), Some(Duration::from_secs(5)));
        // A due timer reports zero, not a negative delay.
        assert_eq!(
            timers.timeout_next(t0 + Duration::from_secs(9)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn periodic_requeue_is_drift_free() {
        let t0 = Instant::now();
        let interval = Duration::from_secs(10);
        let mut timers = Timers::new();
        timers.schedule(t0 + interval, Some(interval), "tick");

        // Fire late: the handler runs 4s behind the deadline.
        let fired = timers.pop_due(t0 + Duration::from_secs(14)).unwrap();
        timers.requeue(fired).unwrap();

        // The next deadline is anchored to the old one, not to "now".
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn one_shot_requeue_drops() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(t0, None, "once");
        let fired = timers.pop_due(t0 + Duration::from_secs(1)).unwrap();
        assert!(timers.requeue(fired).is_none());
        assert!(timers.is_empty());
    }

    #[test]
    fn cancel_removes_by_id() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        let keep = timers.schedule(t0 + Duration::from_secs(1), None, 1);
        let drop_me = timers.schedule(t0 + Duration::from_secs(1), None, 2);
        assert_eq!(timers.cancel(drop_me), Some(2));
        assert_eq!(timers.cancel(drop_me), None);
        assert!(timers.is_scheduled(keep));
        assert_eq!(timers.pop_due(t0 + Duration::from_secs(2)).unwrap().payload, 1);
    }
}
