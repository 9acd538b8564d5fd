//! Recently-seen request set.
//!
//! Every broadcast mutation carries a randomised nonce, so the full wire
//! line identifies one originated mutation. Keying on the whole line means
//! an `ADD` and its matching `DEL` never collide, and neither do re-issues
//! with fresh nonces.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Bounded set of recently seen request lines.
#[derive(Debug)]
pub struct SeenRequests {
    window: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
}

impl SeenRequests {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        SeenRequests {
            window,
            max_entries,
            seen: HashMap::new(),
        }
    }

    /// Returns true if `line` was already seen inside the window. Always
    /// (re)stamps the line as seen now.
    pub fn check_and_insert(&mut self, line: &str, now: Instant) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);

        let seen = match self.seen.get(line) {
            Some(&stamp) => now.saturating_duration_since(stamp) < self.window,
            None => false,
        };

        if self.seen.len() >= self.max_entries && !self.seen.contains_key(line) {
            self.sweep(now);
            if self.seen.len() >= self.max_entries {
                // Still full of live entries: evict the oldest.
                if let Some(oldest) = self
                    .seen
                    .iter()
                    .min_by_key(|(_, &stamp)| stamp)
                    .map(|(line, _)| line.clone())
                {
                    self.seen.remove(&oldest);
                }
            }
        }

        self.seen.insert(line.to_owned(), now);
        seen
    }

    /// Drop entries older than the window; returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen
            .retain(|_, &mut stamp| now.saturating_duration_since(stamp) < window);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_reported_within_the_window() {
        let t0 = Instant::now();
        let mut seen = SeenRequests::new(Duration::from_secs(600), 1024);

        assert!(!seen.check_and_insert("12 1234 a b 192.0.2.1 655 0 10", t0));
        assert!(seen.check_and_insert("12 1234 a b 192.0.2.1 655 0 10", t0 + Duration::from_secs(1)));
        // A fresh nonce is a fresh mutation.
        assert!(!seen.check_and_insert("12 abcd a b 192.0.2.1 655 0 10", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn del_is_not_swallowed_by_its_matching_add() {
        let t0 = Instant::now();
        let mut seen = SeenRequests::new(Duration::from_secs(600), 1024);
        assert!(!seen.check_and_insert("12 77 a b 192.0.2.1 655 0 10", t0));
        assert!(!seen.check_and_insert("13 77 a b", t0));
    }

    #[test]
    fn entries_expire_after_the_window() {
        let t0 = Instant::now();
        let mut seen = SeenRequests::new(Duration::from_secs(10), 1024);
        seen.check_and_insert("14 1 gamma", t0);
        assert!(!seen.check_and_insert("14 1 gamma", t0 + Duration::from_secs(11)));

        seen.check_and_insert("14 2 gamma", t0 + Duration::from_secs(11));
        assert_eq!(seen.sweep(t0 + Duration::from_secs(30)), 2);
        assert!(seen.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let t0 = Instant::now();
        let mut seen = SeenRequests::new(Duration::from_secs(600), 4);
        for i in 0..32 {
            seen.check_and_insert(&format!("14 {i:x} gamma"), t0 + Duration::from_secs(i));
        }
        assert!(seen.len() <= 4);
        // The newest entry is still present.
        assert!(seen.check_and_insert("14 1f gamma", t0 + Duration::from_secs(32)));
    }

    #[test]
    fn newline_is_ignored_for_identity() {
        let t0 = Instant::now();
        let mut seen = SeenRequests::new(Duration::from_secs(600), 16);
        assert!(!seen.check_and_insert("10 9 beta 10.0.0.0/8\n", t0));
        assert!(seen.check_and_insert("10 9 beta 10.0.0.0/8", t0));
    }
}
