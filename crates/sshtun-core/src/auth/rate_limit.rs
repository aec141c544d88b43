//! Per-peer throttle for failed client logins.
//!
//! Only failures are recorded, so a peer holding a live token can log in as
//! often as it likes. A peer with `max_failures` failures inside the window is
//! turned away until the oldest of them ages out.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_failures: usize,
    window: Duration,
    failures: HashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimiter {
    /// * `max_failures` - failed logins tolerated per peer within the window.
    /// * `window_secs` - window length in seconds.
    pub fn new(max_failures: u32, window_secs: u64) -> Self {
        Self {
            max_failures: max_failures as usize,
            window: Duration::from_secs(window_secs),
            failures: HashMap::new(),
        }
    }

    /// Whether `peer` has used up its failure budget.
    pub fn is_blocked(&mut self, peer: IpAddr) -> bool {
        self.is_blocked_at(peer, Instant::now())
    }

    pub fn record_failure(&mut self, peer: IpAddr) {
        self.record_failure_at(peer, Instant::now());
    }

    /// Forget peers whose failures have all aged out.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.failures.retain(|_, recent| {
            expire(recent, now, window);
            !recent.is_empty()
        });
    }

    fn is_blocked_at(&mut self, peer: IpAddr, now: Instant) -> bool {
        let window = self.window;
        match self.failures.get_mut(&peer) {
            Some(recent) => {
                expire(recent, now, window);
                recent.len() >= self.max_failures
            }
            None => false,
        }
    }

    fn record_failure_at(&mut self, peer: IpAddr, now: Instant) {
        let recent = self.failures.entry(peer).or_default();
        expire(recent, now, self.window);
        recent.push_back(now);
    }
}

/// Failures are pushed in time order, so expired ones sit at the front.
fn expire(recent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while recent
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= window)
    {
        recent.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn blocks_after_max_failures() {
        let mut limiter = RateLimiter::new(3, 60);
        let peer = ip("192.0.2.1");
        for _ in 0..3 {
            assert!(!limiter.is_blocked(peer));
            limiter.record_failure(peer);
        }
        assert!(limiter.is_blocked(peer));
    }

    #[test]
    fn peers_are_independent() {
        let mut limiter = RateLimiter::new(1, 60);
        limiter.record_failure(ip("192.0.2.1"));
        assert!(limiter.is_blocked(ip("192.0.2.1")));
        assert!(!limiter.is_blocked(ip("2001:db8::1")));
    }

    #[test]
    fn failures_age_out_of_the_window() {
        let mut limiter = RateLimiter::new(2, 60);
        let peer = ip("192.0.2.7");
        let start = Instant::now();

        limiter.record_failure_at(peer, start);
        limiter.record_failure_at(peer, start + Duration::from_secs(30));
        assert!(limiter.is_blocked_at(peer, start + Duration::from_secs(59)));
        assert!(!limiter.is_blocked_at(peer, start + Duration::from_secs(60)));
    }

    #[test]
    fn gc_drops_idle_peers() {
        let mut limiter = RateLimiter::new(1, 0);
        limiter.record_failure(ip("192.0.2.9"));
        limiter.gc();
        assert!(limiter.failures.is_empty());
    }
}
