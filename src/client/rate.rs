//! Rolling queries-per-minute counter
//!
//! Sixty one-second buckets; a bucket is cleared when the clock wraps back
//! onto it, so the sum always covers the last minute.

use std::sync::Mutex;
use std::time::Instant;

const BUCKETS: usize = 60;

#[derive(Debug)]
struct Window {
    buckets: [u64; BUCKETS],
    /// Second (since `start`) the newest bucket belongs to
    head: u64,
}

impl Window {
    fn advance(&mut self, now: u64) {
        if now <= self.head {
            return;
        }
        let elapsed = now - self.head;
        if elapsed >= BUCKETS as u64 {
            self.buckets = [0; BUCKETS];
        } else {
            for second in self.head + 1..=now {
                self.buckets[(second % BUCKETS as u64) as usize] = 0;
            }
        }
        self.head = now;
    }
}

/// Sliding one-minute query counter
#[derive(Debug)]
pub struct QueryRate {
    start: Instant,
    window: Mutex<Window>,
}

impl Default for QueryRate {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRate {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            window: Mutex::new(Window {
                buckets: [0; BUCKETS],
                head: 0,
            }),
        }
    }

    fn second(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.start).as_secs()
    }

    /// Count one query now
    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&self, at: Instant) {
        let second = self.second(at);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.advance(second);
        // Late samples older than the window are dropped
        if second + (BUCKETS as u64) > window.head {
            window.buckets[(second % BUCKETS as u64) as usize] += 1;
        }
    }

    /// Queries counted during the last minute
    pub fn per_minute(&self) -> f64 {
        self.per_minute_at(Instant::now())
    }

    pub fn per_minute_at(&self, at: Instant) -> f64 {
        let second = self.second(at);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.advance(second);
        window.buckets.iter().sum::<u64>() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_rate_is_zero() {
        assert_eq!(QueryRate::new().per_minute(), 0.0);
    }

    #[test]
    fn test_counts_within_window() {
        let rate = QueryRate::new();
        let t0 = rate.start;
        rate.record_at(t0);
        rate.record_at(t0 + Duration::from_secs(10));
        rate.record_at(t0 + Duration::from_secs(59));
        assert_eq!(rate.per_minute_at(t0 + Duration::from_secs(59)), 3.0);
    }

    #[test]
    fn test_old_queries_expire() {
        let rate = QueryRate::new();
        let t0 = rate.start;
        rate.record_at(t0);
        rate.record_at(t0 + Duration::from_secs(30));
        assert_eq!(rate.per_minute_at(t0 + Duration::from_secs(61)), 1.0);
        assert_eq!(rate.per_minute_at(t0 + Duration::from_secs(200)), 0.0);
    }

    #[test]
    fn test_bucket_reuse_after_wrap() {
        let rate = QueryRate::new();
        let t0 = rate.start;
        rate.record_at(t0 + Duration::from_secs(5));
        rate.record_at(t0 + Duration::from_secs(65));
        assert_eq!(rate.per_minute_at(t0 + Duration::from_secs(65)), 1.0);
    }
}
