//! Sharded sliding-window rate limiter.
//!
//! Keys are spread over 256 shards by FNV-1a hash so concurrent requests for
//! different keys rarely contend on the same mutex. Each key tracks a current
//! and previous window count; admission uses the weighted estimate
//! `prev * (1 - elapsed/window) + curr`, which smooths bursts at window
//! boundaries without keeping a full sliding log.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

const NUM_SHARDS: usize = 256;

/// Per-key window state. `prev_count` holds the count of the window that
/// ended at `curr_start`.
struct Window {
    curr_count: u64,
    prev_count: u64,
    curr_start: Instant,
}

struct Shard {
    windows: Mutex<HashMap<String, Window>>,
}

/// Sharded weighted sliding-window limiter. `allow` is the only operation the
/// data plane calls; the shard mutex is held only across a few arithmetic
/// steps and never across I/O.
pub struct SlidingWindowLimiter {
    shards: Vec<Shard>,
    rate: u64,
    window: Duration,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting up to `rate` requests per `window` per key.
    pub fn new(rate: u64, window: Duration) -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| Shard {
                windows: Mutex::new(HashMap::new()),
            })
            .collect();
        Self {
            shards,
            rate,
            window,
        }
    }

    /// Report whether a request for `key` is permitted right now.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Admission check against an explicit clock. Split out so tests can
    /// drive window boundaries deterministically.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let shard = &self.shards[(fnv1a(key) as usize) % NUM_SHARDS];
        let mut windows = shard.windows.lock().expect("rate limit shard poisoned");

        let w = match windows.get_mut(key) {
            Some(w) => w,
            None => {
                windows.insert(
                    key.to_string(),
                    Window {
                        curr_count: 1,
                        prev_count: 0,
                        curr_start: now,
                    },
                );
                return true;
            }
        };

        let mut elapsed = now.saturating_duration_since(w.curr_start);
        if elapsed >= self.window {
            if elapsed >= 2 * self.window {
                // More than two windows elapsed; previous data is stale.
                w.prev_count = 0;
            } else {
                w.prev_count = w.curr_count;
            }
            w.curr_count = 0;
            w.curr_start = now;
            elapsed = Duration::ZERO;
        }

        let weight = 1.0 - elapsed.as_secs_f64() / self.window.as_secs_f64();
        let estimate = w.prev_count as f64 * weight + w.curr_count as f64;

        if estimate >= self.rate as f64 {
            return false;
        }

        w.curr_count += 1;
        true
    }

    /// Number of keys currently tracked, summed across shards. Diagnostic
    /// only; takes every shard lock in turn.
    pub fn tracked_keys(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.windows.lock().expect("rate limit shard poisoned").len())
            .sum()
    }
}

/// 32-bit FNV-1a. The low 8 bits pick the shard; 256 is a power of two so the
/// modulo is a mask.
fn fnv1a(s: &str) -> u32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;
    let mut h = OFFSET;
    for b in s.as_bytes() {
        h ^= u32::from(*b);
        h = h.wrapping_mul(PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_creates_window_and_admits() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("10.0.0.1"));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn admits_exactly_rate_in_fresh_window() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_at("k", now));
        assert!(limiter.allow_at("k", now));
        assert!(limiter.allow_at("k", now));
        // The (rate+1)-th call in the same window is rejected.
        assert!(!limiter.allow_at("k", now));
        assert!(!limiter.allow_at("k", now));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn previous_window_weighs_into_estimate() {
        let window = Duration::from_secs(10);
        let limiter = SlidingWindowLimiter::new(4, window);
        let start = Instant::now();

        for _ in 0..4 {
            assert!(limiter.allow_at("k", start));
        }
        assert!(!limiter.allow_at("k", start));

        // The call that rolls the window sees weight 1.0 (elapsed resets to
        // zero), so the full previous count still blocks it.
        let rolled = start + window;
        assert!(!limiter.allow_at("k", rolled));

        // 2.5s later: weight = 0.75, estimate = 4 * 0.75 = 3, so one more
        // request fits before the estimate reaches the rate.
        let t = rolled + Duration::from_millis(2500);
        assert!(limiter.allow_at("k", t));
        assert!(!limiter.allow_at("k", t));
    }

    #[test]
    fn stale_window_is_discarded() {
        let window = Duration::from_secs(10);
        let limiter = SlidingWindowLimiter::new(2, window);
        let start = Instant::now();

        assert!(limiter.allow_at("k", start));
        assert!(limiter.allow_at("k", start));
        assert!(!limiter.allow_at("k", start));

        // More than two windows later the old counts carry no weight.
        let t = start + 3 * window;
        assert!(limiter.allow_at("k", t));
        assert!(limiter.allow_at("k", t));
        assert!(!limiter.allow_at("k", t));
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Reference values for the 32-bit FNV-1a parameters.
        assert_eq!(fnv1a(""), 2_166_136_261);
        assert_eq!(fnv1a("a"), 0xe40c292c);
        assert_eq!(fnv1a("foobar"), 0xbf9cf968);
    }
}
