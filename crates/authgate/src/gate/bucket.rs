//! Token bucket rate limiting
//!
//! Each key owns a bucket that holds at most `capacity` tokens and gains
//! `refill_rate` tokens at the end of every full `interval`. A request costs one
//! or more tokens; when the bucket cannot pay, the caller gets the instant at
//! which enough tokens will have been refilled.
//!
//! Buckets live in a sharded [`DashMap`], so concurrent requests for the same
//! key serialize on one shard entry while unrelated keys proceed in parallel.
//! Time comes from [`tokio::time::Instant`] so the refill clock can be paused
//! and advanced in tests.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Refill and capacity settings for one class of bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimit {
    /// Tokens added at the end of each interval
    pub refill_rate: u32,
    /// Refill interval
    pub interval: Duration,
    /// Maximum tokens a bucket can hold
    pub capacity: u32,
}

impl BucketLimit {
    /// Create a limit
    pub fn new(refill_rate: u32, interval: Duration, capacity: u32) -> Self {
        Self {
            refill_rate: refill_rate.max(1),
            interval: interval.max(Duration::from_millis(1)),
            capacity: capacity.max(1),
        }
    }

    fn refill_time_for(&self, tokens: u64) -> Duration {
        let intervals = tokens.div_ceil(u64::from(self.refill_rate));
        self.interval
            .saturating_mul(u32::try_from(intervals).unwrap_or(u32::MAX))
    }
}

/// A request the bucket could not pay for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    /// When the bucket will hold enough tokens for the same cost
    pub reset_at: Instant,
    /// Tokens left in the bucket
    pub remaining: u64,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token bucket exhausted ({} remaining)", self.remaining)
    }
}

impl std::error::Error for Exhausted {}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

impl Bucket {
    fn full(limit: &BucketLimit, now: Instant) -> Self {
        Self {
            tokens: u64::from(limit.capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, limit: &BucketLimit, now: Instant) {
        let capacity = u64::from(limit.capacity);
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / limit.interval.as_nanos();
        if intervals == 0 {
            return;
        }

        let added = u64::try_from(intervals)
            .unwrap_or(u64::MAX)
            .saturating_mul(u64::from(limit.refill_rate));
        self.tokens = self.tokens.saturating_add(added).min(capacity);

        if self.tokens == capacity {
            self.last_refill = now;
        } else {
            // Not full means intervals is small enough to fit a u32
            let steps = u32::try_from(intervals).unwrap_or(u32::MAX);
            self.last_refill += limit.interval.saturating_mul(steps);
        }
    }

    fn full_at(&self, limit: &BucketLimit) -> Instant {
        let missing = u64::from(limit.capacity).saturating_sub(self.tokens);
        self.last_refill + limit.refill_time_for(missing)
    }
}

/// Keyed token bucket limiter
#[derive(Debug)]
pub struct TokenBucketLimiter<K: Eq + Hash> {
    buckets: DashMap<K, Bucket>,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

impl<K: Eq + Hash + Clone> TokenBucketLimiter<K> {
    /// Create an empty limiter that sweeps idle buckets at most once per
    /// `cleanup_interval`
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            cleanup_interval,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Take `cost` tokens from the bucket for `key`
    ///
    /// # Errors
    ///
    /// Returns [`Exhausted`] with the refill instant if the bucket cannot pay.
    /// Nothing is deducted in that case.
    pub fn try_acquire(
        &self,
        key: &K,
        limit: &BucketLimit,
        cost: u32,
        now: Instant,
    ) -> Result<u64, Exhausted> {
        let cost = u64::from(cost.max(1));
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(limit, now));
        bucket.refill(limit, now);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Ok(bucket.tokens)
        } else {
            // A cost above capacity can never be paid; report the next refill
            let missing = cost.min(u64::from(limit.capacity)) - bucket.tokens.min(cost);
            let reset_at = bucket.last_refill + limit.refill_time_for(missing.max(1));
            Err(Exhausted {
                reset_at,
                remaining: bucket.tokens,
            })
        }
    }

    /// Tokens currently available for `key`, or `None` if it has no bucket
    pub fn remaining(&self, key: &K, limit: &BucketLimit, now: Instant) -> Option<u64> {
        self.buckets.get_mut(key).map(|mut bucket| {
            bucket.refill(limit, now);
            bucket.tokens
        })
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets are tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop the bucket for `key`
    pub fn reset(&self, key: &K) {
        self.buckets.remove(key);
    }

    /// Sweep if at least `cleanup_interval` has passed since the last sweep
    pub fn sweep_if_due(&self, limit_for: impl Fn(&K) -> BucketLimit, now: Instant) -> usize {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < self.cleanup_interval {
                return 0;
            }
            *last = now;
        }
        self.sweep(limit_for, now)
    }

    /// Remove buckets that would be full by `now`; a fresh bucket is identical
    pub fn sweep(&self, limit_for: impl Fn(&K) -> BucketLimit, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|key, bucket| bucket.full_at(&limit_for(key)) > now);
        before.saturating_sub(self.buckets.len())
    }
}
