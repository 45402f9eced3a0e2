use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;

/// Per-address token bucket. Lazily created on first `allow`, evicted on
/// session teardown so churn does not grow the map unboundedly.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, sustained_per_sec: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * sustained_per_sec).min(burst);
        self.last_refill = now;
    }
}

/// Mutations are serialized by a single mutex around the map; the
/// per-bucket refill math is cheap enough that holding the lock for the
/// whole operation is not a contention concern at relay scale.
pub struct RateLimiter {
    sustained_per_sec: f64,
    burst: f64,
    buckets: Mutex<AHashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(sustained_per_sec: f64, burst: f64) -> Self {
        Self {
            sustained_per_sec,
            burst,
            buckets: Mutex::new(AHashMap::new()),
        }
    }

    pub fn allow(&self, address: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(address.to_string())
            .or_insert_with(|| Bucket::new(self.burst));

        bucket.refill(self.sustained_per_sec, self.burst);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remove(&self, address: &str) {
        self.buckets.lock().remove(address);
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
