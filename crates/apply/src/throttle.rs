//! Client-side rate limiting: one token bucket per destination endpoint.

use std::sync::Mutex;
use std::time::Duration;

use metrics::histogram;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct Throttle {
    qps: f64,
    burst: f64,
    buckets: Mutex<FxHashMap<String, Bucket>>,
}

impl Throttle {
    /// `qps <= 0` (or not finite) disables throttling.
    pub fn new(qps: f64, burst: u32) -> Self {
        let qps = if qps.is_finite() { qps } else { 0.0 };
        Self { qps, burst: f64::from(burst.max(1)), buckets: Mutex::new(FxHashMap::default()) }
    }

    /// `KEEL_QPS` (default 20) and `KEEL_BURST` (default 40).
    pub fn from_env() -> Self {
        let qps = std::env::var("KEEL_QPS").ok().and_then(|s| s.parse::<f64>().ok()).filter(|q| q.is_finite() && *q >= 0.0).unwrap_or(20.0);
        let burst = std::env::var("KEEL_BURST").ok().and_then(|s| s.parse::<u32>().ok()).unwrap_or(40);
        Self::new(qps, burst)
    }

    pub fn unlimited() -> Self { Self::new(0.0, 1) }

    /// Reserve one request against `endpoint`, sleeping until the reservation is due.
    pub async fn acquire(&self, endpoint: &str) {
        if self.qps <= 0.0 { return; }
        let wait = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let b = buckets.entry(endpoint.to_string()).or_insert(Bucket { tokens: self.burst, last: now });
            b.tokens = (b.tokens + now.duration_since(b.last).as_secs_f64() * self.qps).min(self.burst);
            b.last = now;
            // tokens may go negative: later callers queue behind earlier reservations
            b.tokens -= 1.0;
            if b.tokens >= 0.0 { None } else { Some(Duration::from_secs_f64(-b.tokens / self.qps)) }
        };
        if let Some(w) = wait {
            tokio::time::sleep(w).await;
            histogram!("throttle_wait_ms", w.as_secs_f64() * 1000.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_rate() {
        let t = Throttle::new(10.0, 2);
        let t0 = Instant::now();
        t.acquire("a").await;
        t.acquire("a").await;
        assert!(t0.elapsed() < Duration::from_millis(1));
        t.acquire("a").await;
        assert!(t0.elapsed() >= Duration::from_millis(100));
        // separate endpoint, separate bucket
        let t1 = Instant::now();
        t.acquire("b").await;
        assert!(t1.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_rate_disables_throttling() {
        for qps in [f64::NAN, f64::INFINITY] {
            let t = Throttle::new(qps, 1);
            let t0 = Instant::now();
            for _ in 0..10 { t.acquire("a").await; }
            assert_eq!(t0.elapsed(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let t = Throttle::unlimited();
        let t0 = Instant::now();
        for _ in 0..1000 { t.acquire("a").await; }
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }
}
