//! Rate/cost governor.
//!
//! A token-bucket admission gate shared by every component that issues
//! outbound calls, plus cumulative byte accounting for cost reporting.
//! The bucket refills continuously at the configured rate; `acquire`
//! waits for a token or fails with `RateLimited` once the caller's
//! timeout would be exceeded. No retry logic lives here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use warchive_core::config::RateConfig;
use warchive_core::records::RateBudget;
use warchive_core::Error;

/// Approximate egress price used for the cost estimate, USD per GiB.
const COST_PER_GIB_USD: f64 = 0.09;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct Window {
    requests: u64,
    bytes: u64,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Process-wide admission gate and transfer accounting.
///
/// One explicitly-owned instance is passed by handle to every
/// component that issues outbound calls; there is no ambient global.
pub struct Governor {
    rate: f64,
    burst: f64,
    acquire_timeout: Duration,
    window_len: Duration,
    bucket: tokio::sync::Mutex<Bucket>,
    window: std::sync::Mutex<Window>,
    bytes_total: AtomicU64,
}

/// Proof of admission for one outbound call.
#[derive(Debug)]
pub struct Permit {
    pub cost: u32,
}

impl Governor {
    pub fn new(cfg: &RateConfig) -> Self {
        let now = Instant::now();
        Self {
            rate: cfg.requests_per_second,
            burst: cfg.burst as f64,
            acquire_timeout: cfg.acquire_timeout(),
            window_len: cfg.window(),
            bucket: tokio::sync::Mutex::new(Bucket { tokens: cfg.burst as f64, last_refill: now }),
            window: std::sync::Mutex::new(Window {
                requests: 0,
                bytes: 0,
                started: now,
                started_at: Utc::now(),
            }),
            bytes_total: AtomicU64::new(0),
        }
    }

    /// Acquire admission for one call of the given cost, waiting up to
    /// the configured timeout.
    pub async fn acquire(&self, cost: u32) -> Result<Permit, Error> {
        self.acquire_with_timeout(cost, self.acquire_timeout).await
    }

    /// Acquire admission with an explicit deadline.
    ///
    /// Fails with `Error::RateLimited` when the token cannot become
    /// available before the deadline; the caller decides whether to
    /// wait and retry.
    pub async fn acquire_with_timeout(&self, cost: u32, timeout: Duration) -> Result<Permit, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed();
                bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= cost as f64 {
                    bucket.tokens -= cost as f64;
                    self.note_request();
                    return Ok(Permit { cost });
                }
                Duration::from_secs_f64((cost as f64 - bucket.tokens) / self.rate)
            };

            let now = Instant::now();
            if now + wait > deadline {
                return Err(Error::RateLimited {
                    context: format!("cost {cost} not admitted within {timeout:?}"),
                });
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Account transferred bytes. Reporting only, never admission
    /// control.
    pub fn record_bytes(&self, n: u64) {
        self.bytes_total.fetch_add(n, Ordering::Relaxed);
        let mut window = self.window.lock().expect("governor window lock poisoned");
        self.roll_window(&mut window);
        window.bytes += n;
    }

    /// Cumulative bytes transferred since startup.
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    /// Conservative egress cost estimate for the transferred volume.
    pub fn estimated_cost_usd(&self) -> f64 {
        self.bytes_total() as f64 / (1024.0 * 1024.0 * 1024.0) * COST_PER_GIB_USD
    }

    /// Snapshot of the current rolling window.
    pub fn budget(&self) -> RateBudget {
        let mut window = self.window.lock().expect("governor window lock poisoned");
        self.roll_window(&mut window);
        RateBudget {
            requests_in_window: window.requests,
            bytes_in_window: window.bytes,
            window_start: window.started_at,
        }
    }

    fn note_request(&self) {
        let mut window = self.window.lock().expect("governor window lock poisoned");
        self.roll_window(&mut window);
        window.requests += 1;
    }

    fn roll_window(&self, window: &mut Window) {
        if window.started.elapsed() >= self.window_len {
            window.requests = 0;
            window.bytes = 0;
            window.started = Instant::now();
            window.started_at = Utc::now();
        }
    }
}
