use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LlmSettings;

/// Per-minute spending limits applied to every credential in a ring.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
}

impl From<&LlmSettings> for RateBudget {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            requests_per_minute: settings.requests_per_minute,
            tokens_per_minute: settings.tokens_per_minute,
        }
    }
}

/// Rolling usage window for one credential. The window resets lazily: the
/// next acquisition after more than `window` has elapsed zeroes the counters.
#[derive(Debug)]
struct RateTracker {
    requests_made: u32,
    tokens_used: u64,
    last_reset: Instant,
    /// Set when the upstream returned 429; the key is unusable until then.
    exhausted_until: Option<Instant>,
    total_requests: u64,
    total_tokens: u64,
}

impl RateTracker {
    fn new() -> Self {
        Self {
            requests_made: 0,
            tokens_used: 0,
            last_reset: Instant::now(),
            exhausted_until: None,
            total_requests: 0,
            total_tokens: 0,
        }
    }
}

struct KeySlot {
    secret: String,
    tracker: Mutex<RateTracker>,
}

/// A credential leased out of the ring for one request. Carries the index so
/// usage and exhaustion can be reported back to the right slot.
#[derive(Debug, Clone)]
pub struct LeasedKey {
    pub index: usize,
    pub secret: String,
}

/// Aggregate counters across every slot, taken as a point-in-time snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KeyRingStats {
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub total_requests: u64,
    pub total_tokens: u64,
}

/// Round-robin ring of API credentials sharing one rate budget.
///
/// Acquisition scans from just past the last-used slot so load spreads evenly
/// instead of hammering the first key until it runs dry. A full scan with no
/// usable slot returns `None`; the caller decides whether that is fatal.
pub struct KeyRing {
    slots: Vec<KeySlot>,
    cursor: AtomicUsize,
    budget: RateBudget,
    window: Duration,
}

impl KeyRing {
    pub fn new(keys: Vec<String>, budget: RateBudget) -> Self {
        Self::with_window(keys, budget, Duration::from_secs(60))
    }

    /// Custom reset window, for tests that cannot wait out a real minute.
    pub fn with_window(keys: Vec<String>, budget: RateBudget, window: Duration) -> Self {
        let slots = keys
            .into_iter()
            .filter(|key| !key.trim().is_empty())
            .map(|secret| KeySlot {
                secret,
                tracker: Mutex::new(RateTracker::new()),
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
            budget,
            window,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lease the next credential with headroom under the budget.
    ///
    /// Elapsed exhaustion windows are cleared first, then slots are scanned
    /// round-robin. Lapsed usage windows reset as they are visited. `None`
    /// means every slot is exhausted or over budget right now.
    pub async fn next_available_key(&self) -> Option<LeasedKey> {
        if self.slots.is_empty() {
            return None;
        }
        let now = Instant::now();

        for slot in &self.slots {
            let mut tracker = slot.tracker.lock().await;
            if let Some(until) = tracker.exhausted_until {
                if now >= until {
                    tracker.exhausted_until = None;
                    info!(key = %redact(&slot.secret), "credential usable again after cooldown");
                }
            }
        }

        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..self.slots.len() {
            let index = (start + offset) % self.slots.len();
            let mut tracker = self.slots[index].tracker.lock().await;
            if tracker.exhausted_until.is_some() {
                continue;
            }
            if now.duration_since(tracker.last_reset) > self.window {
                tracker.requests_made = 0;
                tracker.tokens_used = 0;
                tracker.last_reset = now;
            }
            if tracker.requests_made < self.budget.requests_per_minute
                && tracker.tokens_used < self.budget.tokens_per_minute
            {
                self.cursor.store((index + 1) % self.slots.len(), Ordering::Relaxed);
                debug!(key = %redact(&self.slots[index].secret), "leased credential");
                return Some(LeasedKey {
                    index,
                    secret: self.slots[index].secret.clone(),
                });
            }
        }

        warn!("all credentials exhausted or over budget");
        None
    }

    /// Record a completed request against the slot that served it.
    pub async fn record_usage(&self, index: usize, tokens: u64) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let mut tracker = slot.tracker.lock().await;
        tracker.requests_made += 1;
        tracker.tokens_used += tokens;
        tracker.total_requests += 1;
        tracker.total_tokens += tokens;
    }

    /// Take a slot out of rotation, typically after an upstream 429.
    pub async fn mark_exhausted(&self, index: usize, retry_after: Duration) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let mut tracker = slot.tracker.lock().await;
        tracker.exhausted_until = Some(Instant::now() + retry_after);
        warn!(
            key = %redact(&slot.secret),
            retry_after_secs = retry_after.as_secs(),
            "credential marked exhausted"
        );
    }

    pub async fn stats(&self) -> KeyRingStats {
        let now = Instant::now();
        let mut stats = KeyRingStats {
            total_keys: self.slots.len(),
            ..KeyRingStats::default()
        };
        for slot in &self.slots {
            let tracker = slot.tracker.lock().await;
            let exhausted = tracker.exhausted_until.is_some_and(|until| now < until);
            if exhausted {
                stats.exhausted_keys += 1;
            } else {
                stats.available_keys += 1;
            }
            stats.total_requests += tracker.total_requests;
            stats.total_tokens += tracker.total_tokens;
        }
        stats
    }
}

/// First characters of a credential, enough to tell keys apart in logs
/// without exposing the secret.
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(10).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(rpm: u32, tpm: u64) -> RateBudget {
        RateBudget {
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("gsk_test_key_{i}")).collect()
    }

    #[tokio::test]
    async fn rotates_round_robin_until_everything_is_spent() {
        let rpm = 3;
        let ring = KeyRing::new(keys(4), budget(rpm, 1_000_000));
        let mut counts = vec![0u32; 4];

        for turn in 0..(rpm as usize * 4) {
            let lease = ring.next_available_key().await.unwrap();
            assert_eq!(lease.index, turn % 4, "keys must be visited in rotation");
            ring.record_usage(lease.index, 10).await;
            counts[lease.index] += 1;
        }

        assert!(counts.iter().all(|&c| c == rpm));
        assert!(ring.next_available_key().await.is_none());
    }

    #[tokio::test]
    async fn token_budget_disqualifies_a_key() {
        let ring = KeyRing::new(keys(2), budget(100, 50));
        let first = ring.next_available_key().await.unwrap();
        ring.record_usage(first.index, 50).await;

        // Slot 0 is over its token budget, so both remaining leases land on 1.
        let lease = ring.next_available_key().await.unwrap();
        assert_eq!(lease.index, 1);
        ring.record_usage(lease.index, 10).await;
        let lease = ring.next_available_key().await.unwrap();
        assert_eq!(lease.index, 1);
    }

    #[tokio::test]
    async fn exhausted_key_returns_after_cooldown() {
        let ring = KeyRing::new(keys(1), budget(100, 1_000_000));
        let lease = ring.next_available_key().await.unwrap();
        ring.mark_exhausted(lease.index, Duration::from_millis(30)).await;

        assert!(ring.next_available_key().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let lease = ring.next_available_key().await.unwrap();
        assert_eq!(lease.index, 0);
    }

    #[tokio::test]
    async fn usage_window_resets_after_lapse() {
        let ring = KeyRing::with_window(keys(1), budget(1, 1_000_000), Duration::from_millis(20));
        let lease = ring.next_available_key().await.unwrap();
        ring.record_usage(lease.index, 5).await;
        assert!(ring.next_available_key().await.is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ring.next_available_key().await.is_some());
    }

    #[tokio::test]
    async fn stats_reflect_exhaustion_and_totals() {
        let ring = KeyRing::new(keys(3), budget(10, 1_000_000));
        ring.record_usage(0, 100).await;
        ring.record_usage(1, 200).await;
        ring.mark_exhausted(2, Duration::from_secs(60)).await;

        let stats = ring.stats().await;
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.available_keys, 2);
        assert_eq!(stats.exhausted_keys, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_tokens, 300);
    }

    #[tokio::test]
    async fn blank_keys_are_dropped_at_construction() {
        let ring = KeyRing::new(vec!["  ".into(), "gsk_real".into(), String::new()], budget(10, 100));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn redaction_keeps_a_short_prefix() {
        assert_eq!(redact("gsk_1234567890abcdef"), "gsk_123456...");
        assert_eq!(redact("ab"), "ab...");
    }
}
