//! Market data acquisition for the bubble layout engine.
//!
//! A [`SnapshotProvider`] produces [`AssetSnapshot`] batches on demand;
//! [`CachingProvider`] wraps one and falls back to the last good batch when a
//! fetch degrades, so the visualization keeps running on stale data instead
//! of blanking. [`RateLimiter`] spaces provider calls under an upstream quota,
//! [`RankTracker`] turns raw ranks into session-relative deltas, and
//! [`SnapshotMailbox`] carries the freshest batch to the simulation thread
//! with last-write-wins semantics.

use bubbles_core::{AssetSnapshot, RankSource};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by snapshot providers.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream source could not be reached or answered abnormally.
    #[error("feed unavailable: {0}")]
    Unavailable(String),
    /// The caller exceeded the upstream request quota.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// The response arrived but could not be decoded.
    #[error("malformed feed payload: {0}")]
    Decode(String),
}

/// One delivered batch plus its freshness flag.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPayload {
    pub assets: Vec<AssetSnapshot>,
    /// True when the batch was served from cache after a degraded fetch.
    pub stale: bool,
}

impl SnapshotPayload {
    #[must_use]
    pub fn live(assets: Vec<AssetSnapshot>) -> Self {
        Self {
            assets,
            stale: false,
        }
    }

    #[must_use]
    pub fn stale(assets: Vec<AssetSnapshot>) -> Self {
        Self {
            assets,
            stale: true,
        }
    }
}

/// Source of market snapshots. Implementations may block.
pub trait SnapshotProvider: Send {
    /// Fetch the current market snapshot, most significant assets first.
    fn fetch(&mut self) -> Result<Vec<AssetSnapshot>, FetchError>;
}

/// Sliding-window request limiter for upstream API quotas.
///
/// Time is passed in explicitly so behaviour is testable without sleeping;
/// the `*_now` variants are the production entry points.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl Default for RateLimiter {
    /// The public CoinGecko tier allows roughly 8 calls per rolling minute.
    fn default() -> Self {
        Self::new(8, Duration::from_secs(60))
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.stamps.front() {
            if now.duration_since(front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a request at `now` if the window has room.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.stamps.len() < self.max_requests {
            self.stamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the next request would be admitted, zero if admissible now.
    pub fn wait_time_at(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.stamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        match self.stamps.front() {
            Some(&front) => (front + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn wait_time(&mut self) -> Duration {
        self.wait_time_at(Instant::now())
    }
}

/// Wraps a provider with last-good-batch fallback.
///
/// A failed or empty fetch is downgraded to the cached batch marked stale,
/// so downstream consumers keep animating the previous market state. The
/// error only propagates when there is nothing cached to fall back to.
pub struct CachingProvider<P: SnapshotProvider> {
    inner: P,
    cache: Option<Vec<AssetSnapshot>>,
}

impl<P: SnapshotProvider> CachingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner, cache: None }
    }

    /// Whether a previous good batch is available for fallback.
    #[must_use]
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Fetch a payload, falling back to cache on degradation.
    pub fn fetch_payload(&mut self) -> Result<SnapshotPayload, FetchError> {
        match self.inner.fetch() {
            Ok(assets) if !assets.is_empty() => {
                self.cache = Some(assets.clone());
                Ok(SnapshotPayload::live(assets))
            }
            Ok(_) => match &self.cache {
                Some(cached) => {
                    warn!("feed returned no assets; serving cached snapshot");
                    Ok(SnapshotPayload::stale(cached.clone()))
                }
                None => Ok(SnapshotPayload::live(Vec::new())),
            },
            Err(err) => match &self.cache {
                Some(cached) => {
                    warn!(%err, "feed fetch failed; serving cached snapshot");
                    Ok(SnapshotPayload::stale(cached.clone()))
                }
                None => Err(err),
            },
        }
    }
}

/// Errors from persisting or restoring a rank tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("rank store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("rank store decode: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct RankBaseline {
    initial: u32,
    current: u32,
}

/// Tracks per-asset rank movement against a session baseline.
///
/// The first observation of an asset fixes its baseline; the delta reported
/// thereafter is baseline minus current, so a positive delta means the asset
/// climbed the table. [`RankTracker::reset_baseline`] starts a fresh session,
/// which callers typically do on a day boundary.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RankTracker {
    baselines: HashMap<String, RankBaseline>,
}

impl RankTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a snapshot into the tracker.
    pub fn observe(&mut self, assets: &[AssetSnapshot]) {
        for asset in assets {
            self.baselines
                .entry(asset.id.clone())
                .and_modify(|b| b.current = asset.rank)
                .or_insert(RankBaseline {
                    initial: asset.rank,
                    current: asset.rank,
                });
        }
    }

    /// Re-anchor every baseline at the current rank.
    pub fn reset_baseline(&mut self) {
        for baseline in self.baselines.values_mut() {
            baseline.initial = baseline.current;
        }
        debug!(assets = self.baselines.len(), "rank baselines reset");
    }

    /// Drop assets absent from `retained` so departed listings do not pin
    /// memory across long sessions.
    pub fn retain_assets(&mut self, retained: &[AssetSnapshot]) {
        let keep: std::collections::HashSet<&str> =
            retained.iter().map(|a| a.id.as_str()).collect();
        self.baselines.retain(|id, _| keep.contains(id.as_str()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Persist baselines as JSON.
    pub fn save_to(&self, path: &Path) -> Result<(), TrackerError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Restore baselines previously written by [`RankTracker::save_to`].
    pub fn load_from(path: &Path) -> Result<Self, TrackerError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl RankSource for RankTracker {
    fn rank_delta(&self, asset: &str) -> i32 {
        match self.baselines.get(asset) {
            Some(b) => b.initial as i32 - b.current as i32,
            None => 0,
        }
    }
}

/// Shareable rank tracker for use across the fetch and simulation threads.
#[derive(Debug, Default, Clone)]
pub struct SharedRankTracker {
    inner: Arc<Mutex<RankTracker>>,
}

impl SharedRankTracker {
    #[must_use]
    pub fn new(tracker: RankTracker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tracker)),
        }
    }

    pub fn observe(&self, assets: &[AssetSnapshot]) {
        if let Ok(mut tracker) = self.inner.lock() {
            tracker.observe(assets);
        }
    }

    pub fn reset_baseline(&self) {
        if let Ok(mut tracker) = self.inner.lock() {
            tracker.reset_baseline();
        }
    }

    /// Copy of the underlying tracker, e.g. for persistence.
    #[must_use]
    pub fn snapshot(&self) -> RankTracker {
        self.inner
            .lock()
            .map(|tracker| tracker.clone())
            .unwrap_or_default()
    }
}

impl RankSource for SharedRankTracker {
    fn rank_delta(&self, asset: &str) -> i32 {
        self.inner
            .lock()
            .map(|tracker| tracker.rank_delta(asset))
            .unwrap_or(0)
    }
}

/// Single-slot channel between the fetch thread and the simulation loop.
///
/// Publishing overwrites any undelivered payload, so the consumer always
/// reconciles against the freshest snapshot and never works through a
/// backlog of outdated ones.
#[derive(Debug, Default, Clone)]
pub struct SnapshotMailbox {
    slot: Arc<Mutex<Option<SnapshotPayload>>>,
}

impl SnapshotMailbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit `payload`, replacing any undelivered one.
    pub fn publish(&self, payload: SnapshotPayload) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.is_some() {
                debug!("overwriting undelivered snapshot");
            }
            *slot = Some(payload);
        }
    }

    /// Take the pending payload, leaving the slot empty.
    pub fn take(&self) -> Option<SnapshotPayload> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Deterministic in-process market feed for demos and tests.
///
/// Market caps follow a seeded multiplicative random walk; ranks are
/// recomputed from cap order on every fetch.
pub struct SyntheticProvider {
    rng: rand::rngs::SmallRng,
    caps: Vec<(String, f64)>,
}

impl SyntheticProvider {
    /// Build a universe of `n` synthetic assets with power-law-ish caps.
    #[must_use]
    pub fn new(n: usize, seed: u64) -> Self {
        use rand::SeedableRng;
        let caps = (0..n)
            .map(|i| (format!("syn-{i:04}"), 1.0e12 / (i + 1) as f64))
            .collect();
        Self {
            rng: rand::rngs::SmallRng::seed_from_u64(seed),
            caps,
        }
    }
}

impl SnapshotProvider for SyntheticProvider {
    fn fetch(&mut self) -> Result<Vec<AssetSnapshot>, FetchError> {
        use rand::Rng;
        let mut ordered: Vec<(usize, f64, f64)> = Vec::with_capacity(self.caps.len());
        for (i, (_, cap)) in self.caps.iter_mut().enumerate() {
            let drift: f64 = self.rng.random_range(-0.06..0.06);
            *cap *= 1.0 + drift;
            ordered.push((i, *cap, drift * 100.0));
        }
        ordered.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ordered
            .into_iter()
            .enumerate()
            .map(|(rank, (i, cap, pct))| {
                AssetSnapshot::new(self.caps[i].0.clone(), cap, pct, rank as u32 + 1)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(id: &str, cap: f64, rank: u32) -> AssetSnapshot {
        AssetSnapshot::new(id, cap, 0.0, rank)
    }

    struct ScriptedProvider {
        script: Vec<Result<Vec<AssetSnapshot>, FetchError>>,
    }

    impl SnapshotProvider for ScriptedProvider {
        fn fetch(&mut self) -> Result<Vec<AssetSnapshot>, FetchError> {
            if self.script.is_empty() {
                Err(FetchError::Unavailable("script exhausted".into()))
            } else {
                self.script.remove(0)
            }
        }
    }

    #[test]
    fn rate_limiter_enforces_sliding_window() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(10)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(20)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(30)));
        // Oldest stamp expires at t0 + 60s.
        assert_eq!(
            limiter.wait_time_at(t0 + Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn rate_limiter_defaults_match_public_quota() {
        let mut limiter = RateLimiter::default();
        let t0 = Instant::now();
        for i in 0..8 {
            assert!(limiter.try_acquire_at(t0 + Duration::from_secs(i)));
        }
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(9)));
    }

    #[test]
    fn caching_provider_serves_stale_on_failure() {
        let provider = ScriptedProvider {
            script: vec![
                Ok(vec![asset("btc", 1e12, 1)]),
                Err(FetchError::Unavailable("timeout".into())),
                Ok(Vec::new()),
            ],
        };
        let mut caching = CachingProvider::new(provider);

        let live = caching.fetch_payload().expect("live fetch");
        assert!(!live.stale);
        assert_eq!(live.assets.len(), 1);

        let after_error = caching.fetch_payload().expect("cached fetch");
        assert!(after_error.stale);
        assert_eq!(after_error.assets, live.assets);

        let after_empty = caching.fetch_payload().expect("cached fetch");
        assert!(after_empty.stale);
        assert_eq!(after_empty.assets, live.assets);
    }

    #[test]
    fn caching_provider_propagates_error_without_cache() {
        let provider = ScriptedProvider {
            script: vec![Err(FetchError::Unavailable("cold start".into()))],
        };
        let mut caching = CachingProvider::new(provider);
        assert!(caching.fetch_payload().is_err());
        assert!(!caching.has_cache());
    }

    #[test]
    fn rank_tracker_reports_session_deltas() {
        let mut tracker = RankTracker::new();
        tracker.observe(&[asset("btc", 1e12, 5), asset("eth", 1e11, 2)]);
        assert_eq!(tracker.rank_delta("btc"), 0);

        // btc climbs from 5 to 2, eth slips from 2 to 4.
        tracker.observe(&[asset("btc", 1e12, 2), asset("eth", 1e11, 4)]);
        assert_eq!(tracker.rank_delta("btc"), 3);
        assert_eq!(tracker.rank_delta("eth"), -2);
        assert_eq!(tracker.rank_delta("unknown"), 0);

        tracker.reset_baseline();
        assert_eq!(tracker.rank_delta("btc"), 0);
        assert_eq!(tracker.rank_delta("eth"), 0);
    }

    #[test]
    fn rank_tracker_roundtrips_through_json() {
        let mut tracker = RankTracker::new();
        tracker.observe(&[asset("btc", 1e12, 3)]);
        tracker.observe(&[asset("btc", 1e12, 1)]);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ranks.json");
        tracker.save_to(&path).expect("save");
        let restored = RankTracker::load_from(&path).expect("load");
        assert_eq!(restored.rank_delta("btc"), 2);
    }

    #[test]
    fn rank_tracker_retain_drops_departed_assets() {
        let mut tracker = RankTracker::new();
        tracker.observe(&[asset("btc", 1e12, 1), asset("doge", 1e9, 40)]);
        tracker.retain_assets(&[asset("btc", 1e12, 1)]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.rank_delta("doge"), 0);
    }

    #[test]
    fn mailbox_is_last_write_wins() {
        let mailbox = SnapshotMailbox::new();
        assert!(mailbox.take().is_none());

        mailbox.publish(SnapshotPayload::live(vec![asset("btc", 1e12, 1)]));
        mailbox.publish(SnapshotPayload::live(vec![asset("eth", 1e11, 2)]));

        let delivered = mailbox.take().expect("payload");
        assert_eq!(delivered.assets[0].id, "eth");
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn synthetic_provider_is_deterministic_and_ranked() {
        let mut a = SyntheticProvider::new(20, 7);
        let mut b = SyntheticProvider::new(20, 7);
        let snap_a = a.fetch().expect("fetch");
        let snap_b = b.fetch().expect("fetch");
        assert_eq!(snap_a, snap_b);
        assert_eq!(snap_a.len(), 20);
        for (i, asset) in snap_a.iter().enumerate() {
            assert_eq!(asset.rank, i as u32 + 1);
            if i > 0 {
                assert!(snap_a[i - 1].market_cap >= asset.market_cap);
            }
        }
    }
}
