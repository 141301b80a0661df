//! Session shell wiring the layout engine to a market feed.
//!
//! [`FrameDriver`] owns the engine and drains the snapshot mailbox once per
//! frame, so reconciliation only ever happens at frame boundaries;
//! [`spawn_refresh_loop`] runs the feed on its own thread under the upstream
//! rate limit. Everything here is headless; a renderer reads
//! [`bubbles_core::LayoutEngine::views`] between ticks.

use bubbles_core::{FrameEvents, LayoutEngine};
use bubbles_feed::{
    CachingProvider, FetchError, RateLimiter, SharedRankTracker, SnapshotMailbox, SnapshotProvider,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pacing and reporting knobs for a driver session.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Simulation frames per second when pacing.
    pub fps: u32,
    /// Frames between periodic log summaries.
    pub summary_interval: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            summary_interval: 300,
        }
    }
}

/// Freshness of the data the simulation is currently running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Live,
    /// Running on a previous layout or cached snapshot.
    Stale { missed_refreshes: u32 },
}

impl DataStatus {
    fn degrade(self) -> Self {
        match self {
            DataStatus::Live => DataStatus::Stale {
                missed_refreshes: 1,
            },
            DataStatus::Stale { missed_refreshes } => DataStatus::Stale {
                missed_refreshes: missed_refreshes.saturating_add(1),
            },
        }
    }
}

/// Drives the layout engine frame by frame, reconciling against whatever the
/// mailbox delivered since the previous frame.
pub struct FrameDriver {
    engine: LayoutEngine,
    mailbox: SnapshotMailbox,
    config: DriverConfig,
    status: DataStatus,
}

impl FrameDriver {
    #[must_use]
    pub fn new(engine: LayoutEngine, mailbox: SnapshotMailbox, config: DriverConfig) -> Self {
        Self {
            engine,
            mailbox,
            config,
            status: DataStatus::Stale {
                missed_refreshes: 0,
            },
        }
    }

    #[must_use]
    pub fn engine(&self) -> &LayoutEngine {
        &self.engine
    }

    #[must_use]
    pub fn engine_mut(&mut self) -> &mut LayoutEngine {
        &mut self.engine
    }

    #[must_use]
    pub const fn status(&self) -> DataStatus {
        self.status
    }

    /// Process one frame: drain the mailbox, reconcile, step.
    pub fn tick(&mut self) -> FrameEvents {
        if let Some(payload) = self.mailbox.take() {
            match self.engine.reconcile(&payload.assets) {
                Ok(outcome) => {
                    self.status = if outcome.applied && !payload.stale {
                        DataStatus::Live
                    } else {
                        self.status.degrade()
                    };
                }
                Err(err) => {
                    // The previous layout keeps running on a bad snapshot.
                    warn!(%err, "rejected snapshot");
                    self.status = self.status.degrade();
                }
            }
        }
        let events = self.engine.step();
        if self.config.summary_interval > 0 && events.frame % self.config.summary_interval == 0 {
            info!(
                frame = events.frame,
                bodies = self.engine.len(),
                corrections = events.corrections,
                residual = events.max_residual_overlap,
                status = ?self.status,
                "frame summary"
            );
        }
        events
    }

    /// Run `frames` ticks back to back, without pacing. Test entry point.
    pub fn run_frames(&mut self, frames: u64) {
        for _ in 0..frames {
            self.tick();
        }
    }

    /// Run paced at the configured frame rate until `shutdown` is set or
    /// `max_frames` ticks have elapsed. Returns the frames simulated.
    pub fn run(&mut self, shutdown: &AtomicBool, max_frames: Option<u64>) -> u64 {
        let frame_time = Duration::from_secs_f64(1.0 / f64::from(self.config.fps.max(1)));
        let mut frames = 0u64;
        while !shutdown.load(Ordering::Relaxed) {
            if let Some(max) = max_frames {
                if frames >= max {
                    break;
                }
            }
            let start = Instant::now();
            self.tick();
            frames += 1;
            let elapsed = start.elapsed();
            if elapsed < frame_time {
                thread::sleep(frame_time - elapsed);
            }
        }
        frames
    }
}

/// Run the feed on a background thread: fetch under the rate limit every
/// `interval`, fold ranks into the tracker, and publish to the mailbox.
pub fn spawn_refresh_loop<P: SnapshotProvider + 'static>(
    mut provider: CachingProvider<P>,
    mailbox: SnapshotMailbox,
    tracker: SharedRankTracker,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut limiter = RateLimiter::default();
        while !shutdown.load(Ordering::Relaxed) {
            let wait = limiter.wait_time();
            if wait > Duration::ZERO {
                let err = FetchError::RateLimited { retry_after: wait };
                debug!(%err, "deferring market refresh");
                sleep_interruptible(wait, &shutdown);
                continue;
            }
            if limiter.try_acquire() {
                match provider.fetch_payload() {
                    Ok(payload) => {
                        tracker.observe(&payload.assets);
                        mailbox.publish(payload);
                    }
                    Err(err) => {
                        warn!(%err, "market refresh failed with nothing cached; retrying");
                    }
                }
            }
            sleep_interruptible(interval, &shutdown);
        }
        info!("refresh loop stopped");
    })
}

/// Sleep in short slices so a shutdown request is honored promptly.
fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}

/// Standard subscriber setup shared by the binary and integration tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
