use anyhow::Result;
use bubbles_app::{DriverConfig, FrameDriver, init_tracing, spawn_refresh_loop};
use bubbles_core::{LayoutConfig, LayoutEngine, LayoutState};
use bubbles_feed::{
    CachingProvider, RankTracker, SharedRankTracker, SnapshotMailbox, SyntheticProvider,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const LAYOUT_STATE_PATH: &str = "bubble_layout.json";
const RANK_STATE_PATH: &str = "bubble_ranks.json";

fn main() -> Result<()> {
    init_tracing();

    let tracker = SharedRankTracker::new(load_ranks());
    let mut engine =
        LayoutEngine::with_rank_source(LayoutConfig::default(), Box::new(tracker.clone()))?;
    resume_layout(&mut engine);

    let mailbox = SnapshotMailbox::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let provider = CachingProvider::new(SyntheticProvider::new(48, 0xB0BB1E));
    let fetcher = spawn_refresh_loop(
        provider,
        mailbox.clone(),
        tracker.clone(),
        Duration::from_secs(30),
        Arc::clone(&shutdown),
    );

    let max_frames = std::env::var("BUBBLES_FRAMES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(900);
    let mut driver = FrameDriver::new(engine, mailbox, DriverConfig::default());
    info!(max_frames, "starting market bubbles session");
    let simulated = driver.run(&shutdown, Some(max_frames));

    shutdown.store(true, Ordering::Relaxed);
    if fetcher.join().is_err() {
        warn!("refresh thread panicked during shutdown");
    }

    let state = driver.engine().export_state();
    std::fs::write(LAYOUT_STATE_PATH, serde_json::to_string_pretty(&state)?)?;
    tracker.snapshot().save_to(Path::new(RANK_STATE_PATH))?;
    info!(
        frames = simulated,
        bodies = driver.engine().len(),
        "session complete; layout and ranks saved"
    );
    Ok(())
}

fn load_ranks() -> RankTracker {
    match RankTracker::load_from(Path::new(RANK_STATE_PATH)) {
        Ok(tracker) => {
            info!(assets = tracker.len(), "restored rank baselines");
            tracker
        }
        Err(_) => RankTracker::new(),
    }
}

fn resume_layout(engine: &mut LayoutEngine) {
    let Ok(json) = std::fs::read_to_string(LAYOUT_STATE_PATH) else {
        return;
    };
    match serde_json::from_str::<LayoutState>(&json) {
        Ok(state) => {
            if let Err(err) = engine.restore_state(&state) {
                warn!(%err, "ignoring saved layout");
            } else {
                info!(bodies = engine.len(), "resumed saved layout");
            }
        }
        Err(err) => warn!(%err, "unreadable saved layout"),
    }
}
