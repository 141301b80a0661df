//! End-to-end driver checks: mailbox delivery at frame boundaries, stale
//! data handling, and a threaded refresh loop shutting down cleanly.

use bubbles_app::{DataStatus, DriverConfig, FrameDriver, spawn_refresh_loop};
use bubbles_core::{AssetSnapshot, LayoutConfig, LayoutEngine};
use bubbles_feed::{CachingProvider, SharedRankTracker, SnapshotMailbox, SnapshotPayload, SyntheticProvider};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn engine() -> LayoutEngine {
    let config = LayoutConfig {
        rng_seed: Some(11),
        ..LayoutConfig::default()
    };
    LayoutEngine::new(config).expect("engine")
}

fn assets(n: usize) -> Vec<AssetSnapshot> {
    (0..n)
        .map(|i| AssetSnapshot::new(format!("a{i}"), 1.0e12 / (i + 1) as f64, 0.0, i as u32 + 1))
        .collect()
}

#[test]
fn driver_reconciles_mailbox_payloads_between_frames() {
    let mailbox = SnapshotMailbox::new();
    let mut driver = FrameDriver::new(engine(), mailbox.clone(), DriverConfig::default());

    driver.run_frames(5);
    assert_eq!(driver.engine().len(), 0);

    mailbox.publish(SnapshotPayload::live(assets(12)));
    driver.run_frames(1);
    assert_eq!(driver.engine().len(), 12);
    assert_eq!(driver.status(), DataStatus::Live);

    // A second payload published mid-session replaces the body set.
    mailbox.publish(SnapshotPayload::live(assets(8)));
    driver.run_frames(1);
    assert_eq!(driver.engine().len(), 8);
}

#[test]
fn stale_payloads_degrade_data_status() {
    let mailbox = SnapshotMailbox::new();
    let mut driver = FrameDriver::new(engine(), mailbox.clone(), DriverConfig::default());

    mailbox.publish(SnapshotPayload::live(assets(4)));
    driver.run_frames(1);
    assert_eq!(driver.status(), DataStatus::Live);

    mailbox.publish(SnapshotPayload::stale(assets(4)));
    driver.run_frames(1);
    assert_eq!(
        driver.status(),
        DataStatus::Stale {
            missed_refreshes: 1
        }
    );

    mailbox.publish(SnapshotPayload::stale(assets(4)));
    driver.run_frames(1);
    assert_eq!(
        driver.status(),
        DataStatus::Stale {
            missed_refreshes: 2
        }
    );

    // The simulation itself keeps running throughout.
    assert_eq!(driver.engine().len(), 4);
    mailbox.publish(SnapshotPayload::live(assets(4)));
    driver.run_frames(1);
    assert_eq!(driver.status(), DataStatus::Live);
}

#[test]
fn rejected_snapshot_keeps_previous_layout() {
    let mailbox = SnapshotMailbox::new();
    let mut driver = FrameDriver::new(engine(), mailbox.clone(), DriverConfig::default());

    mailbox.publish(SnapshotPayload::live(assets(6)));
    driver.run_frames(1);

    let mut dup = assets(3);
    dup.push(dup[0].clone());
    mailbox.publish(SnapshotPayload::live(dup));
    driver.run_frames(1);
    assert_eq!(driver.engine().len(), 6, "bad snapshot must not disturb layout");
}

#[test]
fn refresh_thread_feeds_driver_and_shuts_down() {
    let mailbox = SnapshotMailbox::new();
    let tracker = SharedRankTracker::default();
    let shutdown = Arc::new(AtomicBool::new(false));
    let provider = CachingProvider::new(SyntheticProvider::new(16, 3));
    let handle = spawn_refresh_loop(
        provider,
        mailbox.clone(),
        tracker.clone(),
        Duration::from_millis(10),
        Arc::clone(&shutdown),
    );

    let mut driver = FrameDriver::new(engine(), mailbox, DriverConfig::default());
    let mut populated = false;
    for _ in 0..100 {
        driver.tick();
        if driver.engine().len() == 16 {
            populated = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    shutdown.store(true, Ordering::Relaxed);
    handle.join().expect("refresh thread joins");
    assert!(populated, "driver never received the synthetic snapshot");
}
