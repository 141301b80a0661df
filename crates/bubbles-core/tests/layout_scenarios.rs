//! End-to-end layout scenarios: a full market universe arriving, settling,
//! churning across refreshes, and surviving a degraded feed.

use bubbles_core::{AssetSnapshot, LayoutConfig, LayoutEngine, Position};

/// Deterministic synthetic universe: market caps follow a power-law-ish
/// decay, price changes alternate sign.
fn universe(n: usize) -> Vec<AssetSnapshot> {
    (0..n)
        .map(|i| {
            let cap = 1.0e12 / (i + 1) as f64;
            let sign = if i % 2 == 0 { 1.5 } else { -2.5 };
            let pct = sign * ((i % 7) as f64 + 0.5);
            AssetSnapshot::new(format!("asset-{i:04}"), cap, pct, i as u32 + 1)
        })
        .collect()
}

fn engine_with_seed(seed: u64) -> LayoutEngine {
    let config = LayoutConfig {
        rng_seed: Some(seed),
        ..LayoutConfig::default()
    };
    LayoutEngine::new(config).expect("engine")
}

fn assert_contained(engine: &LayoutEngine) {
    let width = engine.config().region_width;
    let height = engine.config().region_height;
    for view in engine.views() {
        let r = view.radius.min(width * 0.5).min(height * 0.5);
        assert!(
            view.position.x >= r - 1e-3 && view.position.x <= width - r + 1e-3,
            "{} escaped horizontally at {:?}",
            view.asset,
            view.position
        );
        assert!(
            view.position.y >= r - 1e-3 && view.position.y <= height - r + 1e-3,
            "{} escaped vertically at {:?}",
            view.asset,
            view.position
        );
    }
}

fn max_overlap(engine: &LayoutEngine) -> f32 {
    let views: Vec<_> = engine.views().collect();
    let mut worst = 0.0f32;
    for a in 0..views.len() {
        for b in (a + 1)..views.len() {
            let sum = views[a].radius + views[b].radius;
            let dist = views[a].position.distance_to(views[b].position);
            worst = worst.max(sum - dist);
        }
    }
    worst
}

#[test]
fn market_open_settles_into_separated_layout() {
    let mut engine = engine_with_seed(1);
    let outcome = engine.reconcile(&universe(120)).expect("reconcile");
    assert_eq!(outcome.inserted, 120);
    assert!(!outcome.truncated);

    for _ in 0..600 {
        engine.step();
        assert_contained(&engine);
    }

    let tolerance = engine.config().overlap_tolerance;
    let worst = max_overlap(&engine);
    assert!(
        worst <= tolerance + 1.0,
        "layout failed to settle: worst residual overlap {worst}"
    );
}

#[test]
fn refresh_churn_keeps_survivors_in_place() {
    let mut engine = engine_with_seed(2);
    engine.reconcile(&universe(50)).expect("first refresh");
    for _ in 0..120 {
        engine.step();
    }

    let before: Vec<(String, Position)> = engine
        .views()
        .map(|v| (v.asset.to_string(), v.position))
        .collect();

    // Second refresh: drop the bottom ten, add ten new listings, move caps.
    let mut next = universe(40);
    for (i, asset) in next.iter_mut().enumerate() {
        asset.market_cap *= 1.1;
        asset.rank = i as u32 + 1;
    }
    for i in 0..10 {
        next.push(AssetSnapshot::new(
            format!("listing-{i:02}"),
            5.0e8,
            0.0,
            41 + i as u32,
        ));
    }
    let outcome = engine.reconcile(&next).expect("second refresh");
    assert_eq!(outcome.inserted, 10);
    assert_eq!(outcome.removed, 10);
    assert_eq!(outcome.retargeted, 40);

    // Survivors hold their positions through the refresh itself.
    for (asset, position) in &before {
        if let Some(id) = engine.body_of(asset) {
            let body = engine.body(id).expect("live body");
            assert_eq!(body.position, *position, "{asset} jumped on refresh");
        }
    }
}

#[test]
fn degraded_feed_keeps_previous_layout_alive() {
    let mut engine = engine_with_seed(3);
    engine.reconcile(&universe(30)).expect("reconcile");
    for _ in 0..60 {
        engine.step();
    }
    let tracked = engine.len();

    // Feed outage: empty refreshes must not disturb the simulation.
    for _ in 0..10 {
        let outcome = engine.reconcile(&[]).expect("noop refresh");
        assert!(!outcome.applied);
        for _ in 0..30 {
            engine.step();
        }
        assert_eq!(engine.len(), tracked);
        assert_contained(&engine);
    }
}

#[test]
fn three_asset_universe_settles_ordered_and_separated() {
    let config = LayoutConfig {
        region_width: 800.0,
        region_height: 600.0,
        rng_seed: Some(5),
        ..LayoutConfig::default()
    };
    let mut engine = LayoutEngine::new(config).expect("engine");
    let snapshot = vec![
        AssetSnapshot::new("alpha", 1.0e12, 0.0, 1),
        AssetSnapshot::new("beta", 1.0e10, 0.0, 2),
        AssetSnapshot::new("gamma", 1.0e8, 0.0, 3),
    ];
    engine.reconcile(&snapshot).expect("reconcile");
    for _ in 0..200 {
        engine.step();
    }

    assert_contained(&engine);
    assert!(max_overlap(&engine) <= engine.config().overlap_tolerance + 1.0);

    let radius_of = |id: &str| {
        engine
            .body(engine.body_of(id).expect("tracked"))
            .expect("body")
            .radius
    };
    // Radii ordering matches market-cap ordering.
    assert!(radius_of("alpha") > radius_of("beta"));
    assert!(radius_of("beta") > radius_of("gamma"));
}

#[test]
fn target_radius_grows_with_market_cap() {
    let base = vec![
        AssetSnapshot::new("anchor", 1.0e12, 0.0, 1),
        AssetSnapshot::new("mover", 2.0e10, 0.0, 2),
    ];
    let mut bumped = base.clone();
    bumped[1].market_cap = 8.0e10;

    let target_of = |snapshot: &[AssetSnapshot]| {
        let config = LayoutConfig {
            rng_seed: Some(6),
            ..LayoutConfig::default()
        };
        let mut engine = LayoutEngine::new(config).expect("engine");
        engine.reconcile(snapshot).expect("reconcile");
        engine
            .body(engine.body_of("mover").expect("tracked"))
            .expect("body")
            .target_radius
    };
    assert!(target_of(&bumped) > target_of(&base));
}

#[test]
fn oversized_universe_truncates_to_capacity() {
    let mut engine = engine_with_seed(4);
    let outcome = engine.reconcile(&universe(520)).expect("reconcile");
    assert!(outcome.truncated);
    assert_eq!(engine.len(), 500);
    // Largest caps survive, smallest are dropped.
    assert!(engine.body_of("asset-0000").is_some());
    assert!(engine.body_of("asset-0519").is_none());
}

#[test]
fn large_population_runs_deterministically() {
    let run = |seed: u64| {
        let mut engine = engine_with_seed(seed);
        engine.reconcile(&universe(200)).expect("reconcile");
        for _ in 0..120 {
            engine.step();
        }
        engine.export_state()
    };
    assert_eq!(run(9), run(9));
    assert_ne!(run(9), run(10));
}
