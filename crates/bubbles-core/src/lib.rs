//! Core bubble layout engine shared across the Market Bubbles workspace.
//!
//! A [`LayoutEngine`] owns the set of simulated bubble bodies, reconciles it
//! against incoming market snapshots, and advances a per-frame positional
//! relaxation step that keeps bodies separated and inside the containment
//! region. The engine is fully headless and deterministic under a seeded RNG:
//! renderers only ever read [`BubbleView`]s, and data feeds only ever hand in
//! [`AssetSnapshot`] slices at frame boundaries.

use bubbles_index::{Circle, ProximityIndex, UniformGridIndex};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable handle for bubble bodies backed by a generational slot map.
    pub struct BubbleId;
}

/// Convenience alias for associating side data with bubbles.
pub type BubbleMap<T> = SecondaryMap<BubbleId, T>;

/// Floor applied to rendered radii so a body never degenerates to a point.
const MIN_RENDER_RADIUS: f32 = 0.1;

const TAU: f32 = std::f32::consts::TAU;

/// 2D position in containment-region coordinates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance_to(&self, other: Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Per-frame world-space velocity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }

    #[must_use]
    pub fn speed(&self) -> f32 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

/// One asset record from a market refresh. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    /// Stable asset key (e.g., ticker symbol).
    pub id: String,
    /// Market capitalization; non-finite or negative values are treated as 0.
    pub market_cap: f64,
    /// Signed percentage price change over the refresh window.
    pub price_change_pct: f64,
    /// 1-based market rank at snapshot time.
    pub rank: u32,
}

impl AssetSnapshot {
    #[must_use]
    pub fn new(id: impl Into<String>, market_cap: f64, price_change_pct: f64, rank: u32) -> Self {
        Self {
            id: id.into(),
            market_cap,
            price_change_pct,
            rank,
        }
    }

    /// Market cap with NaN/negative inputs collapsed to zero.
    #[must_use]
    fn sane_cap(&self) -> f64 {
        if self.market_cap.is_finite() {
            self.market_cap.max(0.0)
        } else {
            0.0
        }
    }
}

/// Direction of an asset's price move, as rendered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Tone {
    Up,
    Down,
    #[default]
    Flat,
}

/// Color inputs for a bubble: a tone plus a continuous intensity in `[0, 1]`.
///
/// Derived from price change at reconcile time only; never feeds physics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ColorState {
    pub tone: Tone,
    pub intensity: f32,
}

impl ColorState {
    /// Intensity saturates at this absolute percentage move.
    const SATURATION_PCT: f64 = 10.0;

    #[must_use]
    pub fn from_price_change(pct: f64) -> Self {
        if !pct.is_finite() || pct == 0.0 {
            return Self::default();
        }
        let tone = if pct > 0.0 { Tone::Up } else { Tone::Down };
        let intensity = (pct.abs() / Self::SATURATION_PCT).clamp(0.0, 1.0) as f32;
        Self { tone, intensity }
    }
}

/// Scalar fields for a single bubble used when inserting or snapshotting
/// from the column store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BubbleData {
    pub position: Position,
    pub velocity: Velocity,
    pub radius: f32,
    pub target_radius: f32,
    pub color: ColorState,
    pub rank: u32,
    pub rank_delta: i32,
}

impl Default for BubbleData {
    fn default() -> Self {
        Self {
            position: Position::default(),
            velocity: Velocity::default(),
            radius: MIN_RENDER_RADIUS,
            target_radius: MIN_RENDER_RADIUS,
            color: ColorState::default(),
            rank: 0,
            rank_delta: 0,
        }
    }
}

/// Collection of per-bubble columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BubbleColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    radii: Vec<f32>,
    target_radii: Vec<f32>,
    colors: Vec<ColorState>,
    ranks: Vec<u32>,
    rank_deltas: Vec<i32>,
}

impl BubbleColumns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.radii.len());
        debug_assert_eq!(self.positions.len(), self.target_radii.len());
        debug_assert_eq!(self.positions.len(), self.colors.len());
        debug_assert_eq!(self.positions.len(), self.ranks.len());
        debug_assert_eq!(self.positions.len(), self.rank_deltas.len());
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, body: BubbleData) {
        self.positions.push(body.position);
        self.velocities.push(body.velocity);
        self.radii.push(body.radius);
        self.target_radii.push(body.target_radius);
        self.colors.push(body.color);
        self.ranks.push(body.rank);
        self.rank_deltas.push(body.rank_delta);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> BubbleData {
        let removed = BubbleData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            radius: self.radii.swap_remove(index),
            target_radius: self.target_radii.swap_remove(index),
            color: self.colors.swap_remove(index),
            rank: self.ranks.swap_remove(index),
            rank_delta: self.rank_deltas.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Copy the row at `from` into position `to` without altering length.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.positions[to] = self.positions[from];
        self.velocities[to] = self.velocities[from];
        self.radii[to] = self.radii[from];
        self.target_radii[to] = self.target_radii[from];
        self.colors[to] = self.colors[from];
        self.ranks[to] = self.ranks[from];
        self.rank_deltas[to] = self.rank_deltas[from];
    }

    /// Truncate all columns to the provided length.
    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.radii.truncate(len);
        self.target_radii.truncate(len);
        self.colors.truncate(len);
        self.ranks.truncate(len);
        self.rank_deltas.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> BubbleData {
        BubbleData {
            position: self.positions[index],
            velocity: self.velocities[index],
            radius: self.radii[index],
            target_radius: self.target_radii[index],
            color: self.colors[index],
            rank: self.ranks[index],
            rank_delta: self.rank_deltas[index],
        }
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    #[must_use]
    pub fn radii(&self) -> &[f32] {
        &self.radii
    }

    #[must_use]
    pub fn radii_mut(&mut self) -> &mut [f32] {
        &mut self.radii
    }

    #[must_use]
    pub fn target_radii(&self) -> &[f32] {
        &self.target_radii
    }

    #[must_use]
    pub fn target_radii_mut(&mut self) -> &mut [f32] {
        &mut self.target_radii
    }

    #[must_use]
    pub fn colors(&self) -> &[ColorState] {
        &self.colors
    }

    #[must_use]
    pub fn ranks(&self) -> &[u32] {
        &self.ranks
    }

    #[must_use]
    pub fn rank_deltas(&self) -> &[i32] {
        &self.rank_deltas
    }
}

/// Dense bubble storage: contiguous columns plus generational handles and an
/// id-to-index lookup. Iteration over columns is cache-friendly; handles stay
/// stable across swap-removals.
#[derive(Debug, Default)]
pub struct BubbleArena {
    slots: SlotMap<BubbleId, usize>,
    handles: Vec<BubbleId>,
    assets: Vec<String>,
    columns: BubbleColumns,
}

impl BubbleArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Dense index of `id`, if live.
    #[must_use]
    pub fn index_of(&self, id: BubbleId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: BubbleId) -> bool {
        self.slots.contains_key(id)
    }

    /// Handle stored at dense index `index`.
    #[must_use]
    pub fn handle_at(&self, index: usize) -> Option<BubbleId> {
        self.handles.get(index).copied()
    }

    /// Asset id stored at dense index `index`.
    #[must_use]
    pub fn asset_at(&self, index: usize) -> Option<&str> {
        self.assets.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    #[must_use]
    pub fn handles(&self) -> &[BubbleId] {
        &self.handles
    }

    #[must_use]
    pub fn columns(&self) -> &BubbleColumns {
        &self.columns
    }

    #[must_use]
    pub fn columns_mut(&mut self) -> &mut BubbleColumns {
        &mut self.columns
    }

    /// Insert a new bubble for `asset` and return its handle.
    pub fn insert(&mut self, asset: String, body: BubbleData) -> BubbleId {
        let index = self.columns.len();
        self.columns.push(body);
        self.assets.push(asset);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: BubbleId) -> Option<BubbleData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        self.assets.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Remove all bubbles whose ids are contained in `dead`, preserving the
    /// dense order of survivors.
    pub fn remove_many(&mut self, dead: &HashSet<BubbleId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.assets.swap(read, write);
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len().saturating_sub(write);
        self.handles.truncate(write);
        self.assets.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: BubbleId) -> Option<BubbleData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored bubbles.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.assets.clear();
        self.columns.truncate(0);
    }
}

/// Errors raised when constructing or restoring engine state.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Indicates a malformed resume-state payload.
    #[error("invalid layout state: {0}")]
    InvalidState(&'static str),
}

/// Fatal precondition failures at the reconciliation boundary. The engine
/// refuses the snapshot and keeps its previous state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("duplicate asset id in snapshot: {0}")]
    DuplicateId(String),
}

/// Static configuration for a bubble layout engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutConfig {
    /// Width of the containment region in layout units.
    pub region_width: f32,
    /// Height of the containment region in layout units.
    pub region_height: f32,
    /// Smallest rendered radius before auto-scaling.
    pub min_radius: f32,
    /// Largest rendered radius before auto-scaling.
    pub max_radius: f32,
    /// Whether the radius band is rescaled against available area and
    /// population.
    pub auto_scale: bool,
    /// Fraction of region area reserved for movement when auto-scaling.
    pub spacing_reserve: f32,
    /// Hard cap on simulated bubbles; larger snapshots are truncated to the
    /// top entries by market cap.
    pub max_bubbles: usize,
    /// Positional relaxation passes per simulation step.
    pub relaxation_iterations: u32,
    /// Fraction of the needed pair correction applied per pass. Full
    /// separation in one pass jitters overlapping clusters.
    pub separation_softness: f32,
    /// Residual pair overlap left untouched to avoid micro-jitter.
    pub overlap_tolerance: f32,
    /// Per-frame velocity retention factor.
    pub damping: f32,
    /// Fraction of speed retained, directed inward, when a body is clamped
    /// at the containment boundary.
    pub restitution: f32,
    /// Speed ceiling so corrections cannot launch a body across the region.
    pub max_speed: f32,
    /// Fraction of the radius-to-target gap closed per frame.
    pub radius_approach: f32,
    /// Fraction of the target radius a newly created body starts at.
    pub seed_radius_fraction: f32,
    /// Rejection-sampling attempts for a clear seed position.
    pub seed_attempts: u32,
    /// Populations at or below this size skip the proximity grid.
    pub brute_force_threshold: usize,
    /// Grid cell edge length; 0 derives one from the radius band.
    pub grid_cell_size: f32,
    /// Maximum number of reconcile summaries retained in memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible layouts.
    pub rng_seed: Option<u64>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            // 75% x 60% of a 1280x720 display, the dashboard's bubble pane.
            region_width: 960.0,
            region_height: 432.0,
            min_radius: 10.0,
            max_radius: 30.0,
            auto_scale: true,
            spacing_reserve: 0.4,
            max_bubbles: 500,
            relaxation_iterations: 2,
            separation_softness: 0.35,
            overlap_tolerance: 0.5,
            damping: 0.94,
            restitution: 0.3,
            max_speed: 15.0,
            radius_approach: 0.15,
            seed_radius_fraction: 0.35,
            seed_attempts: 16,
            brute_force_threshold: 64,
            grid_cell_size: 0.0,
            history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl LayoutConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.region_width <= 0.0 || self.region_height <= 0.0 {
            return Err(LayoutError::InvalidConfig(
                "region dimensions must be positive",
            ));
        }
        if self.min_radius <= 0.0 || self.max_radius < self.min_radius {
            return Err(LayoutError::InvalidConfig(
                "radius band must satisfy 0 < min_radius <= max_radius",
            ));
        }
        if !(0.0..1.0).contains(&self.spacing_reserve) {
            return Err(LayoutError::InvalidConfig(
                "spacing_reserve must be in [0, 1)",
            ));
        }
        if self.max_bubbles == 0 {
            return Err(LayoutError::InvalidConfig("max_bubbles must be positive"));
        }
        if self.relaxation_iterations == 0 {
            return Err(LayoutError::InvalidConfig(
                "relaxation_iterations must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.separation_softness) || self.separation_softness == 0.0 {
            return Err(LayoutError::InvalidConfig(
                "separation_softness must be in (0, 1]",
            ));
        }
        if self.overlap_tolerance < 0.0 {
            return Err(LayoutError::InvalidConfig(
                "overlap_tolerance must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.damping) || self.damping == 0.0 {
            return Err(LayoutError::InvalidConfig("damping must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.restitution) {
            return Err(LayoutError::InvalidConfig("restitution must be in [0, 1]"));
        }
        if self.max_speed <= 0.0 {
            return Err(LayoutError::InvalidConfig("max_speed must be positive"));
        }
        if !(0.0..=1.0).contains(&self.radius_approach) || self.radius_approach == 0.0 {
            return Err(LayoutError::InvalidConfig(
                "radius_approach must be in (0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.seed_radius_fraction) || self.seed_radius_fraction == 0.0 {
            return Err(LayoutError::InvalidConfig(
                "seed_radius_fraction must be in (0, 1]",
            ));
        }
        if self.seed_attempts == 0 {
            return Err(LayoutError::InvalidConfig(
                "seed_attempts must be at least 1",
            ));
        }
        if self.grid_cell_size < 0.0 {
            return Err(LayoutError::InvalidConfig(
                "grid_cell_size must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(LayoutError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    fn grid_cell(&self) -> f32 {
        if self.grid_cell_size > 0.0 {
            self.grid_cell_size
        } else {
            self.max_radius * 2.0
        }
    }
}

/// Market-cap to radius mapping, re-derived on every reconciliation so radii
/// stay comparable as the tracked universe changes.
///
/// Monotonic and continuous in market cap, clamped to the configured band.
/// A square-root scale keeps six orders of magnitude of caps visually
/// distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiusScale {
    min_radius: f32,
    max_radius: f32,
    max_cap: f64,
}

impl RadiusScale {
    /// Scale that maps everything to the configured minimum (no data yet).
    #[must_use]
    pub fn empty(config: &LayoutConfig) -> Self {
        Self {
            min_radius: config.min_radius,
            max_radius: config.max_radius,
            max_cap: 0.0,
        }
    }

    /// Derive a scale for a snapshot of `population` assets whose largest
    /// market cap is `max_cap`.
    #[must_use]
    pub fn derive(config: &LayoutConfig, population: usize, max_cap: f64) -> Self {
        let factor = if config.auto_scale {
            Self::area_factor(config, population)
        } else {
            1.0
        };
        let max_cap = if max_cap.is_finite() && max_cap > 0.0 {
            max_cap
        } else {
            0.0
        };
        Self {
            min_radius: config.min_radius * factor,
            max_radius: config.max_radius * factor,
            max_cap,
        }
    }

    /// Overall scale factor from usable area versus the area the population
    /// would demand at the mid-band radius. 50 bubbles and 500 bubbles both
    /// fill the region sensibly this way.
    fn area_factor(config: &LayoutConfig, population: usize) -> f32 {
        if population == 0 {
            return 1.0;
        }
        let usable =
            config.region_width * config.region_height * (1.0 - config.spacing_reserve);
        let mean_radius = (config.min_radius + config.max_radius) * 0.5;
        let demand = population as f32 * std::f32::consts::PI * mean_radius * mean_radius;
        if demand <= 0.0 {
            return 1.0;
        }
        (usable / demand).sqrt().clamp(0.5, 2.0)
    }

    /// Radius for `market_cap`; a zero or degenerate cap maps to the band
    /// minimum, never NaN.
    #[must_use]
    pub fn radius_for(&self, market_cap: f64) -> f32 {
        if self.max_cap <= 0.0 {
            return self.min_radius;
        }
        let cap = if market_cap.is_finite() {
            market_cap.max(0.0)
        } else {
            0.0
        };
        let ratio = (cap / self.max_cap).clamp(0.0, 1.0);
        let t = ratio.sqrt() as f32;
        self.min_radius + (self.max_radius - self.min_radius) * t
    }

    #[must_use]
    pub const fn min_radius(&self) -> f32 {
        self.min_radius
    }

    #[must_use]
    pub const fn max_radius(&self) -> f32 {
        self.max_radius
    }
}

/// Rank-delta collaborator queried per body during reconciliation.
pub trait RankSource: Send {
    /// Signed rank change for `asset` since the tracking baseline; positive
    /// means the asset climbed.
    fn rank_delta(&self, asset: &str) -> i32;
}

/// Rank source reporting no movement for every asset.
#[derive(Debug, Default)]
pub struct NullRankSource;

impl RankSource for NullRankSource {
    fn rank_delta(&self, _asset: &str) -> i32 {
        0
    }
}

/// Result of applying (or skipping) one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// False when the snapshot was empty and the previous layout was kept.
    pub applied: bool,
    /// Live bodies after reconciliation.
    pub tracked: usize,
    pub inserted: usize,
    pub removed: usize,
    pub retargeted: usize,
    /// True when the snapshot exceeded `max_bubbles` and was truncated.
    pub truncated: bool,
}

impl ReconcileOutcome {
    fn skipped(tracked: usize) -> Self {
        Self {
            tracked,
            ..Self::default()
        }
    }
}

/// Events emitted after processing one simulation frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameEvents {
    pub frame: u64,
    /// Pair corrections applied across all relaxation passes.
    pub corrections: usize,
    /// Bodies clamped at the containment boundary.
    pub clamped: usize,
    /// Largest remaining pair overlap after the iteration budget.
    pub max_residual_overlap: f32,
}

/// Read-only view of one live bubble, taken by the render layer once per
/// rendered frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BubbleView<'a> {
    pub id: BubbleId,
    pub asset: &'a str,
    pub position: Position,
    pub radius: f32,
    pub color: ColorState,
    pub rank: u32,
    pub rank_delta: i32,
}

/// Serializable state of one body, for resuming a layout across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyState {
    pub asset: String,
    pub position: Position,
    pub velocity: Velocity,
    pub radius: f32,
    pub target_radius: f32,
    pub color: ColorState,
    pub rank: u32,
    pub rank_delta: i32,
}

/// Full resume payload: last known positions and sizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutState {
    pub bodies: Vec<BodyState>,
}

/// The bubble layout engine: owns the body set, reconciles it against market
/// snapshots, and advances the per-frame relaxation step.
pub struct LayoutEngine {
    config: LayoutConfig,
    rng: SmallRng,
    bubbles: BubbleArena,
    lookup: HashMap<String, BubbleId>,
    index: UniformGridIndex,
    circles: Vec<Circle>,
    /// Dense indices in asset-id order; the pair sweep walks this so pair
    /// processing order is stable and data-independent. Rebuilt whenever the
    /// body set changes, never mid-frame.
    sweep: Vec<usize>,
    sweep_pos: Vec<usize>,
    scale: RadiusScale,
    frame: u64,
    history: VecDeque<ReconcileOutcome>,
    rank_source: Box<dyn RankSource>,
}

impl fmt::Debug for LayoutEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutEngine")
            .field("config", &self.config)
            .field("frame", &self.frame)
            .field("bubble_count", &self.bubbles.len())
            .finish()
    }
}

impl LayoutEngine {
    /// Instantiate a new engine using the supplied configuration.
    pub fn new(config: LayoutConfig) -> Result<Self, LayoutError> {
        Self::with_rank_source(config, Box::new(NullRankSource))
    }

    /// Instantiate a new engine with an explicit rank-delta collaborator.
    pub fn with_rank_source(
        config: LayoutConfig,
        rank_source: Box<dyn RankSource>,
    ) -> Result<Self, LayoutError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let index =
            UniformGridIndex::new(config.grid_cell(), config.region_width, config.region_height);
        let scale = RadiusScale::empty(&config);
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            rng,
            bubbles: BubbleArena::new(),
            lookup: HashMap::new(),
            index,
            circles: Vec::new(),
            sweep: Vec::new(),
            sweep_pos: Vec::new(),
            scale,
            frame: 0,
            history: VecDeque::with_capacity(history_capacity),
            rank_source,
        })
    }

    /// Replace the rank-delta collaborator.
    pub fn set_rank_source(&mut self, rank_source: Box<dyn RankSource>) {
        self.rank_source = rank_source;
    }

    #[must_use]
    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Number of live bubbles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bubbles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bubbles.is_empty()
    }

    /// Frames simulated so far.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Current radius scale (re-derived each applied reconciliation).
    #[must_use]
    pub const fn scale(&self) -> RadiusScale {
        self.scale
    }

    /// Handle for `asset`, if currently tracked.
    #[must_use]
    pub fn body_of(&self, asset: &str) -> Option<BubbleId> {
        self.lookup.get(asset).copied()
    }

    /// Copy of the scalar data for `id`.
    #[must_use]
    pub fn body(&self, id: BubbleId) -> Option<BubbleData> {
        self.bubbles.snapshot(id)
    }

    /// Read-only access to the arena.
    #[must_use]
    pub fn bubbles(&self) -> &BubbleArena {
        &self.bubbles
    }

    /// Iterate over retained reconcile summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ReconcileOutcome> {
        self.history.iter()
    }

    /// Read-only per-bubble views for the render layer.
    pub fn views(&self) -> impl Iterator<Item = BubbleView<'_>> {
        let columns = self.bubbles.columns();
        (0..self.bubbles.len()).map(move |i| BubbleView {
            id: self.bubbles.handles()[i],
            asset: self.bubbles.assets()[i].as_str(),
            position: columns.positions()[i],
            radius: columns.radii()[i],
            color: columns.colors()[i],
            rank: columns.ranks()[i],
            rank_delta: columns.rank_deltas()[i],
        })
    }

    /// Reconcile the live body set against a market snapshot. Called once per
    /// data refresh, never per frame, and only at frame boundaries.
    ///
    /// An empty snapshot is the degraded-data path: the previous layout keeps
    /// simulating untouched. A snapshot with duplicate ids is refused whole.
    pub fn reconcile(
        &mut self,
        snapshot: &[AssetSnapshot],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if snapshot.is_empty() {
            debug!("empty snapshot; keeping previous layout");
            return Ok(ReconcileOutcome::skipped(self.bubbles.len()));
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(snapshot.len());
        for asset in snapshot {
            if !seen.insert(asset.id.as_str()) {
                warn!(asset = %asset.id, "rejecting snapshot with duplicate asset id");
                return Err(ReconcileError::DuplicateId(asset.id.clone()));
            }
        }

        // Capacity policy: keep the top entries by market cap, ties broken by
        // id so truncation is deterministic.
        let truncated = snapshot.len() > self.config.max_bubbles;
        let mut selected: Vec<&AssetSnapshot> = snapshot.iter().collect();
        if truncated {
            selected.sort_by(|a, b| {
                b.sane_cap()
                    .partial_cmp(&a.sane_cap())
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            selected.truncate(self.config.max_bubbles);
        }

        let max_cap = selected.iter().map(|a| a.sane_cap()).fold(0.0, f64::max);
        self.scale = RadiusScale::derive(&self.config, selected.len(), max_cap);

        // Remove bodies whose ids vanished from the snapshot.
        let keep: HashSet<&str> = selected.iter().map(|a| a.id.as_str()).collect();
        let mut dead: HashSet<BubbleId> = HashSet::new();
        for (asset, &id) in &self.lookup {
            if !keep.contains(asset.as_str()) {
                dead.insert(id);
            }
        }
        let removed = self.bubbles.remove_many(&dead);
        self.lookup.retain(|asset, _| keep.contains(asset.as_str()));

        let mut inserted = 0usize;
        let mut retargeted = 0usize;
        for asset in &selected {
            let target = self.scale.radius_for(asset.sane_cap());
            let color = ColorState::from_price_change(asset.price_change_pct);
            let rank_delta = self.rank_source.rank_delta(&asset.id);
            if let Some(&id) = self.lookup.get(&asset.id) {
                // Retarget only; position and velocity are never touched here.
                if let Some(i) = self.bubbles.index_of(id) {
                    let columns = self.bubbles.columns_mut();
                    columns.target_radii_mut()[i] = target;
                    columns.colors[i] = color;
                    columns.ranks[i] = asset.rank;
                    columns.rank_deltas[i] = rank_delta;
                    retargeted += 1;
                }
            } else {
                let radius = (target * self.config.seed_radius_fraction).max(MIN_RENDER_RADIUS);
                let position = seed_position(
                    &self.config,
                    &mut self.rng,
                    self.bubbles.columns(),
                    radius,
                );
                let velocity = drift_velocity(&mut self.rng);
                let id = self.bubbles.insert(
                    asset.id.clone(),
                    BubbleData {
                        position,
                        velocity,
                        radius,
                        target_radius: target,
                        color,
                        rank: asset.rank,
                        rank_delta,
                    },
                );
                self.lookup.insert(asset.id.clone(), id);
                inserted += 1;
            }
        }

        self.rebuild_sweep();

        let outcome = ReconcileOutcome {
            applied: true,
            tracked: self.bubbles.len(),
            inserted,
            removed,
            retargeted,
            truncated,
        };
        debug!(
            tracked = outcome.tracked,
            inserted,
            removed,
            retargeted,
            truncated,
            "reconciled snapshot"
        );
        while self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
        Ok(outcome)
    }

    /// Advance one simulation frame: integrate and damp velocities, relax
    /// pair overlaps over the iteration budget, approach target radii, and
    /// clamp every body inside the containment region.
    pub fn step(&mut self) -> FrameEvents {
        debug_assert_eq!(self.sweep.len(), self.bubbles.len());
        self.frame += 1;
        self.stage_integrate();
        let corrections = self.stage_separate();
        self.stage_resize();
        let clamped = self.stage_contain();
        let max_residual_overlap = self.measure_residual();
        FrameEvents {
            frame: self.frame,
            corrections,
            clamped,
            max_residual_overlap,
        }
    }

    /// Body under `point`: nearest containing circle, ties broken by the
    /// smallest radius so the topmost-looking bubble wins.
    #[must_use]
    pub fn hit_test(&self, point: Position) -> Option<BubbleId> {
        let columns = self.bubbles.columns();
        let mut best: Option<(f32, &str, BubbleId)> = None;
        for i in 0..self.bubbles.len() {
            let radius = columns.radii()[i];
            if columns.positions()[i].distance_to(point) > radius {
                continue;
            }
            let asset = &self.bubbles.assets()[i];
            let id = self.bubbles.handles()[i];
            let candidate = (radius, asset.as_str(), id);
            best = match best {
                None => Some(candidate),
                Some(current) if (candidate.0, candidate.1) < (current.0, current.1) => {
                    Some(candidate)
                }
                Some(current) => Some(current),
            };
        }
        best.map(|(_, _, id)| id)
    }

    /// Export last known positions and sizes for resuming after a restart.
    #[must_use]
    pub fn export_state(&self) -> LayoutState {
        let columns = self.bubbles.columns();
        let bodies = (0..self.bubbles.len())
            .map(|i| BodyState {
                asset: self.bubbles.assets()[i].clone(),
                position: columns.positions()[i],
                velocity: columns.velocities()[i],
                radius: columns.radii()[i],
                target_radius: columns.target_radii()[i],
                color: columns.colors()[i],
                rank: columns.ranks()[i],
                rank_delta: columns.rank_deltas()[i],
            })
            .collect();
        LayoutState { bodies }
    }

    /// Replace the live body set with a previously exported layout. The next
    /// reconciliation re-derives targets and prunes departed assets as usual.
    pub fn restore_state(&mut self, state: &LayoutState) -> Result<(), LayoutError> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(state.bodies.len());
        for body in &state.bodies {
            if !seen.insert(body.asset.as_str()) {
                return Err(LayoutError::InvalidState(
                    "duplicate asset id in layout state",
                ));
            }
            if !body.radius.is_finite() || body.radius <= 0.0 {
                return Err(LayoutError::InvalidState("body radius must be positive"));
            }
        }
        self.bubbles.clear();
        self.lookup.clear();
        for body in state.bodies.iter().take(self.config.max_bubbles) {
            let id = self.bubbles.insert(
                body.asset.clone(),
                BubbleData {
                    position: body.position,
                    velocity: body.velocity,
                    radius: body.radius,
                    target_radius: body.target_radius.max(0.0),
                    color: body.color,
                    rank: body.rank,
                    rank_delta: body.rank_delta,
                },
            );
            self.lookup.insert(body.asset.clone(), id);
        }
        self.rebuild_sweep();
        Ok(())
    }

    fn rebuild_sweep(&mut self) {
        let n = self.bubbles.len();
        self.sweep.clear();
        self.sweep.extend(0..n);
        let assets = self.bubbles.assets();
        self.sweep.sort_unstable_by(|&a, &b| assets[a].cmp(&assets[b]));
        self.sweep_pos.clear();
        self.sweep_pos.resize(n, 0);
        for (k, &i) in self.sweep.iter().enumerate() {
            self.sweep_pos[i] = k;
        }
    }

    fn stage_integrate(&mut self) {
        let damping = self.config.damping;
        let max_speed = self.config.max_speed;
        let columns = self.bubbles.columns_mut();
        for i in 0..columns.len() {
            let velocity = &mut columns.velocities[i];
            velocity.vx *= damping;
            velocity.vy *= damping;
            let speed = velocity.speed();
            if speed > max_speed {
                let limit = max_speed / speed;
                velocity.vx *= limit;
                velocity.vy *= limit;
            }
            let velocity = columns.velocities[i];
            let position = &mut columns.positions[i];
            position.x += velocity.vx;
            position.y += velocity.vy;
        }
    }

    fn stage_separate(&mut self) -> usize {
        let n = self.bubbles.len();
        if n < 2 {
            return 0;
        }
        let iterations = self.config.relaxation_iterations;
        let softness = self.config.separation_softness;
        let tolerance = self.config.overlap_tolerance;
        let use_grid = n > self.config.brute_force_threshold;
        let mut corrections = 0usize;
        for _ in 0..iterations {
            if use_grid && self.refresh_index() {
                let LayoutEngine {
                    ref index,
                    ref mut bubbles,
                    ref mut rng,
                    ref sweep,
                    ref sweep_pos,
                    ..
                } = *self;
                let columns = bubbles.columns_mut();
                for (k, &i) in sweep.iter().enumerate() {
                    index.overlaps_of(i, &mut |j, _| {
                        if sweep_pos[j] > k && separate_pair(columns, rng, i, j, softness, tolerance)
                        {
                            corrections += 1;
                        }
                    });
                }
            } else {
                let LayoutEngine {
                    ref mut bubbles,
                    ref mut rng,
                    ref sweep,
                    ..
                } = *self;
                let columns = bubbles.columns_mut();
                for a in 0..sweep.len() {
                    for b in (a + 1)..sweep.len() {
                        if separate_pair(columns, rng, sweep[a], sweep[b], softness, tolerance) {
                            corrections += 1;
                        }
                    }
                }
            }
        }
        corrections
    }

    fn stage_resize(&mut self) {
        let approach = self.config.radius_approach;
        let columns = self.bubbles.columns_mut();
        for i in 0..columns.len() {
            let target = columns.target_radii[i];
            let radius = &mut columns.radii[i];
            *radius += (target - *radius) * approach;
            *radius = radius.max(MIN_RENDER_RADIUS);
        }
    }

    fn stage_contain(&mut self) -> usize {
        let width = self.config.region_width;
        let height = self.config.region_height;
        let restitution = self.config.restitution;
        let columns = self.bubbles.columns_mut();
        let mut clamped = 0usize;
        for i in 0..columns.len() {
            // A body wider than the region pins to the center band.
            let r = columns.radii[i].min(width * 0.5).min(height * 0.5);
            let position = columns.positions[i];
            let velocity = columns.velocities[i];
            let mut next_position = position;
            let mut next_velocity = velocity;
            let mut hit = false;
            if position.x < r {
                next_position.x = r;
                next_velocity.vx = velocity.vx.abs() * restitution;
                hit = true;
            } else if position.x > width - r {
                next_position.x = width - r;
                next_velocity.vx = -velocity.vx.abs() * restitution;
                hit = true;
            }
            if position.y < r {
                next_position.y = r;
                next_velocity.vy = velocity.vy.abs() * restitution;
                hit = true;
            } else if position.y > height - r {
                next_position.y = height - r;
                next_velocity.vy = -velocity.vy.abs() * restitution;
                hit = true;
            }
            if hit {
                columns.positions[i] = next_position;
                columns.velocities[i] = next_velocity;
                clamped += 1;
            }
        }
        clamped
    }

    fn measure_residual(&mut self) -> f32 {
        let n = self.bubbles.len();
        if n < 2 {
            return 0.0;
        }
        let mut max_overlap = 0.0f32;
        if n > self.config.brute_force_threshold && self.refresh_index() {
            let LayoutEngine {
                ref index,
                ref bubbles,
                ref sweep,
                ref sweep_pos,
                ..
            } = *self;
            let columns = bubbles.columns();
            for (k, &i) in sweep.iter().enumerate() {
                index.overlaps_of(i, &mut |j, dist_sq| {
                    if sweep_pos[j] > k {
                        let sum = columns.radii()[i] + columns.radii()[j];
                        let overlap = sum - dist_sq.into_inner().sqrt();
                        if overlap > max_overlap {
                            max_overlap = overlap;
                        }
                    }
                });
            }
        } else {
            let columns = self.bubbles.columns();
            for a in 0..n {
                for b in (a + 1)..n {
                    let sum = columns.radii()[a] + columns.radii()[b];
                    let dist = columns.positions()[a].distance_to(columns.positions()[b]);
                    let overlap = sum - dist;
                    if overlap > max_overlap {
                        max_overlap = overlap;
                    }
                }
            }
        }
        max_overlap.max(0.0)
    }

    fn refresh_index(&mut self) -> bool {
        self.circles.clear();
        let columns = self.bubbles.columns();
        self.circles.extend(
            columns
                .positions()
                .iter()
                .zip(columns.radii())
                .map(|(p, &r)| Circle::new(p.x, p.y, r)),
        );
        match self.index.rebuild(&self.circles) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "proximity index rebuild failed; using brute-force sweep");
                false
            }
        }
    }
}

/// Resolve one overlapping pair by pushing both bodies apart along the line
/// connecting centers, a `softness` fraction of the needed correction.
/// Returns whether a correction was applied.
fn separate_pair(
    columns: &mut BubbleColumns,
    rng: &mut SmallRng,
    i: usize,
    j: usize,
    softness: f32,
    tolerance: f32,
) -> bool {
    let pi = columns.positions[i];
    let pj = columns.positions[j];
    let sum = columns.radii[i] + columns.radii[j];
    let dx = pj.x - pi.x;
    let dy = pj.y - pi.y;
    let dist_sq = dx * dx + dy * dy;
    let threshold = (sum - tolerance).max(0.0);
    if dist_sq >= threshold * threshold {
        return false;
    }
    let dist = dist_sq.sqrt();
    // Coincident centers have no separation direction; nudge along a seeded
    // random one instead of dividing by zero.
    let (ux, uy, overlap) = if dist <= f32::EPSILON {
        let angle = rng.random_range(0.0..TAU);
        (angle.cos(), angle.sin(), sum)
    } else {
        (dx / dist, dy / dist, sum - dist)
    };
    let push = overlap * softness * 0.5;
    columns.positions[i].x -= ux * push;
    columns.positions[i].y -= uy * push;
    columns.positions[j].x += ux * push;
    columns.positions[j].y += uy * push;
    true
}

/// Pick a seed position for a new body: rejection-sample the region for a
/// spot clear of live bodies, accepting the final attempt regardless and
/// letting the resolver converge any residue over subsequent frames.
fn seed_position(
    config: &LayoutConfig,
    rng: &mut SmallRng,
    columns: &BubbleColumns,
    radius: f32,
) -> Position {
    let lo_x = radius.min(config.region_width * 0.5);
    let hi_x = (config.region_width - radius).max(lo_x);
    let lo_y = radius.min(config.region_height * 0.5);
    let hi_y = (config.region_height - radius).max(lo_y);
    let sample = |rng: &mut SmallRng| {
        Position::new(
            if lo_x < hi_x {
                rng.random_range(lo_x..hi_x)
            } else {
                lo_x
            },
            if lo_y < hi_y {
                rng.random_range(lo_y..hi_y)
            } else {
                lo_y
            },
        )
    };
    let mut candidate = sample(rng);
    for _ in 1..config.seed_attempts {
        let clear = columns
            .positions()
            .iter()
            .zip(columns.radii())
            .all(|(p, &r)| p.distance_to(candidate) >= r + radius);
        if clear {
            break;
        }
        candidate = sample(rng);
    }
    candidate
}

/// Small seeded drift so fresh bodies do not sit perfectly still; decays to
/// nothing under damping.
fn drift_velocity(rng: &mut SmallRng) -> Velocity {
    Velocity::new(rng.random_range(-0.5..0.5), rng.random_range(-0.5..0.5))
}
