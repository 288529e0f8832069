//! Calibration: bias snapshots and the multi-point solve.
//!
//! Two operations, both persisted as calibration runs:
//!
//! 1. **Collection run** — over a bounded window, repeatedly snapshot the
//!    range cache for one tag and keep per-anchor distance samples; at the
//!    end write per-anchor median/mean/min/max/count. When the run carries a
//!    venue-point identity (operator-surveyed position), it becomes input to
//!    the solve.
//! 2. **Multi-point solve** — from ≥ `min_points` finished venue-point runs,
//!    fit a linear range correction per anchor by ordinary least squares,
//!    then re-estimate each anchor's position from the corrected distances
//!    (venue points act as the solver's stations) and derive its offset from
//!    base. `apply=false` previews; `apply=true` persists and dispatches the
//!    corrections to the anchors through the publisher.
//!
//! Runs can only start in SETUP; the manager flips the state machine to
//! CALIBRATION for the duration of a collection and back afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use uwb_wire::{command_topic, DeviceCommand, Mac, PositionCm};

use crate::clock;
use crate::events::EventLog;
use crate::publisher::Publisher;
use crate::range_cache::{RangeCache, RangeSample};
use crate::registry::AnchorRegistry;
use crate::state::{StateError, StateManager, SystemState};
use crate::store::{RunResult, RunStatus, Store};
use crate::trilateration::{solve_3d, SolveOptions};

const SAMPLE_INTERVAL_MS: u64 = 50;
const MIN_DURATION_MS: u64 = 100;
const MAX_DURATION_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration already running")]
    AlreadyRunning,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("need at least {need} venue points, got {got}")]
    NotEnoughPoints { need: usize, got: usize },
}

/// Operator-surveyed identity of a collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePoint {
    pub point_id: String,
    pub position_cm: PositionCm,
}

/// Run parameters, stored in the run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(rename = "type")]
    pub kind: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_cm: Option<PositionCm>,
}

/// Per-anchor distance statistics over one collection window, meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorStats {
    pub median_d_m: f64,
    pub mean_d_m: f64,
    pub min_d_m: f64,
    pub max_d_m: f64,
    pub count: usize,
}

/// Run summary, stored in the run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub samples: usize,
    pub anchors_used: Vec<Mac>,
    pub per_anchor: BTreeMap<Mac, AnchorStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_mac: Option<Mac>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
}

struct ActiveRun {
    run_id: i64,
    tag: Mac,
    started_at_ms: u64,
    stop: Arc<AtomicBool>,
}

pub struct CalibrationManager {
    cache: Arc<RangeCache>,
    store: Arc<Store>,
    registry: Arc<AnchorRegistry>,
    state: Arc<StateManager>,
    events: EventLog,
    publisher: Arc<dyn Publisher>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl CalibrationManager {
    pub fn new(
        cache: Arc<RangeCache>,
        store: Arc<Store>,
        registry: Arc<AnchorRegistry>,
        state: Arc<StateManager>,
        events: EventLog,
        publisher: Arc<dyn Publisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            store,
            registry,
            state,
            events,
            publisher,
            active: Arc::new(Mutex::new(None)),
        })
    }

    pub fn status(&self) -> RunStatusView {
        match &*self.active.lock().unwrap() {
            Some(run) => RunStatusView {
                running: true,
                run_id: Some(run.run_id),
                tag_mac: Some(run.tag.clone()),
                started_at_ms: Some(run.started_at_ms),
            },
            None => RunStatusView {
                running: false,
                run_id: None,
                tag_mac: None,
                started_at_ms: None,
            },
        }
    }

    /// Start a collection run. Refused unless the state machine sits in
    /// SETUP and no run is active. The worker task collects until the
    /// (clamped) duration elapses or `abort` is called.
    pub async fn start_run(
        self: &Arc<Self>,
        tag: Mac,
        duration_ms: u64,
        point: Option<VenuePoint>,
    ) -> Result<i64, CalibrationError> {
        let state = self.state.current().await;
        if state != SystemState::Setup {
            return Err(StateError::Blocked {
                action: "calibration_start".to_string(),
                state,
            }
            .into());
        }
        if self.active.lock().unwrap().is_some() {
            return Err(CalibrationError::AlreadyRunning);
        }

        let duration_ms = duration_ms.clamp(MIN_DURATION_MS, MAX_DURATION_MS);
        let params = RunParams {
            kind: if point.is_some() {
                "venue_point".to_string()
            } else {
                "bias_snapshot".to_string()
            },
            duration_ms,
            point_id: point.as_ref().map(|p| p.point_id.clone()),
            position_cm: point.as_ref().map(|p| p.position_cm),
        };

        let started_at_ms = clock::now_ms();
        let run_id = self
            .store
            .create_calibration_run(
                &tag,
                serde_json::to_value(&params).unwrap_or_default(),
                started_at_ms,
            )
            .await;
        self.state.request(SystemState::Calibration).await?;
        self.events
            .calibration_event(
                "calibration_started",
                run_id,
                serde_json::json!({ "tag_mac": tag, "duration_ms": duration_ms }),
            )
            .await;

        let stop = Arc::new(AtomicBool::new(false));
        *self.active.lock().unwrap() = Some(ActiveRun {
            run_id,
            tag: tag.clone(),
            started_at_ms,
            stop: stop.clone(),
        });

        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.collect(run_id, tag, started_at_ms, duration_ms, stop).await;
        });
        Ok(run_id)
    }

    /// Request an abort; the worker notices within one sample interval.
    pub fn abort(&self) -> bool {
        match &*self.active.lock().unwrap() {
            Some(run) => {
                run.stop.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    async fn collect(
        self: Arc<Self>,
        run_id: i64,
        tag: Mac,
        started_at_ms: u64,
        duration_ms: u64,
        stop: Arc<AtomicBool>,
    ) {
        let mut samples: Vec<RangeSample> = Vec::new();
        let mut newest_per_anchor: HashMap<Mac, u64> = HashMap::new();

        loop {
            let now = clock::now_ms();
            if stop.load(Ordering::Relaxed) || now >= started_at_ms + duration_ms {
                break;
            }
            // one sample per anchor per cache refresh: only keep cells whose
            // timestamp advanced since the last pass
            for s in self.cache.snapshot(&tag, duration_ms, now) {
                let advanced = newest_per_anchor
                    .get(&s.anchor_mac)
                    .is_none_or(|prev| s.ts_ms > *prev);
                if advanced {
                    newest_per_anchor.insert(s.anchor_mac.clone(), s.ts_ms);
                    samples.push(s);
                }
            }
            tokio::time::sleep(Duration::from_millis(SAMPLE_INTERVAL_MS)).await;
        }

        let aborted = stop.load(Ordering::Relaxed);
        let summary = summarize(&samples);
        let result = if summary.anchors_used.len() >= 2 {
            RunResult::Ok
        } else {
            RunResult::Failed
        };
        let ended = clock::now_ms();
        let summary_json = serde_json::to_value(&summary).unwrap_or_default();

        if aborted {
            self.store
                .abort_calibration_run(run_id, summary_json, ended)
                .await;
            self.events
                .calibration_event(
                    "calibration_aborted",
                    run_id,
                    serde_json::json!({ "tag_mac": tag, "samples": summary.samples }),
                )
                .await;
        } else {
            self.store
                .finish_calibration_run(run_id, result, summary_json, ended)
                .await;
            self.events
                .calibration_event(
                    "calibration_finished",
                    run_id,
                    serde_json::json!({
                        "tag_mac": tag,
                        "samples": summary.samples,
                        "anchors": summary.anchors_used.len(),
                        "result": result,
                    }),
                )
                .await;
        }

        *self.active.lock().unwrap() = None;
        if let Err(e) = self.state.request(SystemState::Setup).await {
            warn!("calibration: could not return to SETUP: {e}");
        }
        info!(
            "calibration run {run_id} {} with {} samples",
            if aborted { "aborted" } else { "finished" },
            summary.samples
        );
    }

    // ── Multi-point solve ─────────────────────────────────────────────────────

    pub async fn solve(
        &self,
        tag: &Mac,
        min_points: usize,
        apply: bool,
    ) -> Result<SolveReport, CalibrationError> {
        let state = self.state.current().await;
        if state == SystemState::Live {
            return Err(StateError::Blocked {
                action: "calibration_solve".to_string(),
                state,
            }
            .into());
        }

        let points = self.venue_points(tag).await;
        if points.len() < min_points {
            return Err(CalibrationError::NotEnoughPoints {
                need: min_points,
                got: points.len(),
            });
        }

        let base_positions = self.store.anchor_positions().await;
        let offsets = self.store.anchor_offsets().await;
        let current_positions: BTreeMap<Mac, [f64; 3]> = base_positions
            .iter()
            .map(|(mac, pos)| {
                let off = offsets.get(mac).copied().unwrap_or([0.0; 3]);
                (
                    mac.clone(),
                    [pos[0] + off[0], pos[1] + off[1], pos[2] + off[2]],
                )
            })
            .collect();

        let point_positions: HashMap<String, [f64; 3]> = points
            .iter()
            .map(|(id, p)| (id.clone(), [p.position_cm.x_cm, p.position_cm.y_cm, p.position_cm.z_cm]))
            .collect();

        // per-anchor: point → measured distance (cm)
        let mut anchor_samples: BTreeMap<Mac, Vec<(String, f64, i64)>> = BTreeMap::new();
        for (point_id, point) in &points {
            for (anchor, stats) in &point.summary.per_anchor {
                anchor_samples.entry(anchor.clone()).or_default().push((
                    point_id.clone(),
                    stats.median_d_m * 100.0,
                    point.run_id,
                ));
            }
        }

        let mut range_corrections = BTreeMap::new();
        for (anchor, samples) in &anchor_samples {
            let Some(current) = current_positions.get(anchor) else {
                continue;
            };
            if samples.len() < 2 {
                continue;
            }
            let pairs: Vec<(f64, f64)> = samples
                .iter()
                .map(|(point_id, meas_cm, _)| {
                    (*meas_cm, dist_cm(current, &point_positions[point_id]))
                })
                .collect();
            let (mut scale, offset_cm, rms_cm) = fit_linear(&pairs);
            if scale <= 0.0 {
                scale = 1.0;
            }
            range_corrections.insert(
                anchor.clone(),
                RangeCorrectionFit {
                    range_scale: scale,
                    range_offset_cm: offset_cm,
                    rms_cm,
                    points_used: samples.iter().map(|(id, _, _)| id.clone()).collect(),
                },
            );
        }

        let mut anchor_offsets = BTreeMap::new();
        for (anchor, samples) in &anchor_samples {
            let Some(base) = base_positions.get(anchor) else {
                continue;
            };
            let Some(corr) = range_corrections.get(anchor) else {
                continue;
            };
            let mut distances: HashMap<String, f64> = HashMap::new();
            let mut newest_run = i64::MIN;
            for (point_id, meas_cm, run_id) in samples {
                let corrected = corr.range_scale * meas_cm + corr.range_offset_cm;
                if corrected > 0.0 {
                    distances.insert(point_id.clone(), corrected);
                    newest_run = newest_run.max(*run_id);
                }
            }
            if distances.len() < min_points {
                continue;
            }
            let initial = current_positions.get(anchor).copied();
            let solve = solve_3d(&point_positions, &distances, initial, &SolveOptions::default());
            let Some(pos) = solve.position_cm else {
                continue;
            };
            anchor_offsets.insert(
                anchor.clone(),
                AnchorOffsetFit {
                    offset_cm: [pos[0] - base[0], pos[1] - base[1], pos[2] - base[2]],
                    position_cm: pos,
                    resid_m: solve.residual_m,
                    points_used: {
                        let mut ids: Vec<String> = distances.into_keys().collect();
                        ids.sort();
                        ids
                    },
                    source_run_id: newest_run,
                },
            );
        }

        let mut applied = Applied::default();
        if apply {
            let now = clock::now_ms();
            for (anchor, corr) in &range_corrections {
                self.store
                    .set_device_setting(anchor, "range_scale", &corr.range_scale.to_string())
                    .await;
                self.store
                    .set_device_setting(
                        anchor,
                        "range_offset_cm",
                        &corr.range_offset_cm.to_string(),
                    )
                    .await;
                applied.range_settings += 1;

                let mut settings = serde_json::Map::new();
                settings.insert("range_scale".to_string(), corr.range_scale.into());
                settings.insert("range_offset_cm".to_string(), corr.range_offset_cm.into());
                let cmd = DeviceCommand::apply_settings(format!("cal-{}", Uuid::new_v4()), settings);
                self.publisher.publish(
                    &command_topic(anchor),
                    serde_json::to_value(&cmd).unwrap_or_default(),
                );
                applied.commands_published += 1;
            }
            for (anchor, fit) in &anchor_offsets {
                self.store
                    .set_anchor_offset(anchor, fit.offset_cm, Some(fit.source_run_id), now)
                    .await;
                applied.anchor_offsets += 1;
            }
            // effective positions changed, drop the cached read
            self.registry.invalidate().await;
            self.events
                .calibration_event(
                    "calibration_applied",
                    0,
                    serde_json::json!({
                        "tag_mac": tag,
                        "range_settings": applied.range_settings,
                        "anchor_offsets": applied.anchor_offsets,
                    }),
                )
                .await;
        }

        Ok(SolveReport {
            tag_mac: tag.clone(),
            points_used: points
                .iter()
                .map(|(id, p)| (id.clone(), p.position_cm))
                .collect(),
            range_corrections,
            anchor_offsets,
            applied,
        })
    }

    /// Finished venue-point runs for a tag, deduplicated by point id keeping
    /// the newest.
    async fn venue_points(&self, tag: &Mac) -> BTreeMap<String, VenuePointRun> {
        let mut points = BTreeMap::new();
        for run in self.store.list_calibration_runs(Some(tag)).await {
            if run.status != RunStatus::Finished {
                continue;
            }
            let Ok(params) = serde_json::from_value::<RunParams>(run.params.clone()) else {
                continue;
            };
            if params.kind != "venue_point" {
                continue;
            }
            let (Some(point_id), Some(position_cm)) = (params.point_id, params.position_cm) else {
                continue;
            };
            let Ok(summary) = serde_json::from_value::<RunSummary>(run.summary.clone()) else {
                continue;
            };
            // newest-first iteration: the first run per point wins
            points.entry(point_id).or_insert(VenuePointRun {
                run_id: run.id,
                position_cm,
                summary,
            });
        }
        points
    }
}

struct VenuePointRun {
    run_id: i64,
    position_cm: PositionCm,
    summary: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeCorrectionFit {
    pub range_scale: f64,
    pub range_offset_cm: f64,
    pub rms_cm: f64,
    pub points_used: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnchorOffsetFit {
    pub offset_cm: [f64; 3],
    pub position_cm: [f64; 3],
    pub resid_m: f64,
    pub points_used: Vec<String>,
    pub source_run_id: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Applied {
    pub range_settings: usize,
    pub anchor_offsets: usize,
    pub commands_published: usize,
}

/// The preview/apply response for the multi-point solve.
#[derive(Debug, Clone, Serialize)]
pub struct SolveReport {
    pub tag_mac: Mac,
    pub points_used: BTreeMap<String, PositionCm>,
    pub range_corrections: BTreeMap<Mac, RangeCorrectionFit>,
    pub anchor_offsets: BTreeMap<Mac, AnchorOffsetFit>,
    pub applied: Applied,
}

fn summarize(samples: &[RangeSample]) -> RunSummary {
    let mut per_anchor_values: BTreeMap<Mac, Vec<f64>> = BTreeMap::new();
    for s in samples {
        per_anchor_values
            .entry(s.anchor_mac.clone())
            .or_default()
            .push(s.d_m);
    }
    let per_anchor: BTreeMap<Mac, AnchorStats> = per_anchor_values
        .into_iter()
        .map(|(anchor, mut values)| {
            values.sort_by(f64::total_cmp);
            let count = values.len();
            let stats = AnchorStats {
                median_d_m: values[count / 2],
                mean_d_m: values.iter().sum::<f64>() / count as f64,
                min_d_m: values[0],
                max_d_m: values[count - 1],
                count,
            };
            (anchor, stats)
        })
        .collect();
    RunSummary {
        samples: samples.len(),
        anchors_used: per_anchor.keys().cloned().collect(),
        per_anchor,
    }
}

/// Ordinary least squares for `y = scale * x + offset`. A single pair fixes
/// scale to 1; a degenerate spread falls back to a pure offset.
fn fit_linear(pairs: &[(f64, f64)]) -> (f64, f64, f64) {
    let n = pairs.len() as f64;
    if pairs.is_empty() {
        return (1.0, 0.0, 0.0);
    }
    let (scale, offset) = if pairs.len() == 1 {
        (1.0, pairs[0].1 - pairs[0].0)
    } else {
        let sx: f64 = pairs.iter().map(|(x, _)| x).sum();
        let sy: f64 = pairs.iter().map(|(_, y)| y).sum();
        let sxx: f64 = pairs.iter().map(|(x, _)| x * x).sum();
        let sxy: f64 = pairs.iter().map(|(x, y)| x * y).sum();
        let denom = n * sxx - sx * sx;
        if denom.abs() < 1e-9 {
            (1.0, pairs.iter().map(|(x, y)| y - x).sum::<f64>() / n)
        } else {
            let scale = (n * sxy - sx * sy) / denom;
            (scale, (sy - scale * sx) / n)
        }
    };
    let rms = (pairs
        .iter()
        .map(|(x, y)| {
            let err = scale * x + offset - y;
            err * err
        })
        .sum::<f64>()
        / n)
        .sqrt();
    (scale, offset, rms)
}

fn dist_cm(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RecordingPublisher;
    use crate::settings::Settings;
    use crate::tracking::TrackingEngine;
    use uwb_wire::{RangeBatch, RangeEntry};

    fn mac(s: &str) -> Mac {
        Mac::parse(s).unwrap()
    }

    struct Rig {
        cache: Arc<RangeCache>,
        store: Arc<Store>,
        state: Arc<StateManager>,
        publisher: Arc<RecordingPublisher>,
        manager: Arc<CalibrationManager>,
    }

    fn rig() -> Rig {
        let store = Store::in_memory();
        let cache = Arc::new(RangeCache::new(60_000));
        let registry = Arc::new(AnchorRegistry::new(store.clone()));
        let tracking = TrackingEngine::new(
            cache.clone(),
            registry.clone(),
            Settings::new(store.clone()),
            Arc::new(crate::publisher::NoopPublisher),
        );
        let state = Arc::new(StateManager::new(
            store.clone(),
            registry.clone(),
            EventLog::new(None),
            tracking.latest(),
        ));
        let publisher = Arc::new(RecordingPublisher::new());
        let manager = CalibrationManager::new(
            cache.clone(),
            store.clone(),
            registry,
            state.clone(),
            EventLog::new(None),
            publisher.clone(),
        );
        Rig {
            cache,
            store,
            state,
            publisher,
            manager,
        }
    }

    fn feed(cache: &RangeCache, anchor: &Mac, tag: &Mac, d_m: f64, ts: u64) {
        cache.ingest(
            &RangeBatch {
                anchor_mac: anchor.clone(),
                ts_ms: ts,
                ranges: vec![RangeEntry {
                    tag_mac: Some(tag.to_string()),
                    d_m: Some(d_m),
                    distance_mm: None,
                    q: None,
                    ts_ms: None,
                }],
            },
            ts,
        );
    }

    #[tokio::test]
    async fn collection_run_produces_stats_and_returns_to_setup() {
        let rig = rig();
        let tag = mac("112233445501");
        let a1 = mac("aabbccddee01");
        let a2 = mac("aabbccddee02");
        let now = clock::now_ms();
        feed(&rig.cache, &a1, &tag, 2.0, now);
        feed(&rig.cache, &a2, &tag, 3.0, now);

        let run_id = rig
            .manager
            .start_run(tag.clone(), 200, None)
            .await
            .unwrap();
        assert_eq!(rig.state.current().await, SystemState::Calibration);
        assert!(rig.manager.status().running);

        // feed a second, newer sample for a1 mid-run
        tokio::time::sleep(Duration::from_millis(80)).await;
        feed(&rig.cache, &a1, &tag, 2.2, clock::now_ms());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let run = rig.store.get_calibration_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.result, Some(RunResult::Ok));
        let summary: RunSummary = serde_json::from_value(run.summary).unwrap();
        assert_eq!(summary.anchors_used.len(), 2);
        assert_eq!(summary.per_anchor[&a1].count, 2);
        assert_eq!(summary.per_anchor[&a1].min_d_m, 2.0);
        assert_eq!(summary.per_anchor[&a1].max_d_m, 2.2);
        assert_eq!(summary.per_anchor[&a2].count, 1);

        assert_eq!(rig.state.current().await, SystemState::Setup);
        assert!(!rig.manager.status().running);
    }

    #[tokio::test]
    async fn single_anchor_run_fails() {
        let rig = rig();
        let tag = mac("112233445501");
        feed(&rig.cache, &mac("aabbccddee01"), &tag, 2.0, clock::now_ms());

        let run_id = rig.manager.start_run(tag, 150, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let run = rig.store.get_calibration_run(run_id).await.unwrap();
        assert_eq!(run.result, Some(RunResult::Failed));
    }

    #[tokio::test]
    async fn concurrent_start_is_refused_and_abort_finalizes() {
        let rig = rig();
        let tag = mac("112233445501");
        let run_id = rig
            .manager
            .start_run(tag.clone(), 10_000, None)
            .await
            .unwrap();

        // second start refused: state is CALIBRATION now
        let err = rig.manager.start_run(tag.clone(), 200, None).await;
        assert!(matches!(err, Err(CalibrationError::State(_))));

        assert!(rig.manager.abort());
        tokio::time::sleep(Duration::from_millis(200)).await;
        let run = rig.store.get_calibration_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.result, Some(RunResult::Aborted));
        assert_eq!(rig.state.current().await, SystemState::Setup);
    }

    #[tokio::test]
    async fn start_refused_outside_setup() {
        let rig = rig();
        rig.state.force_safe("test").await;
        let err = rig
            .manager
            .start_run(mac("112233445501"), 200, None)
            .await;
        assert!(matches!(err, Err(CalibrationError::State(_))));
    }

    // ── Solve ────────────────────────────────────────────────────────────────

    /// Venue points spread around the origin; chosen so direction is
    /// uncorrelated with range, which keeps the OLS fit well behaved.
    fn venue_points() -> Vec<(&'static str, [f64; 3])> {
        vec![
            ("p1", [900.0, 0.0, 0.0]),
            ("p2", [-900.0, 0.0, 0.0]),
            ("p3", [300.0, 0.0, 0.0]),
            ("p4", [-300.0, 0.0, 0.0]),
            ("p5", [0.0, 600.0, 0.0]),
            ("p6", [0.0, 0.0, 600.0]),
        ]
    }

    async fn insert_venue_run(
        store: &Store,
        tag: &Mac,
        point_id: &str,
        position: [f64; 3],
        measured_cm_by_anchor: &[(Mac, f64)],
        ts: u64,
    ) -> i64 {
        let params = RunParams {
            kind: "venue_point".to_string(),
            duration_ms: 1_000,
            point_id: Some(point_id.to_string()),
            position_cm: Some(PositionCm {
                x_cm: position[0],
                y_cm: position[1],
                z_cm: position[2],
            }),
        };
        let per_anchor: BTreeMap<Mac, AnchorStats> = measured_cm_by_anchor
            .iter()
            .map(|(anchor, meas_cm)| {
                let d_m = meas_cm / 100.0;
                (
                    anchor.clone(),
                    AnchorStats {
                        median_d_m: d_m,
                        mean_d_m: d_m,
                        min_d_m: d_m,
                        max_d_m: d_m,
                        count: 20,
                    },
                )
            })
            .collect();
        let summary = RunSummary {
            samples: per_anchor.len() * 20,
            anchors_used: per_anchor.keys().cloned().collect(),
            per_anchor,
        };
        let id = store
            .create_calibration_run(tag, serde_json::to_value(&params).unwrap(), ts)
            .await;
        store
            .finish_calibration_run(id, RunResult::Ok, serde_json::to_value(&summary).unwrap(), ts)
            .await;
        id
    }

    #[tokio::test]
    async fn solve_recovers_linear_range_distortion() {
        let rig = rig();
        let tag = mac("112233445501");
        let anchor = mac("aabbccddee01");
        rig.store
            .set_anchor_position(&anchor, [0.0, 0.0, 0.0], 1)
            .await;

        // anchor reports meas = 1.25 * true − 40 (cm); the inverse correction
        // is true = 0.8 * meas + 32
        for (i, (id, pos)) in venue_points().into_iter().enumerate() {
            let true_cm = dist_cm(&[0.0, 0.0, 0.0], &pos);
            let meas_cm = 1.25 * true_cm - 40.0;
            insert_venue_run(
                &rig.store,
                &tag,
                id,
                pos,
                &[(anchor.clone(), meas_cm)],
                1_000 + i as u64,
            )
            .await;
        }

        let report = rig.manager.solve(&tag, 4, false).await.unwrap();
        let corr = &report.range_corrections[&anchor];
        assert!((corr.range_scale - 0.8).abs() < 1e-9);
        assert!((corr.range_offset_cm - 32.0).abs() < 1e-6);
        assert!(corr.rms_cm < 1e-6);

        // corrected distances are exact, so the re-solved position is the base
        let fit = &report.anchor_offsets[&anchor];
        for axis in fit.offset_cm {
            assert!(axis.abs() < 0.5, "offset {:?}", fit.offset_cm);
        }
        // preview: nothing persisted, nothing published
        assert!(rig.store.device_settings(&anchor).await.is_empty());
        assert!(rig.store.anchor_offsets().await.is_empty());
        assert!(rig.publisher.take().is_empty());
    }

    #[tokio::test]
    async fn solve_recovers_displaced_anchor_position() {
        let rig = rig();
        let tag = mac("112233445501");
        let anchor = mac("aabbccddee01");
        // operator entered the origin, but the anchor really hangs at +60 cm x
        rig.store
            .set_anchor_position(&anchor, [0.0, 0.0, 0.0], 1)
            .await;
        let truth = [60.0, 0.0, 0.0];

        for (i, (id, pos)) in venue_points().into_iter().enumerate() {
            let meas_cm = dist_cm(&truth, &pos);
            insert_venue_run(
                &rig.store,
                &tag,
                id,
                pos,
                &[(anchor.clone(), meas_cm)],
                1_000 + i as u64,
            )
            .await;
        }

        let report = rig.manager.solve(&tag, 4, true).await.unwrap();
        let fit = &report.anchor_offsets[&anchor];
        assert!(
            (fit.offset_cm[0] - 60.0).abs() < 5.0,
            "offset {:?}",
            fit.offset_cm
        );
        assert!(fit.offset_cm[1].abs() < 5.0);
        assert!(fit.offset_cm[2].abs() < 5.0);

        // applied: offsets persisted, device settings written, command sent
        assert_eq!(report.applied.anchor_offsets, 1);
        assert_eq!(report.applied.range_settings, 1);
        let offsets = rig.store.anchor_offsets().await;
        assert!((offsets[&anchor][0] - fit.offset_cm[0]).abs() < 1e-9);
        let dev = rig.store.device_settings(&anchor).await;
        assert!(dev.contains_key("range_scale"));
        assert!(dev.contains_key("range_offset_cm"));

        let messages = rig.publisher.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, format!("dev/{anchor}/cmd"));
        assert_eq!(messages[0].payload["cmd"], "apply_settings");
        assert!(messages[0].payload["settings"]["range_scale"].is_number());
    }

    #[tokio::test]
    async fn solve_needs_enough_distinct_points() {
        let rig = rig();
        let tag = mac("112233445501");
        let anchor = mac("aabbccddee01");
        rig.store
            .set_anchor_position(&anchor, [0.0, 0.0, 0.0], 1)
            .await;

        // three distinct points, one of them re-measured: still only three
        for (i, (id, pos)) in venue_points().into_iter().take(3).enumerate() {
            let meas = dist_cm(&[0.0, 0.0, 0.0], &pos);
            insert_venue_run(&rig.store, &tag, id, pos, &[(anchor.clone(), meas)], 1_000 + i as u64)
                .await;
        }
        insert_venue_run(
            &rig.store,
            &tag,
            "p1",
            [900.0, 0.0, 0.0],
            &[(anchor.clone(), 901.0)],
            2_000,
        )
        .await;

        let err = rig.manager.solve(&tag, 4, false).await;
        assert!(matches!(
            err,
            Err(CalibrationError::NotEnoughPoints { need: 4, got: 3 })
        ));
    }

    #[tokio::test]
    async fn newest_run_wins_per_point() {
        let rig = rig();
        let tag = mac("112233445501");
        let anchor = mac("aabbccddee01");
        rig.store
            .set_anchor_position(&anchor, [0.0, 0.0, 0.0], 1)
            .await;

        for (i, (id, pos)) in venue_points().into_iter().enumerate() {
            let meas = dist_cm(&[0.0, 0.0, 0.0], &pos);
            insert_venue_run(&rig.store, &tag, id, pos, &[(anchor.clone(), meas)], 1_000 + i as u64)
                .await;
        }
        // stale re-measurement of p1 with garbage, older timestamp loses
        insert_venue_run(
            &rig.store,
            &tag,
            "p1",
            [900.0, 0.0, 0.0],
            &[(anchor.clone(), 5_000.0)],
            10, // much older than the good run
        )
        .await;

        let report = rig.manager.solve(&tag, 4, false).await.unwrap();
        let corr = &report.range_corrections[&anchor];
        assert!((corr.range_scale - 1.0).abs() < 1e-6);
        assert!(corr.rms_cm < 1e-6);
    }
}
