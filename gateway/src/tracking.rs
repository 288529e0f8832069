//! Tracking engine: the periodic fix loop.
//!
//! One worker ticks at `tracking_hz`. Each tick enumerates tags with fresh
//! samples (plus tags still being reported STALE), snapshots the range cache,
//! resolves anchor positions, runs the trilateration solver, and publishes
//! exactly one position report per tag under `tracking/<tag>/position`. No
//! smoothing happens here beyond the solver's own outlier rejection.
//!
//! Per-tag state machine: first successful fix ⇒ TRACKING; a tick without a
//! fix degrades to STALE while the last fix is younger than the lost timeout,
//! then LOST. A LOST tag stops being re-published until samples reappear.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use uwb_wire::{position_topic, Mac, PositionCm, TagPosition, TagState};

use crate::clock;
use crate::publisher::Publisher;
use crate::range_cache::RangeCache;
use crate::registry::AnchorRegistry;
use crate::settings::Settings;
use crate::trilateration::{solve_3d, SolveOptions};

/// Latest position report per tag, shared with the DMX engine and the
/// readiness checks.
pub type LatestFixes = Arc<RwLock<HashMap<Mac, TagPosition>>>;

#[derive(Debug, Clone, Copy)]
struct LastFix {
    ts_ms: u64,
    position_cm: [f64; 3],
}

pub struct TrackingEngine {
    cache: Arc<RangeCache>,
    registry: Arc<AnchorRegistry>,
    settings: Settings,
    publisher: Arc<dyn Publisher>,
    latest: LatestFixes,
    // Worker-private memory of the last good fix per tag: classification ages
    // and solver warm starts. Plain mutex, never held across an await.
    last_fix: Mutex<HashMap<Mac, LastFix>>,
}

impl TrackingEngine {
    pub fn new(
        cache: Arc<RangeCache>,
        registry: Arc<AnchorRegistry>,
        settings: Settings,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            cache,
            registry,
            settings,
            publisher,
            latest: Arc::new(RwLock::new(HashMap::new())),
            last_fix: Mutex::new(HashMap::new()),
        }
    }

    /// Handle to the latest-fix map for other subsystems.
    pub fn latest(&self) -> LatestFixes {
        self.latest.clone()
    }

    /// One fix attempt for every live tag.
    pub async fn tick(&self, now_ms: u64) {
        let rates = self.settings.rates().await;
        let resid_max_m = self.settings.resid_max_m().await;
        let anchor_positions = self.registry.effective_positions(now_ms).await;
        let corrections = self.registry.range_corrections(now_ms).await;

        let mut tags = self.cache.known_tags(now_ms);
        {
            // tags that dried up but are not LOST yet keep degrading
            let latest = self.latest.read().await;
            for (tag, report) in latest.iter() {
                if report.state != TagState::Lost && !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }
        tags.sort();
        tags.dedup();

        for tag in tags {
            let report = self.fix_tag(
                &tag,
                now_ms,
                rates.stale_timeout_ms,
                rates.lost_timeout_ms,
                resid_max_m,
                &anchor_positions,
                &corrections,
            );
            self.publisher.publish(
                &position_topic(&tag),
                serde_json::to_value(&report).unwrap_or_default(),
            );
            self.latest.write().await.insert(tag, report);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fix_tag(
        &self,
        tag: &Mac,
        now_ms: u64,
        stale_timeout_ms: u64,
        lost_timeout_ms: u64,
        resid_max_m: f64,
        anchor_positions: &HashMap<Mac, [f64; 3]>,
        corrections: &HashMap<Mac, crate::registry::RangeCorrection>,
    ) -> TagPosition {
        let samples = self.cache.snapshot(tag, stale_timeout_ms, now_ms);
        if samples.is_empty() {
            return self.degraded(tag, now_ms, lost_timeout_ms, None);
        }

        let distances_cm: HashMap<Mac, f64> = samples
            .iter()
            .map(|s| {
                let measured_cm = s.d_m * 100.0;
                let corrected_cm = corrections
                    .get(&s.anchor_mac)
                    .map(|c| c.apply_cm(measured_cm))
                    .unwrap_or(measured_cm);
                (s.anchor_mac.clone(), corrected_cm)
            })
            .collect();

        let initial = self
            .last_fix
            .lock()
            .unwrap()
            .get(tag)
            .map(|f| f.position_cm);
        let opts = SolveOptions {
            resid_max_m,
            ..SolveOptions::default()
        };
        let solve = solve_3d(anchor_positions, &distances_cm, initial, &opts);

        match solve.position_cm {
            Some(pos) => {
                self.last_fix.lock().unwrap().insert(
                    tag.clone(),
                    LastFix {
                        ts_ms: now_ms,
                        position_cm: pos,
                    },
                );
                debug!(
                    "fix {tag}: ({:.0}, {:.0}, {:.0}) cm over {} anchors, resid {:.3} m",
                    pos[0],
                    pos[1],
                    pos[2],
                    solve.anchors_used.len(),
                    solve.residual_m
                );
                TagPosition {
                    tag_mac: tag.clone(),
                    state: TagState::Tracking,
                    position_cm: Some(PositionCm {
                        x_cm: pos[0],
                        y_cm: pos[1],
                        z_cm: pos[2],
                    }),
                    anchors_used: solve.anchors_used,
                    residual_m: Some(solve.residual_m),
                    outliers: solve.outliers,
                    reason: None,
                    ts_ms: now_ms,
                }
            }
            None => self.degraded(
                tag,
                now_ms,
                lost_timeout_ms,
                solve.reason.map(|r| r.to_string()),
            ),
        }
    }

    /// STALE while the last good fix is recent, LOST afterwards (or when the
    /// tag never produced one).
    fn degraded(
        &self,
        tag: &Mac,
        now_ms: u64,
        lost_timeout_ms: u64,
        reason: Option<String>,
    ) -> TagPosition {
        let state = match self.last_fix.lock().unwrap().get(tag) {
            Some(last) if now_ms.saturating_sub(last.ts_ms) <= lost_timeout_ms => TagState::Stale,
            _ => TagState::Lost,
        };
        TagPosition {
            tag_mac: tag.clone(),
            state,
            position_cm: None,
            anchors_used: vec![],
            residual_m: None,
            outliers: vec![],
            reason,
            ts_ms: now_ms,
        }
    }

    /// Worker loop. Re-reads the tick rate every pass so settings changes
    /// apply without a restart.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("tracking engine started");
        loop {
            let hz = self.settings.rates().await.tracking_hz.clamp(0.1, 100.0);
            let period = Duration::from_secs_f64(1.0 / hz);
            tokio::select! {
                _ = tokio::time::sleep(period) => self.tick(clock::now_ms()).await,
                _ = shutdown.changed() => break,
            }
        }
        info!("tracking engine stopped");
    }
}
