//! Persistence: the gateway's durable rows behind one async store.
//!
//! Everything lives in memory behind a `RwLock` and is mirrored to a single
//! JSON snapshot file after each mutation. Load failures fall back to an
//! empty store with a warning; save failures are logged and never poison the
//! workers, which keep running on the in-memory copy.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use uwb_wire::Mac;

use crate::dmx::frame::FixtureProfile;

// ── Rows ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceRole {
    Anchor,
    Tag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DeviceRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub first_seen_at_ms: u64,
    pub last_seen_at_ms: u64,
}

/// Operator-entered base position of an anchor, centimeters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnchorPosition {
    pub x_cm: f64,
    pub y_cm: f64,
    pub z_cm: f64,
    pub updated_at_ms: u64,
}

/// Calibration-derived correction added to an anchor's base position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnchorOffset {
    pub dx_cm: f64,
    pub dy_cm: f64,
    pub dz_cm: f64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_run_id: Option<i64>,
}

fn default_slew() -> f64 {
    180.0
}

fn default_true() -> bool {
    true
}

/// One moving-head fixture patched into a universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i64,
    pub name: String,
    pub profile_key: String,
    #[serde(default)]
    pub universe: u16,
    pub dmx_base_addr: u16,
    #[serde(default)]
    pub pos_x_cm: f64,
    #[serde(default)]
    pub pos_y_cm: f64,
    #[serde(default)]
    pub pos_z_cm: f64,
    pub pan_min_deg: f64,
    pub pan_max_deg: f64,
    pub tilt_min_deg: f64,
    pub tilt_max_deg: f64,
    #[serde(default)]
    pub pan_zero_deg: f64,
    #[serde(default)]
    pub tilt_zero_deg: f64,
    #[serde(default)]
    pub pan_offset_deg: f64,
    #[serde(default)]
    pub tilt_offset_deg: f64,
    #[serde(default)]
    pub invert_pan: bool,
    #[serde(default)]
    pub invert_tilt: bool,
    #[serde(default = "default_slew")]
    pub slew_pan_deg_s: f64,
    #[serde(default = "default_slew")]
    pub slew_tilt_deg_s: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            profile_key: String::new(),
            universe: 0,
            dmx_base_addr: 1,
            pos_x_cm: 0.0,
            pos_y_cm: 0.0,
            pos_z_cm: 0.0,
            pan_min_deg: -180.0,
            pan_max_deg: 180.0,
            tilt_min_deg: -90.0,
            tilt_max_deg: 90.0,
            pan_zero_deg: 0.0,
            tilt_zero_deg: 0.0,
            pan_offset_deg: 0.0,
            tilt_offset_deg: 0.0,
            invert_pan: false,
            invert_tilt: false,
            slew_pan_deg_s: 180.0,
            slew_tilt_deg_s: 180.0,
            enabled: true,
            updated_at_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureProfileRow {
    pub profile: FixtureProfile,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Aborted,
    Committed,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    Ok,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRun {
    pub id: i64,
    pub tag_mac: Mac,
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub summary: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated_at_ms: Option<u64>,
}

impl CalibrationRun {
    /// An OK run that has not been invalidated by a later anchor move and
    /// that the operator has not discarded.
    pub fn is_valid(&self) -> bool {
        self.result == Some(RunResult::Ok)
            && self.invalidated_at_ms.is_none()
            && self.status != RunStatus::Discarded
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    settings: BTreeMap<String, SettingRow>,
    #[serde(default)]
    devices: BTreeMap<Mac, DeviceRow>,
    #[serde(default)]
    anchor_positions: BTreeMap<Mac, AnchorPosition>,
    #[serde(default)]
    anchor_offsets: BTreeMap<Mac, AnchorOffset>,
    #[serde(default)]
    fixtures: BTreeMap<i64, Fixture>,
    #[serde(default)]
    fixture_profiles: BTreeMap<String, FixtureProfileRow>,
    #[serde(default)]
    device_settings: BTreeMap<Mac, BTreeMap<String, String>>,
    #[serde(default)]
    calibration_runs: BTreeMap<i64, CalibrationRun>,
    #[serde(default)]
    next_fixture_id: i64,
    #[serde(default)]
    next_run_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingRow {
    pub value: String,
    pub updated_at_ms: u64,
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct Store {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

impl Store {
    /// Volatile store, used by tests and the simulator harness.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        })
    }

    /// Open a snapshot-backed store. A missing file starts empty; a corrupt
    /// file is reported and replaced on the next write.
    pub async fn open(path: impl AsRef<Path>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<StoreData>(&raw) {
                Ok(data) => {
                    info!(
                        "loaded store from {} ({} devices, {} fixtures, {} runs)",
                        path.display(),
                        data.devices.len(),
                        data.fixtures.len(),
                        data.calibration_runs.len()
                    );
                    data
                }
                Err(e) => {
                    warn!("failed to parse {}: {e}, starting empty", path.display());
                    StoreData::default()
                }
            },
            Err(_) => {
                info!("no store snapshot at {}, starting empty", path.display());
                StoreData::default()
            }
        };
        Arc::new(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    async fn persist(&self) {
        if let Err(e) = self.try_persist().await {
            warn!("store: snapshot write failed: {e:#}");
        }
    }

    async fn try_persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let data = self.data.read().await;
            serde_json::to_string_pretty(&*data)?
        };
        fs::write(path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Option<String> {
        self.data
            .read()
            .await
            .settings
            .get(key)
            .map(|row| row.value.clone())
    }

    pub async fn set_setting(&self, key: &str, value: &str, now_ms: u64) {
        {
            let mut data = self.data.write().await;
            data.settings.insert(
                key.to_string(),
                SettingRow {
                    value: value.to_string(),
                    updated_at_ms: now_ms,
                },
            );
        }
        self.persist().await;
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    /// Create-on-first-seen device upkeep. The role is only set when the row
    /// has none yet, so an operator reassignment is not overwritten by traffic.
    /// Pure last-seen advances are snapshotted at most once a second; the
    /// in-memory row is always current.
    pub async fn device_seen(&self, mac: &Mac, role: DeviceRole, now_ms: u64) {
        let should_persist = {
            let mut data = self.data.write().await;
            let created = !data.devices.contains_key(mac);
            let row = data.devices.entry(mac.clone()).or_insert(DeviceRow {
                role: Some(role),
                alias: None,
                status: None,
                first_seen_at_ms: now_ms,
                last_seen_at_ms: 0,
            });
            let jump = now_ms.saturating_sub(row.last_seen_at_ms) > 1_000;
            row.last_seen_at_ms = row.last_seen_at_ms.max(now_ms);
            let came_online = row.status.as_deref() != Some("ONLINE");
            row.status = Some("ONLINE".to_string());
            if row.role.is_none() {
                row.role = Some(role);
            }
            created || jump || came_online
        };
        if should_persist {
            self.persist().await;
        }
    }

    pub async fn list_devices(&self) -> Vec<(Mac, DeviceRow)> {
        self.data
            .read()
            .await
            .devices
            .iter()
            .map(|(mac, row)| (mac.clone(), row.clone()))
            .collect()
    }

    pub async fn devices_last_seen(&self) -> HashMap<Mac, u64> {
        self.data
            .read()
            .await
            .devices
            .iter()
            .map(|(mac, row)| (mac.clone(), row.last_seen_at_ms))
            .collect()
    }

    /// Delete a device and everything hanging off it: device settings, anchor
    /// position and offset rows.
    pub async fn delete_device(&self, mac: &Mac) -> bool {
        let removed = {
            let mut data = self.data.write().await;
            let removed = data.devices.remove(mac).is_some();
            data.device_settings.remove(mac);
            data.anchor_positions.remove(mac);
            data.anchor_offsets.remove(mac);
            removed
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    // ── Anchor positions & offsets ────────────────────────────────────────────

    pub async fn anchor_positions(&self) -> BTreeMap<Mac, [f64; 3]> {
        self.data
            .read()
            .await
            .anchor_positions
            .iter()
            .map(|(mac, p)| (mac.clone(), [p.x_cm, p.y_cm, p.z_cm]))
            .collect()
    }

    pub async fn set_anchor_position(&self, mac: &Mac, pos_cm: [f64; 3], now_ms: u64) {
        {
            let mut data = self.data.write().await;
            data.anchor_positions.insert(
                mac.clone(),
                AnchorPosition {
                    x_cm: pos_cm[0],
                    y_cm: pos_cm[1],
                    z_cm: pos_cm[2],
                    updated_at_ms: now_ms,
                },
            );
        }
        self.persist().await;
    }

    pub async fn anchor_offsets(&self) -> BTreeMap<Mac, [f64; 3]> {
        self.data
            .read()
            .await
            .anchor_offsets
            .iter()
            .map(|(mac, o)| (mac.clone(), [o.dx_cm, o.dy_cm, o.dz_cm]))
            .collect()
    }

    pub async fn set_anchor_offset(
        &self,
        mac: &Mac,
        offset_cm: [f64; 3],
        source_run_id: Option<i64>,
        now_ms: u64,
    ) {
        {
            let mut data = self.data.write().await;
            data.anchor_offsets.insert(
                mac.clone(),
                AnchorOffset {
                    dx_cm: offset_cm[0],
                    dy_cm: offset_cm[1],
                    dz_cm: offset_cm[2],
                    updated_at_ms: now_ms,
                    source_run_id,
                },
            );
        }
        self.persist().await;
    }

    // ── Fixtures & profiles ───────────────────────────────────────────────────

    pub async fn add_fixture(&self, mut fixture: Fixture, now_ms: u64) -> i64 {
        let id = {
            let mut data = self.data.write().await;
            data.next_fixture_id += 1;
            let id = data.next_fixture_id;
            fixture.id = id;
            fixture.updated_at_ms = now_ms;
            data.fixtures.insert(id, fixture);
            id
        };
        self.persist().await;
        id
    }

    pub async fn update_fixture(&self, mut fixture: Fixture, now_ms: u64) -> bool {
        let updated = {
            let mut data = self.data.write().await;
            match data.fixtures.get_mut(&fixture.id) {
                Some(slot) => {
                    fixture.updated_at_ms = now_ms;
                    *slot = fixture;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await;
        }
        updated
    }

    pub async fn delete_fixture(&self, id: i64) -> bool {
        let removed = {
            let mut data = self.data.write().await;
            data.fixtures.remove(&id).is_some()
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    pub async fn get_fixture(&self, id: i64) -> Option<Fixture> {
        self.data.read().await.fixtures.get(&id).cloned()
    }

    pub async fn list_fixtures(&self) -> Vec<Fixture> {
        self.data.read().await.fixtures.values().cloned().collect()
    }

    pub async fn upsert_profile(&self, key: &str, profile: FixtureProfile, now_ms: u64) {
        {
            let mut data = self.data.write().await;
            data.fixture_profiles.insert(
                key.to_string(),
                FixtureProfileRow {
                    profile,
                    updated_at_ms: now_ms,
                },
            );
        }
        self.persist().await;
    }

    pub async fn profiles(&self) -> BTreeMap<String, FixtureProfile> {
        self.data
            .read()
            .await
            .fixture_profiles
            .iter()
            .map(|(k, row)| (k.clone(), row.profile.clone()))
            .collect()
    }

    // ── Device settings ───────────────────────────────────────────────────────

    pub async fn set_device_setting(&self, mac: &Mac, key: &str, value: &str) {
        {
            let mut data = self.data.write().await;
            data.device_settings
                .entry(mac.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        self.persist().await;
    }

    pub async fn device_settings(&self, mac: &Mac) -> BTreeMap<String, String> {
        self.data
            .read()
            .await
            .device_settings
            .get(mac)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all_device_settings(&self) -> BTreeMap<Mac, BTreeMap<String, String>> {
        self.data.read().await.device_settings.clone()
    }

    // ── Calibration runs ──────────────────────────────────────────────────────

    pub async fn create_calibration_run(
        &self,
        tag_mac: &Mac,
        params: serde_json::Value,
        now_ms: u64,
    ) -> i64 {
        let id = {
            let mut data = self.data.write().await;
            data.next_run_id += 1;
            let id = data.next_run_id;
            data.calibration_runs.insert(
                id,
                CalibrationRun {
                    id,
                    tag_mac: tag_mac.clone(),
                    started_at_ms: now_ms,
                    ended_at_ms: None,
                    status: RunStatus::Running,
                    result: None,
                    params,
                    summary: serde_json::Value::Null,
                    invalidated_at_ms: None,
                },
            );
            id
        };
        self.persist().await;
        id
    }

    pub async fn finish_calibration_run(
        &self,
        id: i64,
        result: RunResult,
        summary: serde_json::Value,
        now_ms: u64,
    ) {
        {
            let mut data = self.data.write().await;
            if let Some(run) = data.calibration_runs.get_mut(&id) {
                run.status = RunStatus::Finished;
                run.result = Some(result);
                run.summary = summary;
                run.ended_at_ms = Some(now_ms);
            }
        }
        self.persist().await;
    }

    pub async fn abort_calibration_run(&self, id: i64, summary: serde_json::Value, now_ms: u64) {
        {
            let mut data = self.data.write().await;
            if let Some(run) = data.calibration_runs.get_mut(&id) {
                run.status = RunStatus::Aborted;
                run.result = Some(RunResult::Aborted);
                run.summary = summary;
                run.ended_at_ms = Some(now_ms);
            }
        }
        self.persist().await;
    }

    pub async fn set_run_status(&self, id: i64, status: RunStatus) -> bool {
        let updated = {
            let mut data = self.data.write().await;
            match data.calibration_runs.get_mut(&id) {
                Some(run) => {
                    run.status = status;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await;
        }
        updated
    }

    pub async fn get_calibration_run(&self, id: i64) -> Option<CalibrationRun> {
        self.data.read().await.calibration_runs.get(&id).cloned()
    }

    /// Runs for one tag (or all), newest first.
    pub async fn list_calibration_runs(&self, tag: Option<&Mac>) -> Vec<CalibrationRun> {
        let data = self.data.read().await;
        let mut runs: Vec<CalibrationRun> = data
            .calibration_runs
            .values()
            .filter(|run| tag.is_none_or(|t| &run.tag_mac == t))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms).then(b.id.cmp(&a.id)));
        runs
    }

    /// Mark every previously-OK, non-invalidated run as invalidated. Returns
    /// how many runs were touched.
    pub async fn invalidate_ok_runs(&self, now_ms: u64) -> usize {
        let touched = {
            let mut data = self.data.write().await;
            let mut touched = 0;
            for run in data.calibration_runs.values_mut() {
                if run.is_valid() {
                    run.invalidated_at_ms = Some(now_ms);
                    touched += 1;
                }
            }
            touched
        };
        if touched > 0 {
            self.persist().await;
        }
        touched
    }

    pub async fn has_valid_calibration(&self) -> bool {
        self.data
            .read()
            .await
            .calibration_runs
            .values()
            .any(|run| run.is_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mac(s: &str) -> Mac {
        Mac::parse(s).unwrap()
    }

    #[tokio::test]
    async fn settings_round_trip_through_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = Store::open(&path).await;
        store.set_setting("system.state", "SETUP", 100).await;

        let reopened = Store::open(&path).await;
        assert_eq!(
            reopened.get_setting("system.state").await.as_deref(),
            Some("SETUP")
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = Store::open(&path).await;
        assert!(store.list_devices().await.is_empty());
    }

    #[tokio::test]
    async fn device_delete_cascades() {
        let store = Store::in_memory();
        let a = mac("aabbccddee01");
        store.device_seen(&a, DeviceRole::Anchor, 1).await;
        store.set_anchor_position(&a, [0.0, 0.0, 100.0], 1).await;
        store.set_anchor_offset(&a, [1.0, 2.0, 3.0], None, 1).await;
        store.set_device_setting(&a, "range_scale", "1.01").await;

        assert!(store.delete_device(&a).await);
        assert!(store.anchor_positions().await.is_empty());
        assert!(store.anchor_offsets().await.is_empty());
        assert!(store.device_settings(&a).await.is_empty());
    }

    #[tokio::test]
    async fn device_seen_keeps_first_seen_and_newest_last_seen() {
        let store = Store::in_memory();
        let a = mac("aabbccddee01");
        store.device_seen(&a, DeviceRole::Anchor, 100).await;
        store.device_seen(&a, DeviceRole::Anchor, 300).await;
        store.device_seen(&a, DeviceRole::Anchor, 200).await; // out-of-order

        let devices = store.list_devices().await;
        assert_eq!(devices[0].1.first_seen_at_ms, 100);
        assert_eq!(devices[0].1.last_seen_at_ms, 300);
    }

    #[tokio::test]
    async fn run_invalidation_only_touches_valid_runs() {
        let store = Store::in_memory();
        let t = mac("aabbccddeeff");

        let ok = store.create_calibration_run(&t, json!({}), 10).await;
        store
            .finish_calibration_run(ok, RunResult::Ok, json!({}), 20)
            .await;
        let failed = store.create_calibration_run(&t, json!({}), 30).await;
        store
            .finish_calibration_run(failed, RunResult::Failed, json!({}), 40)
            .await;

        assert!(store.has_valid_calibration().await);
        assert_eq!(store.invalidate_ok_runs(50).await, 1);
        assert!(!store.has_valid_calibration().await);
        assert_eq!(
            store.get_calibration_run(ok).await.unwrap().invalidated_at_ms,
            Some(50)
        );
        assert_eq!(
            store
                .get_calibration_run(failed)
                .await
                .unwrap()
                .invalidated_at_ms,
            None
        );
        // already invalidated: a second sweep is a no-op
        assert_eq!(store.invalidate_ok_runs(60).await, 0);
    }

    #[tokio::test]
    async fn discarded_runs_stop_counting_as_calibration() {
        let store = Store::in_memory();
        let t = mac("aabbccddeeff");
        let run = store.create_calibration_run(&t, json!({}), 10).await;
        store
            .finish_calibration_run(run, RunResult::Ok, json!({}), 20)
            .await;
        assert!(store.has_valid_calibration().await);

        assert!(store.set_run_status(run, RunStatus::Committed).await);
        assert!(store.has_valid_calibration().await);

        assert!(store.set_run_status(run, RunStatus::Discarded).await);
        assert!(!store.has_valid_calibration().await);
        assert!(!store.set_run_status(999, RunStatus::Committed).await);
    }

    #[tokio::test]
    async fn fixture_ids_are_monotonic() {
        let store = Store::in_memory();
        let first = store.add_fixture(Fixture::default(), 1).await;
        let second = store.add_fixture(Fixture::default(), 2).await;
        assert!(second > first);
        assert!(store.delete_fixture(first).await);
        let third = store.add_fixture(Fixture::default(), 3).await;
        assert!(third > second);
    }
}
