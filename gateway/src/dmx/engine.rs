//! DMX engine: the output worker.
//!
//! Ticks at `dmx_hz`. Each tick picks a target (an active aim-test target
//! wins, then the tracked tag while LIVE), maps it to per-fixture pan/tilt
//! with slew limiting against the last-sent table, assembles one frame per
//! universe and hands them to the driver. A send failure logs an event and
//! forces SAFE; output stays off until the operator acknowledges.
//!
//! The driver instance is rebuilt at the top of a tick whenever the resolved
//! output config changed, so a mode switch never reopens the port mid-frame.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use uwb_wire::TagState;

use crate::clock;
use crate::events::EventLog;
use crate::settings::{DmxMode, Settings};
use crate::state::{StateManager, SystemState};
use crate::store::{Fixture, Store};
use crate::tracking::LatestFixes;

use super::driver::{self, DmxOutput, DriverConfig};
use super::frame::{deg_to_u16, frames_by_universe, FixtureCommand, FixtureProfile, FRAME_LEN};
use super::mapping::{aim_angles, apply_fixture_frame, slew_pan, slew_tilt};

/// RGB + master dimmer override for one fixture, merged into its frame slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorOverride {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub dim: u8,
}

/// Operator-set aim target, overriding tracking until it expires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestTarget {
    pub position_cm: [f64; 3],
    pub expires_at_ms: u64,
}

/// Shared mutation handle for the API layer. Everything takes effect no
/// later than the next tick; setting the same value twice is a no-op.
#[derive(Clone, Default)]
pub struct DmxControl {
    test_target: Arc<Mutex<Option<TestTarget>>>,
    color_overrides: Arc<Mutex<HashMap<i64, ColorOverride>>>,
    custom_frames: Arc<Mutex<Vec<(u16, BTreeMap<u16, u8>)>>>,
}

impl DmxControl {
    pub fn set_test_target(&self, position_cm: [f64; 3], duration_ms: u64, now_ms: u64) {
        *self.test_target.lock().unwrap() = Some(TestTarget {
            position_cm,
            expires_at_ms: now_ms + duration_ms,
        });
    }

    pub fn clear_test_target(&self) {
        *self.test_target.lock().unwrap() = None;
    }

    pub fn set_color(&self, fixture_id: i64, color: ColorOverride) {
        self.color_overrides.lock().unwrap().insert(fixture_id, color);
    }

    pub fn clear_color(&self, fixture_id: i64) {
        self.color_overrides.lock().unwrap().remove(&fixture_id);
    }

    /// Queue a raw channel-value frame ("light on/off" fixture tests); the
    /// engine sends it on its next tick, in any state except SAFE.
    pub fn queue_custom_frame(&self, universe: u16, channel_values: BTreeMap<u16, u8>) {
        self.custom_frames.lock().unwrap().push((universe, channel_values));
    }
}

pub struct DmxEngine {
    store: Arc<Store>,
    settings: Settings,
    state: Arc<StateManager>,
    events: EventLog,
    latest: LatestFixes,
    control: DmxControl,
    driver: Option<Box<dyn DmxOutput>>,
    /// Angles last commanded per fixture id; the slew limiter's reference.
    /// Owned by the worker, no lock needed.
    last_sent: HashMap<i64, (f64, f64)>,
}

impl DmxEngine {
    pub fn new(
        store: Arc<Store>,
        state: Arc<StateManager>,
        events: EventLog,
        latest: LatestFixes,
    ) -> Self {
        Self {
            settings: Settings::new(store.clone()),
            store,
            state,
            events,
            latest,
            control: DmxControl::default(),
            driver: None,
            last_sent: HashMap::new(),
        }
    }

    pub fn control(&self) -> DmxControl {
        self.control.clone()
    }

    /// Swap in a driver directly, bypassing settings resolution. Used by
    /// harnesses that capture frames instead of emitting them.
    pub fn set_driver(&mut self, driver: Box<dyn DmxOutput>) {
        self.driver = Some(driver);
    }

    /// One output pass.
    pub async fn tick(&mut self, now_ms: u64) {
        if self.state.current().await == SystemState::Safe {
            return;
        }
        self.ensure_driver().await;

        // queued raw frames go out first, independent of target selection
        let custom: Vec<(u16, BTreeMap<u16, u8>)> =
            std::mem::take(&mut *self.control.custom_frames.lock().unwrap());
        for (universe, values) in custom {
            let mut frame = [0u8; FRAME_LEN];
            frame[0] = 0x00;
            for (ch, value) in values {
                if (1..=512).contains(&ch) {
                    frame[usize::from(ch)] = value;
                }
            }
            if !self.dispatch(universe, &frame).await {
                return;
            }
        }

        let Some(target_cm) = self.select_target(now_ms).await else {
            return;
        };

        let rates = self.settings.rates().await;
        let dt_s = 1.0 / rates.dmx_hz.clamp(1.0, 120.0);
        let mut fixtures = self.store.list_fixtures().await;
        fixtures.sort_by_key(|fx| fx.id);
        let profiles = self.store.profiles().await;
        let overrides = self.control.color_overrides.lock().unwrap().clone();

        let mut commands = Vec::new();
        for fx in &fixtures {
            if !fx.enabled {
                // forget its slew reference so a re-enable snaps to the target
                self.last_sent.remove(&fx.id);
                continue;
            }
            commands.push(self.fixture_command(fx, target_cm, dt_s, &profiles, &overrides));
        }
        if commands.is_empty() {
            return;
        }

        for (universe, frame) in frames_by_universe(&commands, &profiles) {
            if !self.dispatch(universe, &frame).await {
                return;
            }
        }
    }

    fn fixture_command(
        &mut self,
        fx: &Fixture,
        target_cm: [f64; 3],
        dt_s: f64,
        profiles: &BTreeMap<String, FixtureProfile>,
        overrides: &HashMap<i64, ColorOverride>,
    ) -> FixtureCommand {
        let (raw_pan, raw_tilt) =
            aim_angles([fx.pos_x_cm, fx.pos_y_cm, fx.pos_z_cm], target_cm);
        let (target_pan, target_tilt) = apply_fixture_frame(raw_pan, raw_tilt, fx);

        let (prev_pan, prev_tilt) = self
            .last_sent
            .get(&fx.id)
            .copied()
            .unwrap_or((target_pan, target_tilt));
        let pan = slew_pan(prev_pan, target_pan, fx.slew_pan_deg_s, dt_s);
        let tilt = slew_tilt(prev_tilt, target_tilt, fx.slew_tilt_deg_s, dt_s);
        self.last_sent.insert(fx.id, (pan, tilt));

        let mut channel_values = BTreeMap::new();
        if let (Some(color), Some(profile)) = (overrides.get(&fx.id), profiles.get(&fx.profile_key))
        {
            channel_values = color_channel_values(profile, fx.dmx_base_addr, color);
        }

        FixtureCommand {
            fixture_id: fx.id,
            universe: fx.universe,
            base_addr: fx.dmx_base_addr,
            profile_key: fx.profile_key.clone(),
            pan_u16: deg_to_u16(pan, fx.pan_min_deg, fx.pan_max_deg),
            tilt_u16: deg_to_u16(tilt, fx.tilt_min_deg, fx.tilt_max_deg),
            channel_values,
        }
    }

    /// Test target wins while unexpired; LIVE falls back to the tracked tag;
    /// any other state without a test target emits nothing.
    async fn select_target(&mut self, now_ms: u64) -> Option<[f64; 3]> {
        {
            let mut test = self.control.test_target.lock().unwrap();
            match *test {
                Some(t) if t.expires_at_ms > now_ms => return Some(t.position_cm),
                Some(_) => *test = None, // expired
                None => {}
            }
        }

        if self.state.current().await != SystemState::Live {
            return None;
        }

        let preferred = self.settings.preferred_tag().await;
        let latest = self.latest.read().await;
        let report = match preferred {
            Some(tag) => latest.get(&tag),
            // no tag configured: follow the most recently updated tracked tag
            None => latest
                .values()
                .filter(|r| r.state == TagState::Tracking)
                .max_by_key(|r| r.ts_ms),
        }?;
        if report.state != TagState::Tracking {
            return None; // freeze on the last frame until it tracks again
        }
        let pos = report.position_cm?;
        Some([pos.x_cm, pos.y_cm, pos.z_cm])
    }

    async fn ensure_driver(&mut self) {
        let config = match self.settings.dmx_mode().await {
            DmxMode::Off => DriverConfig::Off,
            DmxMode::Uart => DriverConfig::Uart {
                device: self.settings.uart_device().await,
            },
            DmxMode::Artnet => DriverConfig::Artnet {
                target: self.settings.artnet_target().await,
            },
        };
        let up_to_date = self
            .driver
            .as_ref()
            .is_some_and(|d| d.config() == &config);
        if up_to_date {
            return;
        }
        match driver::open(config) {
            Ok(d) => self.driver = Some(d),
            Err(e) => {
                // not a transport fault yet: retry next tick, emit nothing
                warn!("dmx: driver open failed: {e}");
                self.driver = None;
            }
        }
    }

    /// Send one frame; on failure log the event, force SAFE and report false.
    async fn dispatch(&mut self, universe: u16, frame: &[u8; FRAME_LEN]) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            return true; // no transport available, skip silently
        };
        match driver.send_frame(frame, universe) {
            Ok(()) => true,
            Err(e) => {
                self.events.dmx_fault(universe, &e.to_string()).await;
                self.state
                    .force_safe(&format!("dmx send failed on universe {universe}: {e}"))
                    .await;
                false
            }
        }
    }

    /// Worker loop at `dmx_hz`; the rate is re-read every pass.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("dmx engine started");
        loop {
            let hz = self.settings.rates().await.dmx_hz.clamp(1.0, 120.0);
            let period = Duration::from_secs_f64(1.0 / hz);
            tokio::select! {
                _ = tokio::time::sleep(period) => self.tick(clock::now_ms()).await,
                _ = shutdown.changed() => break,
            }
        }
        info!("dmx engine stopped");
    }
}

/// Resolve a color override into absolute channel writes for one fixture.
/// Without a dimmer channel the RGB values are scaled by the dimmer instead.
fn color_channel_values(
    profile: &FixtureProfile,
    base_addr: u16,
    color: &ColorOverride,
) -> BTreeMap<u16, u8> {
    let mut values = BTreeMap::new();
    let mut set = |offset: Option<u16>, value: u8| {
        let Some(offset) = offset else { return };
        let ch = base_addr.saturating_add(offset);
        if (1..=512).contains(&ch) {
            values.insert(ch, value);
        }
    };

    let (mut r, mut g, mut b) = (color.r, color.g, color.b);
    if profile.dimmer.is_none() {
        let scale = f64::from(color.dim) / 255.0;
        r = (f64::from(r) * scale) as u8;
        g = (f64::from(g) * scale) as u8;
        b = (f64::from(b) * scale) as u8;
    } else {
        set(profile.dimmer, color.dim);
    }
    if profile.shutter.is_some() {
        set(profile.shutter, if color.dim > 0 { 255 } else { 0 });
    }
    set(profile.red, r);
    set(profile.green, g);
    set(profile.blue, b);
    if profile.white.is_some() {
        set(profile.white, color.dim);
    }
    values
}
