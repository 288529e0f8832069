//! Operational state machine: SETUP / CALIBRATION / LIVE / SAFE.
//!
//! The state gates everything: which mutations are allowed, whether DMX
//! output runs, whether calibration may start. Entering LIVE requires the
//! readiness conjunction to hold; any transport fault forces SAFE, which
//! only an operator acknowledgment (SAFE → SETUP) leaves. The state itself
//! is a settings row so it survives restarts; callers re-read it inside
//! every guard.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use uwb_wire::{Mac, TagState};

use crate::clock;
use crate::events::EventLog;
use crate::registry::AnchorRegistry;
use crate::settings::{keys, Settings};
use crate::store::Store;
use crate::tracking::LatestFixes;

/// Window for the "anchor is online" readiness gate.
pub const ONLINE_WINDOW_MS: u64 = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    Setup,
    Calibration,
    Live,
    Safe,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "SETUP",
            Self::Calibration => "CALIBRATION",
            Self::Live => "LIVE",
            Self::Safe => "SAFE",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SETUP" => Some(Self::Setup),
            "CALIBRATION" => Some(Self::Calibration),
            "LIVE" => Some(Self::Live),
            "SAFE" => Some(Self::Safe),
            _ => None,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The mutation or transition is not allowed in the current state.
    /// Surfaced to API layers as a `STATE_BLOCKED` refusal.
    #[error("STATE_BLOCKED: {action} not allowed while {state}")]
    Blocked {
        action: String,
        state: SystemState,
    },
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: SystemState, to: SystemState },
    /// LIVE refused; `missing` lists the failed readiness conditions.
    #[error("not ready for LIVE, missing: {missing:?}")]
    NotReady { missing: Vec<String> },
}

/// The readiness conjunction for entering LIVE, with per-gate detail so an
/// operator can see exactly what is missing.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub bus_connected: bool,
    pub anchors_online: usize,
    pub anchors_required: usize,
    pub calibration_ok: bool,
    pub fixtures_ok: bool,
    pub tracking_ok: bool,
    pub missing: Vec<String>,
}

pub struct StateManager {
    store: Arc<Store>,
    settings: Settings,
    registry: Arc<AnchorRegistry>,
    events: EventLog,
    latest: LatestFixes,
    bus_connected: AtomicBool,
    // Serializes transition attempts so two concurrent requests cannot both
    // pass the same from-state check.
    transition: RwLock<()>,
}

impl StateManager {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<AnchorRegistry>,
        events: EventLog,
        latest: LatestFixes,
    ) -> Self {
        Self {
            settings: Settings::new(store.clone()),
            store,
            registry,
            events,
            latest,
            bus_connected: AtomicBool::new(false),
            transition: RwLock::new(()),
        }
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    pub async fn current(&self) -> SystemState {
        self.store
            .get_setting(keys::SYSTEM_STATE)
            .await
            .and_then(|raw| SystemState::parse(&raw))
            .unwrap_or(SystemState::Setup)
    }

    /// Evaluate the LIVE readiness gates.
    pub async fn readiness(&self, now_ms: u64) -> Readiness {
        let bus_connected = self.bus_connected.load(Ordering::Relaxed);
        let anchors_required = self.settings.min_anchors_online().await;
        let anchors_online = self.registry.online_count(ONLINE_WINDOW_MS, now_ms).await;
        let calibration_ok = self.store.has_valid_calibration().await;
        let fixtures_ok = self
            .store
            .list_fixtures()
            .await
            .iter()
            .any(|fx| fx.enabled);
        let tracking_ok = self
            .latest
            .read()
            .await
            .values()
            .any(|report| report.state == TagState::Tracking);

        let mut missing = Vec::new();
        if !bus_connected {
            missing.push("bus_connected".to_string());
        }
        if anchors_online < anchors_required {
            missing.push(format!(
                "anchors_online ({anchors_online}/{anchors_required})"
            ));
        }
        if !calibration_ok {
            missing.push("calibration_ok".to_string());
        }
        if !fixtures_ok {
            missing.push("enabled_fixture".to_string());
        }
        if !tracking_ok {
            missing.push("tracking_tag".to_string());
        }

        Readiness {
            ready: missing.is_empty(),
            bus_connected,
            anchors_online,
            anchors_required,
            calibration_ok,
            fixtures_ok,
            tracking_ok,
            missing,
        }
    }

    /// Attempt a transition. Enforces the allowed-transition table and, for
    /// SETUP → LIVE, the readiness conjunction.
    pub async fn request(&self, target: SystemState) -> Result<SystemState, StateError> {
        let _guard = self.transition.write().await;
        let from = self.current().await;
        if from == target {
            return Ok(from);
        }

        let allowed = matches!(
            (from, target),
            (SystemState::Setup, SystemState::Calibration)
                | (SystemState::Calibration, SystemState::Setup)
                | (SystemState::Setup, SystemState::Live)
                | (SystemState::Live, SystemState::Setup)
                | (_, SystemState::Safe)
                | (SystemState::Safe, SystemState::Setup)
        );
        if !allowed {
            return Err(StateError::InvalidTransition { from, to: target });
        }

        if target == SystemState::Live {
            let readiness = self.readiness(clock::now_ms()).await;
            if !readiness.ready {
                return Err(StateError::NotReady {
                    missing: readiness.missing,
                });
            }
        }

        self.store
            .set_setting(keys::SYSTEM_STATE, target.as_str(), clock::now_ms())
            .await;
        self.events
            .state_changed(from.as_str(), target.as_str(), None)
            .await;
        Ok(target)
    }

    /// Severe-fault escalation: from anywhere, immediately.
    pub async fn force_safe(&self, reason: &str) {
        let _guard = self.transition.write().await;
        let from = self.current().await;
        if from == SystemState::Safe {
            return;
        }
        self.store
            .set_setting(keys::SYSTEM_STATE, SystemState::Safe.as_str(), clock::now_ms())
            .await;
        self.events
            .state_changed(from.as_str(), SystemState::Safe.as_str(), Some(reason))
            .await;
    }

    /// Mutation guard: anchor/fixture/DMX/settings writes are refused while
    /// LIVE. Callers re-check immediately before writing.
    pub async fn guard_mutation(&self, action: &str) -> Result<(), StateError> {
        let state = self.current().await;
        if state == SystemState::Live {
            return Err(StateError::Blocked {
                action: action.to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Operator path for anchor base-position writes: guarded by LIVE, and
    /// every successful write invalidates all previously-OK calibrations.
    pub async fn set_anchor_position(
        &self,
        mac: &Mac,
        pos_cm: [f64; 3],
        now_ms: u64,
    ) -> Result<(), StateError> {
        self.guard_mutation("anchor_position").await?;
        self.store.set_anchor_position(mac, pos_cm, now_ms).await;
        self.after_anchor_mutation(now_ms, &format!("anchor {mac} moved")).await;
        Ok(())
    }

    /// Operator path for anchor deletion; cascades device settings and
    /// position rows, and invalidates calibrations like any position change.
    pub async fn delete_anchor(&self, mac: &Mac, now_ms: u64) -> Result<bool, StateError> {
        self.guard_mutation("anchor_delete").await?;
        let removed = self.store.delete_device(mac).await;
        if removed {
            self.after_anchor_mutation(now_ms, &format!("anchor {mac} deleted")).await;
        }
        Ok(removed)
    }

    async fn after_anchor_mutation(&self, now_ms: u64, reason: &str) {
        self.registry.invalidate().await;
        let touched = self.store.invalidate_ok_runs(now_ms).await;
        if touched > 0 {
            self.events.calibration_invalidated(touched, reason).await;
        }
    }
}
