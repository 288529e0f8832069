//! Anchor registry: effective positions and online status.
//!
//! Effective position = operator-entered base + calibration offset. Reads go
//! through a short-lived cache so the tracking worker does not hammer the
//! store every tick; writers invalidate explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use uwb_wire::Mac;

use crate::store::Store;

/// How long a cached read stays valid. Writers invalidate eagerly, so this
/// only bounds staleness across processes sharing the snapshot file.
const CACHE_TTL_MS: u64 = 1_000;

/// Per-anchor linear range correction from the calibration solve, applied as
/// `corrected_cm = scale * measured_cm + offset_cm`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeCorrection {
    pub scale: f64,
    pub offset_cm: f64,
}

impl Default for RangeCorrection {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset_cm: 0.0,
        }
    }
}

impl RangeCorrection {
    pub fn apply_cm(&self, measured_cm: f64) -> f64 {
        self.scale * measured_cm + self.offset_cm
    }
}

#[derive(Default)]
struct Cached {
    positions: HashMap<Mac, [f64; 3]>,
    last_seen: HashMap<Mac, u64>,
    corrections: HashMap<Mac, RangeCorrection>,
    loaded_at_ms: u64,
}

pub struct AnchorRegistry {
    store: Arc<Store>,
    cache: Mutex<Option<Cached>>,
}

impl AnchorRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    async fn load(&self) -> Cached {
        let base = self.store.anchor_positions().await;
        let offsets = self.store.anchor_offsets().await;
        let last_seen = self.store.devices_last_seen().await;
        let device_settings = self.store.all_device_settings().await;
        let positions = base
            .into_iter()
            .map(|(mac, pos)| {
                let off = offsets.get(&mac).copied().unwrap_or([0.0; 3]);
                (mac, [pos[0] + off[0], pos[1] + off[1], pos[2] + off[2]])
            })
            .collect();
        let corrections = device_settings
            .into_iter()
            .filter_map(|(mac, kv)| {
                let scale = kv.get("range_scale").and_then(|v| v.parse().ok());
                let offset_cm = kv.get("range_offset_cm").and_then(|v| v.parse().ok());
                if scale.is_none() && offset_cm.is_none() {
                    return None;
                }
                let defaults = RangeCorrection::default();
                Some((
                    mac,
                    RangeCorrection {
                        scale: scale.unwrap_or(defaults.scale),
                        offset_cm: offset_cm.unwrap_or(defaults.offset_cm),
                    },
                ))
            })
            .collect();
        Cached {
            positions,
            last_seen,
            corrections,
            loaded_at_ms: 0,
        }
    }

    async fn refreshed<T>(&self, now_ms: u64, read: impl FnOnce(&Cached) -> T) -> T {
        let mut guard = self.cache.lock().await;
        let stale = match &*guard {
            Some(c) => now_ms.saturating_sub(c.loaded_at_ms) > CACHE_TTL_MS,
            None => true,
        };
        if stale {
            let mut fresh = self.load().await;
            fresh.loaded_at_ms = now_ms;
            *guard = Some(fresh);
        }
        read(guard.as_ref().unwrap())
    }

    /// Effective positions (base + offset) for every positioned anchor, cm.
    pub async fn effective_positions(&self, now_ms: u64) -> HashMap<Mac, [f64; 3]> {
        self.refreshed(now_ms, |c| c.positions.clone()).await
    }

    /// Per-anchor range corrections derived by the calibration solve.
    pub async fn range_corrections(&self, now_ms: u64) -> HashMap<Mac, RangeCorrection> {
        self.refreshed(now_ms, |c| c.corrections.clone()).await
    }

    /// Whether the anchor has been heard from within `window_ms`.
    pub async fn is_online(&self, mac: &Mac, window_ms: u64, now_ms: u64) -> bool {
        self.refreshed(now_ms, |c| {
            c.last_seen
                .get(mac)
                .is_some_and(|ts| now_ms.saturating_sub(*ts) <= window_ms)
        })
        .await
    }

    /// Positioned anchors heard from within `window_ms`.
    pub async fn online_count(&self, window_ms: u64, now_ms: u64) -> usize {
        self.refreshed(now_ms, |c| {
            c.positions
                .keys()
                .filter(|mac| {
                    c.last_seen
                        .get(*mac)
                        .is_some_and(|ts| now_ms.saturating_sub(*ts) <= window_ms)
                })
                .count()
        })
        .await
    }

    /// Drop the cached read; called after any anchor or device mutation.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeviceRole;

    fn mac(s: &str) -> Mac {
        Mac::parse(s).unwrap()
    }

    #[tokio::test]
    async fn effective_position_is_base_plus_offset() {
        let store = Store::in_memory();
        let a = mac("aabbccddee01");
        store.set_anchor_position(&a, [100.0, 200.0, 300.0], 1).await;
        store.set_anchor_offset(&a, [-1.0, 0.5, 2.0], None, 1).await;

        let registry = AnchorRegistry::new(store);
        let positions = registry.effective_positions(10).await;
        assert_eq!(positions[&a], [99.0, 200.5, 302.0]);
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let store = Store::in_memory();
        let a = mac("aabbccddee01");
        store.set_anchor_position(&a, [0.0, 0.0, 0.0], 1).await;

        let registry = AnchorRegistry::new(store.clone());
        let now = 1_000;
        assert_eq!(registry.effective_positions(now).await.len(), 1);

        let b = mac("aabbccddee02");
        store.set_anchor_position(&b, [10.0, 0.0, 0.0], 2).await;
        // cached read within the TTL still shows one anchor
        assert_eq!(registry.effective_positions(now + 10).await.len(), 1);

        registry.invalidate().await;
        assert_eq!(registry.effective_positions(now + 20).await.len(), 2);
    }

    #[tokio::test]
    async fn online_window_uses_device_last_seen() {
        let store = Store::in_memory();
        let a = mac("aabbccddee01");
        store.set_anchor_position(&a, [0.0, 0.0, 0.0], 1).await;
        store.device_seen(&a, DeviceRole::Anchor, 5_000).await;

        let registry = AnchorRegistry::new(store);
        assert!(registry.is_online(&a, 8_000, 10_000).await);
        assert_eq!(registry.online_count(8_000, 10_000).await, 1);

        registry.invalidate().await;
        assert!(!registry.is_online(&a, 1_000, 10_000).await);
        assert_eq!(registry.online_count(1_000, 10_000).await, 0);
    }

    #[tokio::test]
    async fn unknown_anchor_is_offline() {
        let registry = AnchorRegistry::new(Store::in_memory());
        assert!(!registry.is_online(&mac("aabbccddee99"), 8_000, 10_000).await);
    }

    #[tokio::test]
    async fn range_corrections_parse_from_device_settings() {
        let store = Store::in_memory();
        let a = mac("aabbccddee01");
        store.set_device_setting(&a, "range_scale", "1.02").await;
        store.set_device_setting(&a, "range_offset_cm", "-3.5").await;

        let registry = AnchorRegistry::new(store);
        let corrections = registry.range_corrections(1_000).await;
        let c = corrections[&a];
        assert_eq!(c.scale, 1.02);
        assert_eq!(c.offset_cm, -3.5);
        assert!((c.apply_cm(100.0) - 98.5).abs() < 1e-9);
    }
}
