//! Typed accessors over the key→string settings table.
//!
//! Workers poll these each tick; a bad or missing value falls back to the
//! documented default rather than erroring, so a half-written settings row
//! can never stall tracking or DMX output.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use uwb_wire::Mac;

use crate::store::Store;

pub mod keys {
    pub const SYSTEM_STATE: &str = "system.state";
    pub const RATES_GLOBAL: &str = "rates.global";
    pub const MIN_ANCHORS_ONLINE: &str = "guards.min_anchors_online";
    pub const RESID_MAX_M: &str = "tracking.resid_max_m";
    pub const TRACKING_TAG: &str = "tracking.tag_mac";
    pub const DMX_OUTPUT_MODE: &str = "dmx.output_mode";
    pub const DMX_UART_DEVICE: &str = "dmx.uart_device";
    pub const ARTNET_TARGET_IP: &str = "artnet.target_ip";
    pub const ARTNET_PORT: &str = "artnet.port";
    pub const ARTNET_UNIVERSE: &str = "artnet.universe";
}

/// Worker tick rates and tag freshness windows, stored as one JSON blob under
/// `rates.global`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalRates {
    #[serde(default = "GlobalRates::default_tracking_hz")]
    pub tracking_hz: f64,
    #[serde(default = "GlobalRates::default_dmx_hz")]
    pub dmx_hz: f64,
    #[serde(default = "GlobalRates::default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
    #[serde(default = "GlobalRates::default_lost_timeout_ms")]
    pub lost_timeout_ms: u64,
}

impl GlobalRates {
    fn default_tracking_hz() -> f64 {
        10.0
    }
    fn default_dmx_hz() -> f64 {
        30.0
    }
    fn default_stale_timeout_ms() -> u64 {
        1_500
    }
    fn default_lost_timeout_ms() -> u64 {
        4_000
    }
}

impl Default for GlobalRates {
    fn default() -> Self {
        Self {
            tracking_hz: Self::default_tracking_hz(),
            dmx_hz: Self::default_dmx_hz(),
            stale_timeout_ms: Self::default_stale_timeout_ms(),
            lost_timeout_ms: Self::default_lost_timeout_ms(),
        }
    }
}

/// Which transport the DMX engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmxMode {
    Uart,
    Artnet,
    Off,
}

impl DmxMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "artnet" => Self::Artnet,
            "off" => Self::Off,
            _ => Self::Uart,
        }
    }
}

/// Art-Net destination, resolved from three settings keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtnetTarget {
    pub ip: IpAddr,
    pub port: u16,
    /// Base added to each fixture's universe on the wire.
    pub universe_base: u16,
}

impl Default for ArtnetTarget {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            port: 6454,
            universe_base: 0,
        }
    }
}

/// Typed settings reader shared by all workers.
#[derive(Clone)]
pub struct Settings {
    store: Arc<Store>,
}

impl Settings {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn rates(&self) -> GlobalRates {
        match self.store.get_setting(keys::RATES_GLOBAL).await {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => GlobalRates::default(),
        }
    }

    pub async fn min_anchors_online(&self) -> usize {
        self.parse_or(keys::MIN_ANCHORS_ONLINE, 4).await
    }

    pub async fn resid_max_m(&self) -> f64 {
        self.parse_or(keys::RESID_MAX_M, 5.0).await
    }

    /// Preferred tag for DMX targeting; `None` means "most recently tracked".
    pub async fn preferred_tag(&self) -> Option<Mac> {
        let raw = self.store.get_setting(keys::TRACKING_TAG).await?;
        Mac::parse(&raw).ok()
    }

    pub async fn dmx_mode(&self) -> DmxMode {
        match self.store.get_setting(keys::DMX_OUTPUT_MODE).await {
            Some(raw) => DmxMode::parse(&raw),
            None => DmxMode::Uart,
        }
    }

    pub async fn uart_device(&self) -> String {
        self.store
            .get_setting(keys::DMX_UART_DEVICE)
            .await
            .unwrap_or_else(|| "/dev/serial0".to_string())
    }

    pub async fn artnet_target(&self) -> ArtnetTarget {
        let defaults = ArtnetTarget::default();
        let ip = self
            .store
            .get_setting(keys::ARTNET_TARGET_IP)
            .await
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(defaults.ip);
        let port = self.parse_or(keys::ARTNET_PORT, defaults.port).await;
        let universe_base = self
            .parse_or(keys::ARTNET_UNIVERSE, defaults.universe_base)
            .await;
        ArtnetTarget {
            ip,
            port,
            universe_base,
        }
    }

    async fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.store.get_setting(key).await {
            Some(raw) => raw.trim().parse().unwrap_or(default),
            None => default,
        }
    }
}
