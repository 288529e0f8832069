//! # uwb-wire
//!
//! Shared UWB payload structures for the StageTrack positioning gateway.
//!
//! These types are used by:
//! - `stagetrack-gateway`: decoding range batches reported by anchor nodes and
//!   shaping the payloads it publishes back out (tag positions, device commands)
//! - `range-sim`: producing wire-identical batches without hardware
//! - anchor firmware: the JSON envelope mirrors the node-side report format
//!
//! ## Conventions
//!
//! - Device identifiers are MAC addresses canonicalized to 12 upper-case hex
//!   nibbles; colon-, dash- and plain-separated inputs are all accepted.
//! - Distances travel as meters (`d_m`) or millimeters (`distance_mm`);
//!   consumers always work in meters.
//! - Timestamps are wall-clock milliseconds since the Unix epoch. Nodes that
//!   have not synced yet report device uptime instead; anything below
//!   [`EPOCH_MS_FLOOR`] is treated as uptime and replaced by the receiver.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Device identifiers ────────────────────────────────────────────────────────

/// Timestamps below this value cannot be epoch milliseconds (that would be
/// before September 2001) and are treated as device uptime.
pub const EPOCH_MS_FLOOR: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacParseError {
    #[error("empty MAC identifier")]
    Empty,
    #[error("MAC identifier must contain exactly 12 hex nibbles, got {0}")]
    BadLength(usize),
}

/// Canonical device identifier: 12 upper-case hex nibbles, no separators.
///
/// Anchors and tags self-report in whatever format their firmware favors
/// (`aa:bb:cc:dd:ee:ff`, `AA-BB-...`, `aabbccddeeff`); everything is folded
/// into one canonical form before it touches storage or topic names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Mac(String);

impl Mac {
    /// Canonicalize a raw identifier. Separators are stripped, hex digits
    /// upper-cased; anything that does not leave exactly 12 nibbles is an error.
    pub fn parse(raw: &str) -> Result<Self, MacParseError> {
        if raw.trim().is_empty() {
            return Err(MacParseError::Empty);
        }
        let nibbles: String = raw
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if nibbles.len() != 12 {
            return Err(MacParseError::BadLength(nibbles.len()));
        }
        Ok(Self(nibbles))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last four nibbles, used for human-readable command ids.
    pub fn short(&self) -> &str {
        &self.0[8..]
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Mac {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Mac::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ── Range batches (anchor → gateway) ──────────────────────────────────────────

/// One distance report inside a batch. Firmware revisions disagree on the
/// distance field (`d_m` vs `distance_mm`); both are tolerated and normalized
/// to meters on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeEntry {
    /// Tag the anchor ranged against. Entries without it are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_mac: Option<String>,
    /// Distance in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d_m: Option<f64>,
    /// Distance in millimeters (older firmware).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_mm: Option<f64>,
    /// Link quality, 0..1, optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<f64>,
    /// Per-entry timestamp; falls back to the batch timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<u64>,
}

impl RangeEntry {
    /// Distance in meters, whichever field the firmware used. `d_m` wins when
    /// both are present.
    pub fn distance_m(&self) -> Option<f64> {
        self.d_m
            .or_else(|| self.distance_mm.map(|mm| mm / 1000.0))
            .filter(|d| d.is_finite())
    }

    /// Canonicalized tag identifier, `None` when missing or unparseable.
    pub fn tag(&self) -> Option<Mac> {
        self.tag_mac.as_deref().and_then(|m| Mac::parse(m).ok())
    }
}

/// One batch of simultaneous ranges from a single anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeBatch {
    pub anchor_mac: Mac,
    /// Batch timestamp in epoch milliseconds, or device uptime for nodes that
    /// have not synced their clock yet.
    #[serde(default)]
    pub ts_ms: u64,
    #[serde(default)]
    pub ranges: Vec<RangeEntry>,
}

impl RangeBatch {
    /// Batch timestamp with the uptime rule applied: values below
    /// [`EPOCH_MS_FLOOR`] are device uptime and are replaced with `now_ms`.
    pub fn normalized_ts(&self, now_ms: u64) -> u64 {
        if self.ts_ms < EPOCH_MS_FLOOR {
            now_ms
        } else {
            self.ts_ms
        }
    }
}

// ── Tag positions (gateway → clients) ─────────────────────────────────────────

/// Per-tag tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagState {
    /// A fix was produced this tick.
    Tracking,
    /// No fix this tick, but the last one is recent.
    Stale,
    /// No fix for longer than the lost timeout.
    Lost,
}

/// Position in venue coordinates, centimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionCm {
    pub x_cm: f64,
    pub y_cm: f64,
    pub z_cm: f64,
}

/// Published once per tracking tick per tag under `tracking/<tag>/position`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPosition {
    pub tag_mac: Mac,
    pub state: TagState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_cm: Option<PositionCm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors_used: Vec<Mac>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outliers: Vec<Mac>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ts_ms: u64,
}

/// Topic a tag's position reports are published under.
pub fn position_topic(tag: &Mac) -> String {
    format!("tracking/{tag}/position")
}

// ── Device commands (gateway → anchors) ───────────────────────────────────────

/// Command envelope for per-device settings pushes, published under
/// `dev/<mac>/cmd`. The receiving node acks with the same `cmd_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub cmd: String,
    pub cmd_id: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl DeviceCommand {
    pub fn apply_settings(
        cmd_id: String,
        settings: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            kind: "cmd".to_string(),
            cmd: "apply_settings".to_string(),
            cmd_id,
            settings,
        }
    }
}

/// Topic a device's command channel lives under.
pub fn command_topic(mac: &Mac) -> String {
    format!("dev/{mac}/cmd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_accepts_common_separators() {
        for raw in ["aa:bb:cc:dd:ee:ff", "AA-BB-CC-DD-EE-FF", "aabbccddeeff"] {
            assert_eq!(Mac::parse(raw).unwrap().as_str(), "AABBCCDDEEFF");
        }
    }

    #[test]
    fn mac_rejects_bad_input() {
        assert_eq!(Mac::parse(""), Err(MacParseError::Empty));
        assert_eq!(Mac::parse("aa:bb:cc"), Err(MacParseError::BadLength(6)));
        assert_eq!(
            Mac::parse("aa:bb:cc:dd:ee:ff:00"),
            Err(MacParseError::BadLength(14))
        );
    }

    #[test]
    fn mac_short_is_last_four_nibbles() {
        assert_eq!(Mac::parse("aabbccddeeff").unwrap().short(), "EEFF");
    }

    #[test]
    fn entry_distance_prefers_meters() {
        let e: RangeEntry =
            serde_json::from_str(r#"{"tag_mac":"aabbccddeeff","d_m":2.5,"distance_mm":9000}"#)
                .unwrap();
        assert_eq!(e.distance_m(), Some(2.5));
    }

    #[test]
    fn entry_distance_normalizes_millimeters() {
        let e: RangeEntry =
            serde_json::from_str(r#"{"tag_mac":"aabbccddeeff","distance_mm":1234.0}"#).unwrap();
        assert_eq!(e.distance_m(), Some(1.234));
    }

    #[test]
    fn batch_uptime_timestamps_are_replaced() {
        let batch: RangeBatch =
            serde_json::from_str(r#"{"anchor_mac":"aabbccddeeff","ts_ms":123456,"ranges":[]}"#)
                .unwrap();
        assert_eq!(batch.normalized_ts(1_700_000_000_000), 1_700_000_000_000);

        let synced: RangeBatch = serde_json::from_str(
            r#"{"anchor_mac":"aabbccddeeff","ts_ms":1700000000500,"ranges":[]}"#,
        )
        .unwrap();
        assert_eq!(synced.normalized_ts(1_700_000_001_000), 1_700_000_000_500);
    }

    #[test]
    fn tag_position_omits_absent_fields() {
        let pos = TagPosition {
            tag_mac: Mac::parse("aabbccddeeff").unwrap(),
            state: TagState::Lost,
            position_cm: None,
            anchors_used: vec![],
            residual_m: None,
            outliers: vec![],
            reason: None,
            ts_ms: 42,
        };
        let json = serde_json::to_value(&pos).unwrap();
        assert_eq!(json["state"], "LOST");
        assert!(json.get("position_cm").is_none());
        assert!(json.get("anchors_used").is_none());
    }

    #[test]
    fn topics_use_canonical_macs() {
        let mac = Mac::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(position_topic(&mac), "tracking/AABBCCDDEEFF/position");
        assert_eq!(command_topic(&mac), "dev/AABBCCDDEEFF/cmd");
    }
}
