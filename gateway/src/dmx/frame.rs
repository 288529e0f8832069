//! Universe frame assembly.
//!
//! A DMX universe frame is exactly 513 bytes: the 0x00 start code followed by
//! channels 1..=512. Fixture profiles describe where each function sits
//! relative to the fixture's base address; the assembler places 16-bit
//! pan/tilt values and any explicit channel overrides, grouping commands into
//! one frame per universe.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const FRAME_LEN: usize = 513;

pub type Frame = [u8; FRAME_LEN];

/// Channel layout for one fixture type. Offsets are 0-based relative to the
/// fixture's base address; `channels` is the total footprint. The color,
/// dimmer and shutter slots are optional and only used for test lighting and
/// live color overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureProfile {
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan_fine: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt_fine: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub green: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub white: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimmer: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutter: Option<u16>,
}

impl FixtureProfile {
    /// The common 4-channel moving-head layout: pan/tilt, coarse+fine.
    pub fn basic_moving_head() -> Self {
        Self {
            channels: 4,
            pan: Some(0),
            pan_fine: Some(1),
            tilt: Some(2),
            tilt_fine: Some(3),
            red: None,
            green: None,
            blue: None,
            white: None,
            dimmer: None,
            shutter: None,
        }
    }
}

/// Map an angle into the 16-bit DMX range over `[min_deg, max_deg]`.
/// Degenerate ranges (max ≤ min) map to 0.
pub fn deg_to_u16(deg: f64, min_deg: f64, max_deg: f64) -> u16 {
    if max_deg <= min_deg {
        return 0;
    }
    let norm = ((deg - min_deg) / (max_deg - min_deg)).clamp(0.0, 1.0);
    (norm * 65_535.0).round() as u16
}

/// Split a 16-bit value into its coarse/fine channel bytes.
pub fn u16_to_coarse_fine(value: u16) -> (u8, u8) {
    (((value >> 8) & 0xFF) as u8, (value & 0xFF) as u8)
}

/// One fixture's contribution to a universe this tick.
#[derive(Debug, Clone)]
pub struct FixtureCommand {
    pub fixture_id: i64,
    pub universe: u16,
    pub base_addr: u16,
    pub profile_key: String,
    pub pan_u16: u16,
    pub tilt_u16: u16,
    /// Explicit absolute channel → value writes (1-indexed), applied after
    /// the profile layout. Used for test lighting and color overrides.
    pub channel_values: BTreeMap<u16, u8>,
}

/// Assemble one 513-byte frame from the commands of a single universe.
/// Commands whose footprint does not fit inside channels 1..=512, or whose
/// profile is unknown, are skipped silently.
pub fn build_frame(
    commands: &[FixtureCommand],
    profiles: &BTreeMap<String, FixtureProfile>,
) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = 0x00; // start code

    for cmd in commands {
        let Some(profile) = profiles.get(&cmd.profile_key) else {
            continue;
        };
        let base = cmd.base_addr;
        if base < 1 || u32::from(base) + u32::from(profile.channels) - 1 > 512 {
            continue;
        }

        let (pan_coarse, pan_fine) = u16_to_coarse_fine(cmd.pan_u16);
        let (tilt_coarse, tilt_fine) = u16_to_coarse_fine(cmd.tilt_u16);
        let mut set = |offset: Option<u16>, value: u8| {
            let Some(offset) = offset else { return };
            if offset >= profile.channels {
                return;
            }
            let ch = usize::from(base) + usize::from(offset);
            if (1..=512).contains(&ch) {
                frame[ch] = value;
            }
        };
        set(profile.pan, pan_coarse);
        set(profile.pan_fine, pan_fine);
        set(profile.tilt, tilt_coarse);
        set(profile.tilt_fine, tilt_fine);

        for (&ch, &value) in &cmd.channel_values {
            if (1..=512).contains(&ch) {
                frame[usize::from(ch)] = value;
            }
        }
    }

    frame
}

/// Group commands by universe and assemble one frame per universe that has
/// at least one command.
pub fn frames_by_universe(
    commands: &[FixtureCommand],
    profiles: &BTreeMap<String, FixtureProfile>,
) -> BTreeMap<u16, Frame> {
    let mut grouped: BTreeMap<u16, Vec<FixtureCommand>> = BTreeMap::new();
    for cmd in commands {
        grouped.entry(cmd.universe).or_default().push(cmd.clone());
    }
    grouped
        .into_iter()
        .map(|(universe, cmds)| (universe, build_frame(&cmds, profiles)))
        .collect()
}
