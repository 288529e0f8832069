//! Fixture-local pan/tilt geometry.
//!
//! Angles are degrees throughout. Pan lives on a circle and is always reduced
//! by shortest arc; tilt is a plain bounded axis and never wraps.

use crate::store::Fixture;

/// Wrap an angle into `(-180, 180]`.
pub fn wrap_deg(deg: f64) -> f64 {
    let r = deg.rem_euclid(360.0);
    if r > 180.0 {
        r - 360.0
    } else {
        r
    }
}

/// Raw aim angles from fixture mounting position to target, both cm.
/// Pan is the azimuth in the venue plane, tilt the elevation above it.
pub fn aim_angles(fixture_pos_cm: [f64; 3], target_cm: [f64; 3]) -> (f64, f64) {
    let vx = target_cm[0] - fixture_pos_cm[0];
    let vy = target_cm[1] - fixture_pos_cm[1];
    let vz = target_cm[2] - fixture_pos_cm[2];
    let pan = vy.atan2(vx).to_degrees();
    let tilt = vz.atan2(vx.hypot(vy)).to_degrees();
    (pan, tilt)
}

/// Turn raw aim angles into fixture-frame angles: add the trim offsets, wrap
/// pan into the window centered on its zero reference, subtract the tilt
/// zero, apply inversion, clamp to the mechanical limits.
pub fn apply_fixture_frame(pan_deg: f64, tilt_deg: f64, fx: &Fixture) -> (f64, f64) {
    let mut pan = pan_deg + fx.pan_offset_deg;
    let mut tilt = tilt_deg + fx.tilt_offset_deg - fx.tilt_zero_deg;

    pan = fx.pan_zero_deg + wrap_deg(pan - fx.pan_zero_deg);

    if fx.invert_pan {
        pan = -pan;
    }
    if fx.invert_tilt {
        tilt = -tilt;
    }

    (
        pan.clamp(fx.pan_min_deg, fx.pan_max_deg),
        tilt.clamp(fx.tilt_min_deg, fx.tilt_max_deg),
    )
}

/// Rate-limit pan toward `target_deg`, moving along the shortest arc.
/// `max_deg_per_s <= 0` disables the limit and returns the target.
pub fn slew_pan(prev_deg: f64, target_deg: f64, max_deg_per_s: f64, dt_s: f64) -> f64 {
    if max_deg_per_s <= 0.0 {
        return target_deg;
    }
    let delta = wrap_deg(target_deg - prev_deg);
    let max_step = max_deg_per_s * dt_s;
    if delta.abs() <= max_step {
        target_deg
    } else {
        prev_deg + delta.signum() * max_step
    }
}

/// Rate-limit tilt toward `target_deg`. No wrap: tilt is a bounded axis and
/// the long way around does not exist.
pub fn slew_tilt(prev_deg: f64, target_deg: f64, max_deg_per_s: f64, dt_s: f64) -> f64 {
    if max_deg_per_s <= 0.0 {
        return target_deg;
    }
    let delta = target_deg - prev_deg;
    let max_step = max_deg_per_s * dt_s;
    if delta.abs() <= max_step {
        target_deg
    } else {
        prev_deg + delta.signum() * max_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_fixture() -> Fixture {
        Fixture {
            pan_min_deg: -180.0,
            pan_max_deg: 180.0,
            tilt_min_deg: -90.0,
            tilt_max_deg: 90.0,
            ..Fixture::default()
        }
    }

    #[test]
    fn pan_quadrants() {
        let targets = [
            ([100.0, 0.0, 0.0], 0.0),
            ([0.0, 100.0, 0.0], 90.0),
            ([-100.0, 0.0, 0.0], 180.0),
            ([0.0, -100.0, 0.0], -90.0),
        ];
        for (target, want_pan) in targets {
            let (pan, tilt) = aim_angles([0.0, 0.0, 0.0], target);
            assert!((wrap_deg(pan - want_pan)).abs() < 1e-9, "target {target:?}");
            assert_eq!(tilt, 0.0);
        }
    }

    #[test]
    fn tilt_is_elevation() {
        let (pan, tilt) = aim_angles([0.0, 0.0, 0.0], [100.0, 0.0, 100.0]);
        assert!((pan - 0.0).abs() < 1e-9);
        assert!((tilt - 45.0).abs() < 1e-9);

        let (_, below) = aim_angles([0.0, 0.0, 200.0], [100.0, 0.0, 100.0]);
        assert!((below + 45.0).abs() < 1e-9);
    }

    #[test]
    fn wrap_deg_half_open_interval() {
        assert_eq!(wrap_deg(180.0), 180.0);
        assert_eq!(wrap_deg(-180.0), 180.0);
        assert_eq!(wrap_deg(190.0), -170.0);
        assert_eq!(wrap_deg(-190.0), 170.0);
        assert_eq!(wrap_deg(720.0), 0.0);
    }

    #[test]
    fn offsets_then_zero_wrap_then_invert_then_clamp() {
        let fx = Fixture {
            pan_offset_deg: 10.0,
            pan_zero_deg: 90.0,
            invert_pan: true,
            pan_min_deg: -170.0,
            pan_max_deg: 170.0,
            ..plain_fixture()
        };
        // raw pan -80: +10 offset = -70, wraps to -70 in (−90, 270], invert → 70
        let (pan, _) = apply_fixture_frame(-80.0, 0.0, &fx);
        assert!((pan - 70.0).abs() < 1e-9);

        // raw pan 300 lands at 310 after offset, wraps into (−90, 270] as -50
        let fx2 = Fixture {
            pan_offset_deg: 10.0,
            pan_zero_deg: 90.0,
            ..plain_fixture()
        };
        let (pan2, _) = apply_fixture_frame(300.0, 0.0, &fx2);
        assert!((pan2 - (-50.0)).abs() < 1e-9);
    }

    #[test]
    fn clamping_respects_mechanical_limits() {
        let fx = Fixture {
            tilt_min_deg: -30.0,
            tilt_max_deg: 30.0,
            ..plain_fixture()
        };
        let (_, tilt) = apply_fixture_frame(0.0, 80.0, &fx);
        assert_eq!(tilt, 30.0);
        let (_, tilt) = apply_fixture_frame(0.0, -80.0, &fx);
        assert_eq!(tilt, -30.0);
    }

    #[test]
    fn pan_slew_takes_the_short_arc_through_180() {
        // shortest arc from 170 to −170 is +20; with 20°/s and dt = 1 s the
        // whole move fits in one step
        assert_eq!(slew_pan(170.0, -170.0, 20.0, 1.0), -170.0);
        // a tighter limit clamps the step, passing through 180
        assert_eq!(slew_pan(170.0, -170.0, 10.0, 1.0), 180.0);
        // and never goes the long way around
        assert_eq!(slew_pan(170.0, -170.0, 5.0, 1.0), 175.0);
    }

    #[test]
    fn tilt_slew_never_wraps() {
        // 340° apart on a circle would wrap; tilt walks the full distance
        assert_eq!(slew_tilt(170.0, -170.0, 20.0, 1.0), 150.0);
        assert_eq!(slew_tilt(0.0, 45.0, 10.0, 1.0), 10.0);
        assert_eq!(slew_tilt(0.0, 5.0, 10.0, 1.0), 5.0);
    }

    #[test]
    fn zero_rate_means_no_limit() {
        assert_eq!(slew_pan(0.0, 120.0, 0.0, 1.0), 120.0);
        assert_eq!(slew_tilt(0.0, 120.0, 0.0, 1.0), 120.0);
        assert_eq!(slew_pan(0.0, 120.0, -5.0, 1.0), 120.0);
    }
}
