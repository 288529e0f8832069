//! world.rs — simulated rig geometry and tag motion.
//!
//! A rectangular venue with UWB anchors in the upper corners and tags moving
//! on a smooth closed path across the floor area. Pure math; the noise model
//! lives at the measurement step so the ground truth stays exact.

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use uwb_wire::Mac;

/// 3D point in venue coordinates, centimeters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn dist_cm(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct Anchor {
    pub mac: Mac,
    pub pos: Point,
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub mac: Mac,
    /// Phase offset so multiple tags spread out along the path.
    phase: f64,
}

/// Venue layout plus motion state.
pub struct World {
    pub anchors: Vec<Anchor>,
    pub tags: Vec<Tag>,
    width_cm: f64,
    depth_cm: f64,
    t_s: f64,
}

impl World {
    /// Anchors fill the four upper corners first, then wall midpoints.
    pub fn new(n_anchors: usize, n_tags: usize, width_cm: f64, depth_cm: f64, height_cm: f64) -> Self {
        let corner_spots = [
            (0.0, 0.0),
            (width_cm, 0.0),
            (0.0, depth_cm),
            (width_cm, depth_cm),
            (width_cm / 2.0, 0.0),
            (width_cm / 2.0, depth_cm),
            (0.0, depth_cm / 2.0),
            (width_cm, depth_cm / 2.0),
        ];
        let anchors = (0..n_anchors)
            .map(|i| {
                let (x, y) = corner_spots[i % corner_spots.len()];
                Anchor {
                    mac: Mac::parse(&format!("AABBCCDDEE{i:02X}")).unwrap(),
                    pos: Point { x, y, z: height_cm },
                }
            })
            .collect();
        let tags = (0..n_tags)
            .map(|j| Tag {
                mac: Mac::parse(&format!("112233445F{j:02X}")).unwrap(),
                phase: j as f64 * std::f64::consts::TAU / n_tags.max(1) as f64,
            })
            .collect();
        Self {
            anchors,
            tags,
            width_cm,
            depth_cm,
            t_s: 0.0,
        }
    }

    pub fn step(&mut self, dt_s: f64) {
        self.t_s += dt_s;
    }

    /// Ground-truth tag position: an ellipse over the floor at chest height,
    /// one lap roughly every 30 seconds.
    pub fn tag_position(&self, tag: &Tag) -> Point {
        let omega = std::f64::consts::TAU / 30.0;
        let a = self.t_s * omega + tag.phase;
        Point {
            x: self.width_cm / 2.0 + 0.35 * self.width_cm * a.cos(),
            y: self.depth_cm / 2.0 + 0.35 * self.depth_cm * a.sin(),
            z: 140.0,
        }
    }

    /// One noisy range measurement, meters. `bias_cm` models an uncalibrated
    /// antenna delay on a specific anchor.
    pub fn measure_m(
        &self,
        anchor: &Anchor,
        tag_pos: &Point,
        noise_cm: f64,
        bias_cm: f64,
        rng: &mut StdRng,
    ) -> f64 {
        let true_cm = anchor.pos.dist_cm(tag_pos);
        let noise = if noise_cm > 0.0 {
            Normal::new(0.0, noise_cm).map(|n| n.sample(rng)).unwrap_or(0.0)
        } else {
            0.0
        };
        ((true_cm + bias_cm + noise).max(1.0)) / 100.0
    }
}
