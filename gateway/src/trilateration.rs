//! Damped Gauss–Newton trilateration.
//!
//! Minimizes Σ (‖x − aᵢ‖ − dᵢ)² over 3-D position x given station positions
//! aᵢ and measured distances dᵢ, with a Levenberg-style λ schedule on the
//! normal equations and a single worst-station drop when the residual gate
//! fails. The 3×3 damped system is solved by Cramer's rule; conditioning is
//! checked on the undamped normal matrix so degenerate geometry (collinear
//! stations) is reported as `singular` instead of wandering.
//!
//! The solver is generic over the station key: the tracking engine keys by
//! anchor MAC, the calibration solve reuses it with venue-point ids as
//! stations to re-estimate an anchor position.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Tuning knobs. Distances and positions are centimeters; the residual gate
/// is meters.
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub max_iter: u32,
    pub eps_step_cm: f64,
    pub resid_max_m: f64,
    pub d_min_cm: f64,
    pub d_max_cm: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iter: 12,
            eps_step_cm: 0.2,
            resid_max_m: 5.0,
            d_min_cm: 1.0,
            d_max_cm: 200_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveFailure {
    /// Fewer than four usable stations after input rejection.
    InsufficientAnchors,
    /// Normal matrix is numerically rank-deficient (degenerate geometry).
    Singular,
    /// Converged, but the RMS residual exceeds the gate.
    ResidGated,
}

impl fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InsufficientAnchors => "insufficient_anchors",
            Self::Singular => "singular",
            Self::ResidGated => "resid_gated",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Solve<K> {
    /// Estimated position, cm. `None` when `reason` is set.
    pub position_cm: Option<[f64; 3]>,
    /// Stations that contributed to the final estimate.
    pub anchors_used: Vec<K>,
    /// RMS range residual at the final estimate, meters.
    pub residual_m: f64,
    pub iterations: u32,
    /// Stations dropped by the outlier pass.
    pub outliers: Vec<K>,
    pub reason: Option<SolveFailure>,
}

// ── 3×3 linear algebra ────────────────────────────────────────────────────────

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn cramer(m: &[[f64; 3]; 3], rhs: &[f64; 3], det: f64) -> [f64; 3] {
    let mut out = [0.0; 3];
    for col in 0..3 {
        let mut mc = *m;
        for row in 0..3 {
            mc[row][col] = rhs[row];
        }
        out[col] = det3(&mc) / det;
    }
    out
}

fn residual_norm(stations: &[([f64; 3], f64)], x: &[f64; 3]) -> f64 {
    stations
        .iter()
        .map(|(a, d)| {
            let r = dist(x, a) - d;
            r * r
        })
        .sum::<f64>()
        .sqrt()
}

fn rms_m(stations: &[([f64; 3], f64)], x: &[f64; 3]) -> f64 {
    let sum: f64 = stations
        .iter()
        .map(|(a, d)| {
            let r = dist(x, a) - d;
            r * r
        })
        .sum();
    (sum / stations.len() as f64).sqrt() / 100.0
}

fn dist(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

// ── Descent ───────────────────────────────────────────────────────────────────

struct Pass {
    x: [f64; 3],
    rms_m: f64,
    iterations: u32,
}

/// One damped descent over a fixed station set. `Err` carries the iteration
/// count at which the normal matrix went rank-deficient.
fn descend(
    stations: &[([f64; 3], f64)],
    initial: Option<[f64; 3]>,
    max_iter: u32,
    eps_step_cm: f64,
) -> Result<Pass, u32> {
    let mut x = initial.unwrap_or_else(|| {
        let n = stations.len() as f64;
        let mut c = [0.0; 3];
        for (a, _) in stations {
            c[0] += a[0] / n;
            c[1] += a[1] / n;
            c[2] += a[2] / n;
        }
        c
    });

    let mut lambda = 1e-3;
    let mut it = 0;
    while it < max_iter {
        it += 1;

        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        for (a, d) in stations {
            let pred = dist(&x, a).max(1e-6);
            let r = pred - d;
            let j = [(x[0] - a[0]) / pred, (x[1] - a[1]) / pred, (x[2] - a[2]) / pred];
            for row in 0..3 {
                for col in 0..3 {
                    jtj[row][col] += j[row] * j[col];
                }
                jtr[row] += j[row] * r;
            }
        }

        // Conditioning check on the undamped matrix: damping would mask a
        // rank-deficient geometry and let the iteration wander.
        if det3(&jtj).abs() < 1e-12 {
            return Err(it);
        }

        let mut damped = jtj;
        for diag in 0..3 {
            damped[diag][diag] += lambda;
        }
        let det = det3(&damped);
        if det.abs() < 1e-12 {
            return Err(it);
        }

        let rhs = [-jtr[0], -jtr[1], -jtr[2]];
        let delta = cramer(&damped, &rhs, det);
        let candidate = [x[0] + delta[0], x[1] + delta[1], x[2] + delta[2]];

        if residual_norm(stations, &candidate) < residual_norm(stations, &x) {
            x = candidate;
            lambda = (lambda / 10.0).max(1e-9);
            let step = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();
            if step < eps_step_cm {
                break;
            }
        } else {
            lambda *= 10.0;
        }
    }

    Ok(Pass {
        rms_m: rms_m(stations, &x),
        x,
        iterations: it,
    })
}

// ── Public solve ──────────────────────────────────────────────────────────────

/// Solve a 3-D position from station positions and measured distances, cm.
///
/// Stations with no known position or a distance outside
/// `[d_min_cm, d_max_cm]` are rejected up front. At least four usable
/// stations are required. When the residual gate fails and enough stations
/// remain, the worst one is dropped once and a short refinement pass runs on
/// the reduced set, seeded with the current estimate.
pub fn solve_3d<K>(
    positions: &HashMap<K, [f64; 3]>,
    distances_cm: &HashMap<K, f64>,
    initial_cm: Option<[f64; 3]>,
    opts: &SolveOptions,
) -> Solve<K>
where
    K: Clone + Eq + Hash + Ord,
{
    let mut keys: Vec<K> = distances_cm
        .iter()
        .filter(|(k, d)| {
            positions.contains_key(*k) && **d >= opts.d_min_cm && **d <= opts.d_max_cm
        })
        .map(|(k, _)| k.clone())
        .collect();
    keys.sort();

    if keys.len() < 4 {
        return Solve {
            position_cm: None,
            anchors_used: keys,
            residual_m: f64::INFINITY,
            iterations: 0,
            outliers: vec![],
            reason: Some(SolveFailure::InsufficientAnchors),
        };
    }

    let mut stations: Vec<([f64; 3], f64)> = keys
        .iter()
        .map(|k| (positions[k], distances_cm[k]))
        .collect();

    let mut outliers = Vec::new();
    let pass = match descend(&stations, initial_cm, opts.max_iter, opts.eps_step_cm) {
        Ok(p) => p,
        Err(iterations) => {
            return Solve {
                position_cm: None,
                anchors_used: keys,
                residual_m: f64::INFINITY,
                iterations,
                outliers,
                reason: Some(SolveFailure::Singular),
            }
        }
    };
    let mut x = pass.x;
    let mut residual_m = pass.rms_m;
    let mut iterations = pass.iterations;

    if residual_m > opts.resid_max_m && stations.len() >= 4 {
        // Drop the station that disagrees most and refine from where we are.
        let worst = stations
            .iter()
            .enumerate()
            .map(|(i, (a, d))| (i, (dist(&x, a) - d).abs()))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        outliers.push(keys.remove(worst));
        stations.remove(worst);

        let refine_iter = (opts.max_iter / 2).max(1);
        match descend(&stations, Some(x), refine_iter, opts.eps_step_cm) {
            Ok(p) => {
                x = p.x;
                residual_m = p.rms_m;
                iterations += p.iterations;
            }
            Err(extra) => {
                return Solve {
                    position_cm: None,
                    anchors_used: keys,
                    residual_m,
                    iterations: iterations + extra,
                    outliers,
                    reason: Some(SolveFailure::Singular),
                }
            }
        }
    }

    if residual_m > opts.resid_max_m {
        return Solve {
            position_cm: None,
            anchors_used: keys,
            residual_m,
            iterations,
            outliers,
            reason: Some(SolveFailure::ResidGated),
        };
    }

    Solve {
        position_cm: Some(x),
        anchors_used: keys,
        residual_m,
        iterations,
        outliers,
        reason: None,
    }
}
