//! CPV estimator — the closed-form solver.
//!
//! Pure functions only: no I/O, no locking, no async. Given the measured
//! pairwise sums from the MP protocol and the inter-verifier delays from
//! the AV protocol, compute each verifier's estimated client OWD and the
//! inside/outside triangle decision.
//!
//! Grounded directly in `cpv.py` (`calculate_owds_mp`,
//! `calculate_verifier_owds`, `area_of_triangle`, `is_client_within_triangle`)
//! from the original Python implementation: same equations, same
//! asymmetric `dv[(i,j)]`-only orientation (§9(c) of the spec), same
//! 200 km/ms scale constant and 20% tolerance.

use std::collections::HashMap;

/// Verifier index: 1, 2, or 3. The estimator assumes exactly three.
pub type Idx = u8;

/// The canonical ordered triple of verifier pairs the system is defined over.
pub const CANONICAL_PAIRS: [(Idx, Idx); 3] = [(1, 2), (2, 3), (3, 1)];

/// 1 ms of one-way delay is treated as 200 km of distance. This is an
/// intentional monotone rescale for the planar geometry test — the
/// inside/outside decision is scale-invariant, so the constant's absolute
/// value doesn't matter, only that it's applied uniformly. Preserved here
/// for log/behavior compatibility rather than re-derived.
pub const DISTANCE_SCALE_KM_PER_MS: f64 = 200.0;

/// Fixed tolerance compensating for LAN-scale measurement noise.
pub const INSIDE_TOLERANCE: f64 = 0.2;

/// Result of the CPV estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct CpvResult {
    /// Estimated client→verifier OWD for each verifier, in seconds.
    /// May be negative if the measurements are inconsistent; callers that
    /// want to reject negative estimates should check themselves — the
    /// estimator returns them verbatim (§4.5/§7).
    pub x: HashMap<Idx, f64>,
    /// Inter-verifier OWD used for each pair, in seconds (orientation
    /// preserved: only `dv[(i,j)]` is ever read, never `dv[(j,i)]`).
    pub y: HashMap<Idx, f64>,
    /// Area (after km rescale) of the verifier triangle.
    pub area_v: f64,
    /// Area (after km rescale) summed over the three client-verifier triangles.
    pub area_c: f64,
    /// Whether the client is judged to be inside the verifier triangle.
    pub inside: bool,
}

/// Solve `x1 + x2 = m12, x2 + x3 = m23, x3 + x1 = m31` for per-verifier
/// client OWDs, given the MP protocol's min-symmetrized sums `e`.
///
/// `e` maps an ordered pair `(i, j)` to `MinSum{i,j}` — a missing entry is
/// treated as `+infinity` on the `min(e_ij, e_ji)` step, matching the
/// Python reference.
pub fn calculate_owds_mp(e: &HashMap<(Idx, Idx), f64>) -> HashMap<Idx, f64> {
    let mut m = HashMap::new();
    for &(i, j) in &CANONICAL_PAIRS {
        let e_ij = *e.get(&(i, j)).unwrap_or(&f64::INFINITY);
        let e_ji = *e.get(&(j, i)).unwrap_or(&f64::INFINITY);
        m.insert((i, j), e_ij.min(e_ji));
    }

    let m12 = *m.get(&(1, 2)).unwrap_or(&0.0);
    let m23 = *m.get(&(2, 3)).unwrap_or(&0.0);
    let m31 = *m.get(&(3, 1)).unwrap_or(&0.0);

    let x1 = (m12 + m31 - m23) / 2.0;
    let x2 = m12 - x1;
    let x3 = m31 - x1;

    HashMap::from([(1, x1), (2, x2), (3, x3)])
}

/// Select the measured inter-verifier OWD for each canonical pair.
///
/// Preserves the original's asymmetric orientation exactly: `yi` for
/// index `i` is `dv[(i, j)]` for the canonical pair `(i, j)` — `dv[(j, i)]`
/// is never consulted, even if present.
pub fn calculate_verifier_owds(dv: &HashMap<(Idx, Idx), f64>) -> HashMap<Idx, f64> {
    CANONICAL_PAIRS
        .iter()
        .map(|&(i, j)| (i, *dv.get(&(i, j)).unwrap_or(&f64::INFINITY)))
        .collect()
}

/// Heron's formula. Returns 0 for a degenerate/impossible triangle
/// (non-positive radicand) rather than NaN.
pub fn area_of_triangle(a: f64, b: f64, c: f64) -> f64 {
    let s = (a + b + c) / 2.0;
    let area_sq = s * (s - a) * (s - b) * (s - c);
    if area_sq <= 0.0 {
        0.0
    } else {
        area_sq.sqrt()
    }
}

/// Run the full estimator: MP sums + AV delays → `x`, `y`, and the
/// inside/outside decision.
pub fn cpv(e: &HashMap<(Idx, Idx), f64>, dv: &HashMap<(Idx, Idx), f64>) -> CpvResult {
    let x = calculate_owds_mp(e);
    let y = calculate_verifier_owds(dv);

    let to_km = |secs: f64| secs * 1000.0 * DISTANCE_SCALE_KM_PER_MS;

    let sides_v = [
        to_km(*y.get(&1).unwrap_or(&0.0)),
        to_km(*y.get(&2).unwrap_or(&0.0)),
        to_km(*y.get(&3).unwrap_or(&0.0)),
    ];
    let area_v = area_of_triangle(sides_v[0], sides_v[1], sides_v[2]);

    let area_c: f64 = CANONICAL_PAIRS
        .iter()
        .map(|&(i, j)| {
            let a = to_km(*x.get(&i).unwrap_or(&0.0));
            let b = to_km(*x.get(&j).unwrap_or(&0.0));
            let c = to_km(*y.get(&i).unwrap_or(&0.0));
            area_of_triangle(a, b, c)
        })
        .sum();

    // Estimator degeneracy: A_v == 0 defaults to "outside" (§7).
    let inside = area_v > 0.0 && (area_c - area_v).abs() <= INSIDE_TOLERANCE * area_v;

    CpvResult {
        x,
        y,
        area_v,
        area_c,
        inside,
    }
}
