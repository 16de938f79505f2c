//! Degradation interpolator: (SSP, habitat, year) → habitat-loss range.
//!
//! Piecewise-linear in time. The baseline year carries zero loss; years
//! before the first anchor interpolate from the baseline, years between
//! anchors interpolate between them, and years past the last anchor clamp.

use crate::error::LookupError;
use crate::model::Ssp;
use crate::reference::{DegradationRange, ReferenceTables};

fn lerp(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if (x1 - x0).abs() < f64::EPSILON {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Shared rule for any anchored yearly series that starts at zero in the
/// baseline year.
fn interpolate_series<T: Copy>(
    baseline_year: i32,
    anchors: &[(i32, T)],
    year: i32,
    zero: T,
    mix: impl Fn(T, T, f64) -> T,
) -> T {
    let Some(&(first_year, first)) = anchors.first() else {
        return zero;
    };
    if year <= baseline_year {
        return zero;
    }
    if year <= first_year {
        let t = lerp(baseline_year as f64, 0.0, first_year as f64, 1.0, year as f64);
        return mix(zero, first, t);
    }
    for w in anchors.windows(2) {
        let (y0, v0) = w[0];
        let (y1, v1) = w[1];
        if year <= y1 {
            let t = lerp(y0 as f64, 0.0, y1 as f64, 1.0, year as f64);
            return mix(v0, v1, t);
        }
    }
    anchors[anchors.len() - 1].1
}

/// Habitat-loss fraction range for `habitat` under `ssp` in `year`.
pub fn interpolate(
    tables: &ReferenceTables,
    ssp: Ssp,
    habitat: &str,
    year: i32,
) -> Result<DegradationRange, LookupError> {
    let anchors: Vec<(i32, DegradationRange)> = tables
        .anchors_for(ssp, habitat)?
        .iter()
        .map(|a| (a.year, a.range))
        .collect();
    Ok(interpolate_series(
        tables.baseline_year,
        &anchors,
        year,
        DegradationRange::NONE,
        |a, b, t| DegradationRange {
            low: a.low + (b.low - a.low) * t,
            high: a.high + (b.high - a.high) * t,
        },
    ))
}

/// Warming (°C above the baseline year) under `ssp` in `year`.
pub fn warming(tables: &ReferenceTables, ssp: Ssp, year: i32) -> f64 {
    let anchors = tables.warming.get(&ssp).map(Vec::as_slice).unwrap_or(&[]);
    interpolate_series(tables.baseline_year, anchors, year, 0.0, |a, b, t| a + (b - a) * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::habitat::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn anchor_year_returns_configured_range() {
        let t = ReferenceTables::builtin();
        let r = interpolate(&t, Ssp::Ssp245, CORAL_REEF, 2050).unwrap();
        assert!(close(r.low, 0.50) && close(r.high, 0.70));
    }

    #[test]
    fn baseline_year_has_no_loss() {
        let t = ReferenceTables::builtin();
        let r = interpolate(&t, Ssp::Ssp585, CORAL_REEF, 2025).unwrap();
        assert_eq!(r, DegradationRange::NONE);
        let r = interpolate(&t, Ssp::Ssp585, CORAL_REEF, 2010).unwrap();
        assert_eq!(r, DegradationRange::NONE);
    }

    #[test]
    fn end_of_century_and_beyond_clamp() {
        let t = ReferenceTables::builtin();
        let r = interpolate(&t, Ssp::Ssp585, CORAL_REEF, 2100).unwrap();
        assert!(close(r.low, 0.99) && close(r.high, 1.00));
        let r = interpolate(&t, Ssp::Ssp585, CORAL_REEF, 2150).unwrap();
        assert!(close(r.low, 0.99) && close(r.high, 1.00));
    }

    #[test]
    fn interpolates_before_and_between_anchors() {
        let t = ReferenceTables::builtin();
        // halfway from 2025 (0, 0) to 2050 (0.50, 0.70)
        let r = interpolate(&t, Ssp::Ssp245, CORAL_REEF, 2037).unwrap();
        let frac = 12.0 / 25.0;
        assert!(close(r.low, 0.50 * frac) && close(r.high, 0.70 * frac));
        // halfway from 2050 (0.50, 0.70) to 2100 (0.90, 0.99)
        let r = interpolate(&t, Ssp::Ssp245, CORAL_REEF, 2075).unwrap();
        assert!(close(r.low, 0.70) && close(r.high, 0.845));
    }

    #[test]
    fn unknown_habitat_is_signalled() {
        let t = ReferenceTables::builtin();
        assert!(matches!(
            interpolate(&t, Ssp::Ssp126, SALT_MARSH, 2050),
            Err(LookupError::UnknownHabitat(_))
        ));
    }

    #[test]
    fn warming_follows_anchors() {
        let t = ReferenceTables::builtin();
        assert!(close(warming(&t, Ssp::Ssp245, 2025), 0.0));
        assert!(close(warming(&t, Ssp::Ssp245, 2050), 0.8));
        assert!(close(warming(&t, Ssp::Ssp585, 2075), 2.15));
    }
}
