//! Service-sensitivity mapper: retained habitat → retained service value.

use crate::reference::{ReferenceTables, ServiceSensitivity};

/// Retained-habitat breakpoints shared by every curve, descending.
pub const HABITAT_BREAKPOINTS: [f64; 6] = [1.00, 0.90, 0.65, 0.30, 0.05, 0.00];

impl ServiceSensitivity {
    fn curve(&self) -> [(f64, f64); 6] {
        [
            (HABITAT_BREAKPOINTS[0], 1.0),
            (HABITAT_BREAKPOINTS[1], self.warning),
            (HABITAT_BREAKPOINTS[2], self.mmsy_upper),
            (HABITAT_BREAKPOINTS[3], self.mmsy_lower),
            (HABITAT_BREAKPOINTS[4], self.collapse),
            (HABITAT_BREAKPOINTS[5], 0.0),
        ]
    }

    /// Retained service fraction for retained habitat `r` (clamped to [0, 1]).
    pub fn retained(&self, r: f64) -> f64 {
        let r = if r.is_nan() { 0.0 } else { r.clamp(0.0, 1.0) };
        let pts = self.curve();
        for w in pts.windows(2) {
            let (x_hi, y_hi) = w[0];
            let (x_lo, y_lo) = w[1];
            if r >= x_lo {
                return y_lo + (y_hi - y_lo) * (r - x_lo) / (x_hi - x_lo);
            }
        }
        0.0
    }
}

/// Retained service fraction for `service_type`; identity when the service
/// has no curve.
pub fn retained_service_fraction(
    tables: &ReferenceTables,
    service_type: &str,
    retained_habitat: f64,
) -> f64 {
    match tables.service_sensitivity.get(service_type) {
        Some(curve) => curve.retained(retained_habitat),
        None => retained_habitat.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::service::*;

    #[test]
    fn breakpoints_hit_table_values() {
        let t = ReferenceTables::builtin();
        let s = t.service_sensitivity[TOURISM];
        assert!((s.retained(1.0) - 1.0).abs() < 1e-12);
        assert!((s.retained(0.90) - 0.85).abs() < 1e-12);
        assert!((s.retained(0.65) - 0.55).abs() < 1e-12);
        assert!((s.retained(0.30) - 0.20).abs() < 1e-12);
        assert!((s.retained(0.05) - 0.02).abs() < 1e-12);
        assert_eq!(s.retained(0.0), 0.0);
    }

    #[test]
    fn curves_are_continuous_and_non_decreasing() {
        let t = ReferenceTables::builtin();
        for (name, curve) in &t.service_sensitivity {
            let mut prev = curve.retained(0.0);
            for i in 1..=1000 {
                let r = i as f64 / 1000.0;
                let v = curve.retained(r);
                assert!(v + 1e-12 >= prev, "{} decreases at r={}", name, r);
                assert!(v - prev < 0.01, "{} jumps at r={}", name, r);
                prev = v;
            }
        }
    }

    #[test]
    fn unknown_service_degrades_one_to_one() {
        let t = ReferenceTables::builtin();
        assert_eq!(retained_service_fraction(&t, "cultural_heritage", 0.42), 0.42);
        assert_eq!(retained_service_fraction(&t, "cultural_heritage", 1.7), 1.0);
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let t = ReferenceTables::builtin();
        assert_eq!(retained_service_fraction(&t, FISHERIES, -0.2), 0.0);
        assert_eq!(retained_service_fraction(&t, FISHERIES, 1.2), 1.0);
    }
}
