//! Small geographic helpers used for cache keys and cache invalidation.

use crate::types::Coordinates;

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Round `v` to `decimals` places. Negative zero is folded into zero so
/// `-0.0004` and `0.0004` land on the same key.
pub fn round_to(v: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let r = (v * factor).round() / factor;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: &Coordinates, b: &Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_folds_negative_zero() {
        assert_eq!(round_to(-0.0004, 3).to_string(), "0");
        assert_eq!(round_to(40.71284, 3), 40.713);
    }

    #[test]
    fn haversine_nyc_to_la_is_about_3940km() {
        let nyc = Coordinates::new(40.7128, -74.0060);
        let la = Coordinates::new(34.0522, -118.2437);
        let d = haversine_km(&nyc, &la);
        assert!((d - 3936.0).abs() < 15.0, "got {d}");
    }

    #[test]
    fn haversine_same_point_is_zero() {
        let p = Coordinates::new(51.5, -0.12);
        assert!(haversine_km(&p, &p) < 1e-9);
    }
}
