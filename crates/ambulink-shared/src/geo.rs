//! Spherical-earth helpers used when an ambulance reports a new position.

use crate::constants::EARTH_RADIUS_M;
use crate::types::Location;

/// Initial great-circle bearing from `from` to `to`, in degrees clockwise
/// from true north, normalised to `[0, 360)`.
pub fn bearing(from: &Location, to: &Location) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlon = (to.longitude - from.longitude).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();

    let degrees = y.atan2(x).to_degrees();
    (degrees + 360.0) % 360.0
}

/// Haversine distance in meters.
pub fn distance(from: &Location, to: &Location) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (to.longitude - from.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn cardinal_bearings() {
        let origin = Location::new(0.0, 0.0);
        assert!(close(bearing(&origin, &Location::new(1.0, 0.0)), 0.0));
        assert!(close(bearing(&origin, &Location::new(0.0, 1.0)), 90.0));
        assert!(close(bearing(&origin, &Location::new(-1.0, 0.0)), 180.0));
        assert!(close(bearing(&origin, &Location::new(0.0, -1.0)), 270.0));
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = distance(&Location::new(0.0, 0.0), &Location::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0);
    }
}
