//! Spatial math for reference-to-target range.

/// Mean Earth radius in nautical miles.
pub const EARTH_RADIUS_NM: f64 = 3440.065;

/// Great-circle distance between two points in nautical miles.
///
/// Uses the haversine formula. Symmetric in its arguments and zero for
/// identical points.
pub fn haversine_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_NM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// A fixed point distances are measured from (receiver or user location).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReferencePoint {
    pub lat: f64,
    pub lon: f64,
}

impl ReferencePoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Range to a target in nautical miles, `None` for non-finite input.
    pub fn distance_to(&self, lat: f64, lon: f64) -> Option<f64> {
        let dist = haversine_nm(self.lat, self.lon, lat, lon);
        dist.is_finite().then_some(dist)
    }
}
