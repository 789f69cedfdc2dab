//! Great-circle distance on a spherical Earth.
//!
//! Euclidean distance on raw lat/lng degrees is off by kilometres at city
//! scale (a degree of longitude shrinks with latitude), so ranking always
//! goes through Haversine.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the Haversine formula, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A position sample in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    /// Reported horizontal accuracy in metres, when the tracker knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    /// Great-circle distance to `other` in kilometres.
    pub fn distance_km(&self, other: &Position) -> f64 {
        haversine_km(self.lat, self.lng, other.lat, other.lng)
    }

    /// `"<lat>, <lng>"` with five decimals (≈1 m resolution).
    pub fn display_coords(&self) -> String {
        format!("{:.5}, {:.5}", self.lat, self.lng)
    }
}

/// Haversine distance between two lat/lng pairs (degrees), in kilometres.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push `a` past 1.0 near the antipode.
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
