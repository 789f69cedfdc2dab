//! Safe-location records and the built-in seed registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::geo::Position;

/// Kind of place a person can go to for help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationCategory {
    Police,
    Hospital,
    SafeSpace,
}

impl LocationCategory {
    /// Categories fetched from the points-of-interest service on every position update.
    pub const DYNAMIC: [LocationCategory; 2] = [LocationCategory::Police, LocationCategory::Hospital];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Police => "police",
            Self::Hospital => "hospital",
            Self::SafeSpace => "safe_space",
        }
    }
}

impl fmt::Display for LocationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "police" => Ok(Self::Police),
            "hospital" | "hospitals" => Ok(Self::Hospital),
            "safe_space" | "safe-space" | "safespace" | "shelter" => Ok(Self::SafeSpace),
            other => Err(format!("unknown location category: {other}")),
        }
    }
}

/// A place in the directory, either from the static registry or a live POI hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeLocation {
    pub id: String,
    pub name: String,
    pub category: LocationCategory,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub phone: Option<String>,
    pub verified: bool,
    pub hours: String,
}

impl SafeLocation {
    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lng)
    }

    /// Maps search link for the address.
    pub fn directions_url(&self) -> String {
        directions_url(&self.address)
    }

    /// `tel:` URI for the phone number, if the location has one.
    pub fn dial_uri(&self) -> Option<String> {
        self.phone.as_deref().map(dial_uri)
    }
}

/// A location annotated with its distance from a reference position.
///
/// `distance_km` is `None` when the query had no reference position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedLocation {
    #[serde(flatten)]
    pub location: SafeLocation,
    pub distance_km: Option<f64>,
}

impl RankedLocation {
    pub fn rank(location: SafeLocation, reference: Option<&Position>) -> Self {
        let distance_km = reference.map(|p| p.distance_km(&location.position()));
        Self {
            location,
            distance_km,
        }
    }
}

pub fn directions_url(address: &str) -> String {
    format!(
        "https://www.google.com/maps/search/{}",
        urlencoding::encode(address.trim())
    )
}

pub fn dial_uri(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| !c.is_whitespace()).collect();
    format!("tel:{digits}")
}

/// Seed registry: verified locations around Nairobi.
///
/// Illustrative data; real deployments inject their own registry through
/// `DirectoryConfig::registry`.
pub fn default_registry() -> Vec<SafeLocation> {
    let entry = |id: &str,
                 name: &str,
                 category: LocationCategory,
                 address: &str,
                 lat: f64,
                 lng: f64,
                 phone: &str,
                 hours: &str| SafeLocation {
        id: id.into(),
        name: name.into(),
        category,
        address: address.into(),
        lat,
        lng,
        phone: Some(phone.into()),
        verified: true,
        hours: hours.into(),
    };

    vec![
        entry(
            "1",
            "Kabete Police Station",
            LocationCategory::Police,
            "123 Main Street, Downtown",
            -1.2647,
            36.7156,
            "+1-555-POLICE",
            "24/7",
        ),
        entry(
            "2",
            "City General Hospital",
            LocationCategory::Hospital,
            "456 Health Avenue",
            -1.2620,
            36.8000,
            "+1-555-HOSPITAL",
            "24/7",
        ),
        entry(
            "3",
            "Women's Shelter & Support Center",
            LocationCategory::SafeSpace,
            "789 Safety Street",
            -1.2700,
            36.7900,
            "+1-555-SHELTER",
            "24/7 Hotline",
        ),
        entry(
            "4",
            "Community Safety Center",
            LocationCategory::SafeSpace,
            "321 Community Lane",
            -1.2500,
            36.7800,
            "+1-555-COMMUNITY",
            "8 AM - 10 PM",
        ),
        entry(
            "5",
            "North District Hospital",
            LocationCategory::Hospital,
            "654 North Road",
            -1.2400,
            36.7700,
            "+1-555-NORTH",
            "24/7",
        ),
    ]
}
