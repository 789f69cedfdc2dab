//! `PoiService` backed by the OpenStreetMap Overpass API.
//!
//! One POST per category with an Overpass QL query of the form
//! `node["amenity"="police"](around:<radius_m>,<lat>,<lng>);out;`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{PoiHit, PoiService};
use crate::directory::geo::Position;
use crate::directory::registry::LocationCategory;
use crate::error::{HavenError, Result};

pub const DEFAULT_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";

pub struct OverpassPoiService {
    client: reqwest::Client,
    endpoint: String,
}

impl OverpassPoiService {
    /// # Errors
    /// Fails only if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("haven/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HavenError::PoiQuery(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// OSM `amenity` tag searched for each category.
pub fn amenity_for(category: LocationCategory) -> &'static str {
    match category {
        LocationCategory::Police => "police",
        LocationCategory::Hospital => "hospital",
        LocationCategory::SafeSpace => "social_facility",
    }
}

pub fn build_query(center: Position, radius_m: u32, category: LocationCategory) -> String {
    format!(
        "[out:json][timeout:10];node[\"amenity\"=\"{}\"](around:{},{:.6},{:.6});out;",
        amenity_for(category),
        radius_m,
        center.lat,
        center.lng
    )
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

/// Decode an Overpass JSON body. Elements without coordinates are skipped.
pub fn parse_elements(body: &str, category: LocationCategory) -> Result<Vec<PoiHit>> {
    let response: OverpassResponse = serde_json::from_str(body)?;
    Ok(response
        .elements
        .into_iter()
        .filter_map(|el| {
            let (lat, lng) = (el.lat?, el.lon?);
            let name = el
                .tags
                .get("name")
                .cloned()
                .unwrap_or_else(|| format!("Unnamed {category}"));
            let address = [el.tags.get("addr:street"), el.tags.get("addr:city")]
                .into_iter()
                .flatten()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let address = if address.is_empty() {
                Position::new(lat, lng).display_coords()
            } else {
                address
            };
            Some(PoiHit {
                name,
                lat,
                lng,
                address,
            })
        })
        .collect())
}

#[async_trait]
impl PoiService for OverpassPoiService {
    async fn query(
        &self,
        center: Position,
        radius_m: u32,
        category: LocationCategory,
    ) -> Result<Vec<PoiHit>> {
        let query = build_query(center, radius_m, category);
        debug!(%category, radius_m, "overpass query");

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("data", query.as_str())])
            .send()
            .await
            .map_err(|e| HavenError::PoiQuery(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HavenError::PoiQuery(format!("overpass returned HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| HavenError::PoiQuery(e.to_string()))?;
        let hits = parse_elements(&body, category)?;
        debug!(%category, hits = hits.len(), "overpass answered");
        Ok(hits)
    }
}
