use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaceValidationError {
    #[error("missing or empty required field `{0}`")]
    MissingField(&'static str),
    #[error("coordinate `{0}` is missing or not finite")]
    InvalidCoordinate(&'static str),
    #[error("malformed place payload: {0}")]
    Malformed(String),
    #[error("place `{0}` was never validated")]
    NotValidated(String),
}

/// Unvalidated place fields, as assembled from an API payload or by hand.
#[derive(Debug, Clone, Default)]
pub struct PlaceDraft {
    pub place_id: String,
    pub api_id: String,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub name: String,
    pub rating: Option<f64>,
    pub business_status: String,
    pub scope: String,
    pub user_ratings_total: Option<u64>,
    pub vicinity: String,
    pub types: Vec<String>,
    pub price_level: Option<i64>,
    pub raw: Value,
}

impl PlaceDraft {
    pub fn validate(self) -> Result<PlaceRecord, PlaceValidationError> {
        require("place_id", &self.place_id)?;
        require("id", &self.api_id)?;
        require("name", &self.name)?;
        require("scope", &self.scope)?;
        require("vicinity", &self.vicinity)?;
        require("business_status", &self.business_status)?;

        let types = self
            .types
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        require("types", &types)?;

        let lon = self
            .lon
            .filter(|value| value.is_finite())
            .ok_or(PlaceValidationError::InvalidCoordinate("lng"))?;
        let lat = self
            .lat
            .filter(|value| value.is_finite())
            .ok_or(PlaceValidationError::InvalidCoordinate("lat"))?;

        Ok(PlaceRecord {
            place_id: self.place_id,
            api_id: self.api_id,
            lon,
            lat,
            name: self.name,
            rating: self.rating,
            business_status: self.business_status,
            scope: self.scope,
            user_ratings_total: self.user_ratings_total.unwrap_or(0),
            vicinity: self.vicinity,
            types,
            price_level: self.price_level,
            raw: self.raw,
            validated: true,
        })
    }
}

fn require(field: &'static str, value: &str) -> Result<(), PlaceValidationError> {
    if value.trim().is_empty() {
        Err(PlaceValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

/// A discovered place. Only obtainable through [`PlaceDraft::validate`] or
/// [`PlaceRecord::from_payload`], and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRecord {
    place_id: String,
    api_id: String,
    lon: f64,
    lat: f64,
    name: String,
    rating: Option<f64>,
    business_status: String,
    scope: String,
    user_ratings_total: u64,
    vicinity: String,
    types: String,
    price_level: Option<i64>,
    raw: Value,
    validated: bool,
}

impl PlaceRecord {
    /// Decodes one entry of a nearby-search `results` array.
    pub fn from_payload(payload: Value) -> Result<Self, PlaceValidationError> {
        #[derive(Deserialize)]
        struct Payload {
            place_id: Option<String>,
            id: Option<String>,
            geometry: Option<Geometry>,
            name: Option<String>,
            rating: Option<f64>,
            business_status: Option<String>,
            scope: Option<String>,
            user_ratings_total: Option<u64>,
            vicinity: Option<String>,
            types: Option<Vec<String>>,
            price_level: Option<i64>,
        }

        #[derive(Deserialize)]
        struct Geometry {
            location: Option<Location>,
        }

        #[derive(Deserialize)]
        struct Location {
            lat: Option<f64>,
            lng: Option<f64>,
        }

        let parsed = Payload::deserialize(&payload)
            .map_err(|err| PlaceValidationError::Malformed(err.to_string()))?;
        let location = parsed.geometry.and_then(|geometry| geometry.location);

        PlaceDraft {
            place_id: parsed.place_id.unwrap_or_default(),
            api_id: parsed.id.unwrap_or_default(),
            lon: location.as_ref().and_then(|loc| loc.lng),
            lat: location.as_ref().and_then(|loc| loc.lat),
            name: parsed.name.unwrap_or_default(),
            rating: parsed.rating,
            business_status: parsed.business_status.unwrap_or_default(),
            scope: parsed.scope.unwrap_or_default(),
            user_ratings_total: parsed.user_ratings_total,
            vicinity: parsed.vicinity.unwrap_or_default(),
            types: parsed.types.unwrap_or_default(),
            price_level: parsed.price_level,
            raw: payload,
        }
        .validate()
    }

    pub fn is_valid(&self) -> bool {
        self.validated
    }

    pub fn place_id(&self) -> &str {
        &self.place_id
    }

    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rating(&self) -> Option<f64> {
        self.rating
    }

    pub fn business_status(&self) -> &str {
        &self.business_status
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn user_ratings_total(&self) -> u64 {
        self.user_ratings_total
    }

    pub fn vicinity(&self) -> &str {
        &self.vicinity
    }

    /// Comma-joined place types.
    pub fn types(&self) -> &str {
        &self.types
    }

    pub fn price_level(&self) -> Option<i64> {
        self.price_level
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    #[cfg(test)]
    pub(crate) fn into_unvalidated(mut self) -> Self {
        self.validated = false;
        self
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    use super::PlaceRecord;

    pub fn payload(place_id: &str) -> Value {
        json!({
            "place_id": place_id,
            "id": format!("api-{place_id}"),
            "geometry": { "location": { "lat": 53.91, "lng": 27.58 } },
            "name": format!("Cafe {place_id}"),
            "rating": 4.5,
            "business_status": "OPERATIONAL",
            "scope": "GOOGLE",
            "user_ratings_total": 120,
            "vicinity": "Nezavisimosti Ave 1",
            "types": ["cafe", "food", "point_of_interest"],
            "price_level": 2
        })
    }

    pub fn place(place_id: &str) -> PlaceRecord {
        PlaceRecord::from_payload(payload(place_id)).unwrap()
    }
}
