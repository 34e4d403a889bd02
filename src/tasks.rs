use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;

const TASK_ID_BYTES: usize = 32;

/// One "search near point" unit of work.
///
/// Coordinates are WGS84 degrees, the radius is in meters. Tasks are owned by
/// whichever queue holds them; a worker only ever bumps `attempts` on its
/// in-flight copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
    pub task_id: String,
    pub lon: f64,
    pub lat: f64,
    pub radius: f64,
    pub place_type: String,
    #[serde(default)]
    pub attempts: u32,
}

impl SearchTask {
    pub fn new(lon: f64, lat: f64, radius: f64, place_type: impl Into<String>) -> AppResult<Self> {
        Self::with_id(generate_task_id(), lon, lat, radius, place_type)
    }

    pub fn with_id(
        task_id: impl Into<String>,
        lon: f64,
        lat: f64,
        radius: f64,
        place_type: impl Into<String>,
    ) -> AppResult<Self> {
        let task_id = task_id.into();
        if task_id.trim().is_empty() {
            return Err(AppError::Config("search task id must not be empty".into()));
        }
        if !(radius.is_finite() && radius > 0.0) {
            return Err(AppError::Config(format!(
                "search radius must be positive, got {radius}"
            )));
        }
        if !(lon.is_finite() && lat.is_finite()) {
            return Err(AppError::Config(format!(
                "search center must be finite, got ({lon}, {lat})"
            )));
        }
        Ok(Self::spawn_unchecked(task_id, lon, lat, radius, place_type.into()))
    }

    /// Child tasks produced by subdivision inherit a positive radius and
    /// finite coordinates from the projection, so they skip validation.
    pub(crate) fn derived(lon: f64, lat: f64, radius: f64, place_type: &str) -> Self {
        Self::spawn_unchecked(generate_task_id(), lon, lat, radius, place_type.to_string())
    }

    fn spawn_unchecked(
        task_id: String,
        lon: f64,
        lat: f64,
        radius: f64,
        place_type: String,
    ) -> Self {
        Self {
            task_id,
            lon,
            lat,
            radius,
            place_type,
            attempts: 0,
        }
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.lon, self.lat)
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

pub fn generate_task_id() -> String {
    let mut bytes = [0_u8; TASK_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generates_unique_identifiers() {
        let ids: HashSet<String> = (0..500)
            .map(|_| SearchTask::new(27.58, 53.91, 650.0, "cafe").unwrap().task_id)
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn rejects_non_positive_radius() {
        assert!(SearchTask::new(27.58, 53.91, 0.0, "cafe").is_err());
        assert!(SearchTask::new(27.58, 53.91, -5.0, "cafe").is_err());
        assert!(SearchTask::new(27.58, 53.91, f64::NAN, "cafe").is_err());
    }

    #[test]
    fn keeps_provided_identifier() {
        let task = SearchTask::with_id("restored-1", 1.0, 2.0, 100.0, "bar").unwrap();
        assert_eq!(task.task_id, "restored-1");
        assert_eq!(task.attempts, 0);
        assert!(SearchTask::with_id("  ", 1.0, 2.0, 100.0, "bar").is_err());
    }

    #[test]
    fn counts_attempts() {
        let mut task = SearchTask::new(1.0, 2.0, 100.0, "bar").unwrap();
        task.record_attempt();
        task.record_attempt();
        assert_eq!(task.attempts, 2);
    }
}
