//! Geographic primitives used by subdivision and seed-grid generation.
//!
//! Searches are laid out in a local metric plane and then mapped back to
//! WGS84. The plane is an azimuthal equidistant projection on a sphere: any
//! distance or bearing measured from the projection origin is preserved, which
//! is exactly what "offset a child by N meters along bearing B" needs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Mean Earth radius (IUGG), meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

const DEGENERATE_DISTANCE: f64 = 1e-9;

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let d_phi = phi2 - phi1;
        let d_lambda = (other.lon - self.lon).to_radians();
        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// A position in a local metric plane: meters east (`x`) and north (`y`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub x: f64,
    pub y: f64,
}

impl MetricPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Moves `distance` meters along `bearing_deg`, measured clockwise from
    /// north.
    pub fn project(&self, distance: f64, bearing_deg: f64) -> MetricPoint {
        let bearing = bearing_deg.to_radians();
        MetricPoint {
            x: self.x + distance * bearing.sin(),
            y: self.y + distance * bearing.cos(),
        }
    }
}

/// Two-way transform between WGS84 and a metric plane.
pub trait MetricProjection {
    fn to_metric(&self, point: GeoPoint) -> MetricPoint;
    fn to_geographic(&self, point: MetricPoint) -> GeoPoint;
}

#[derive(Debug, Clone, Copy)]
pub struct AzimuthalEquidistant {
    origin: GeoPoint,
    sin_phi0: f64,
    cos_phi0: f64,
}

impl AzimuthalEquidistant {
    pub fn centered_on(origin: GeoPoint) -> Self {
        let phi0 = origin.lat.to_radians();
        Self {
            origin,
            sin_phi0: phi0.sin(),
            cos_phi0: phi0.cos(),
        }
    }
}

impl MetricProjection for AzimuthalEquidistant {
    fn to_metric(&self, point: GeoPoint) -> MetricPoint {
        let phi = point.lat.to_radians();
        let d_lambda = (point.lon - self.origin.lon).to_radians();
        let (sin_phi, cos_phi) = phi.sin_cos();

        let east = cos_phi * d_lambda.sin();
        let north = self.cos_phi0 * sin_phi - self.sin_phi0 * cos_phi * d_lambda.cos();
        let cos_c = self.sin_phi0 * sin_phi + self.cos_phi0 * cos_phi * d_lambda.cos();
        let sin_c = east.hypot(north);
        if sin_c < DEGENERATE_DISTANCE {
            return MetricPoint::new(0.0, 0.0);
        }

        let c = sin_c.atan2(cos_c);
        let scale = EARTH_RADIUS_M * c / sin_c;
        MetricPoint::new(scale * east, scale * north)
    }

    fn to_geographic(&self, point: MetricPoint) -> GeoPoint {
        let rho = point.x.hypot(point.y);
        if rho < DEGENERATE_DISTANCE {
            return self.origin;
        }

        let c = rho / EARTH_RADIUS_M;
        let (sin_c, cos_c) = c.sin_cos();
        let phi = (cos_c * self.sin_phi0 + point.y * sin_c * self.cos_phi0 / rho)
            .clamp(-1.0, 1.0)
            .asin();
        let lambda = (point.x * sin_c)
            .atan2(rho * self.cos_phi0 * cos_c - point.y * self.sin_phi0 * sin_c);

        GeoPoint::new(
            normalize_longitude(self.origin.lon + lambda.to_degrees()),
            phi.to_degrees(),
        )
    }
}

fn normalize_longitude(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.west + self.east) / 2.0,
            (self.south + self.north) / 2.0,
        )
    }

    pub fn corners(&self) -> [GeoPoint; 4] {
        [
            GeoPoint::new(self.west, self.south),
            GeoPoint::new(self.east, self.south),
            GeoPoint::new(self.east, self.north),
            GeoPoint::new(self.west, self.north),
        ]
    }
}

/// Parses `west,south,east,north`.
impl FromStr for BoundingBox {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| AppError::Config(format!("invalid bounding box `{value}`: {err}")))?;
        let &[west, south, east, north] = parts.as_slice() else {
            return Err(AppError::Config(format!(
                "bounding box `{value}` must have exactly four values"
            )));
        };
        if !(west < east && south < north) {
            return Err(AppError::Config(format!(
                "bounding box `{value}` is empty or inverted"
            )));
        }
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(AppError::Config(format!(
                "bounding box `{value}` has latitudes out of range"
            )));
        }
        Ok(Self::new(west, south, east, north))
    }
}
