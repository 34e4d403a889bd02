use thiserror::Error;

use crate::config::AppConfig;
use crate::geo::{AzimuthalEquidistant, MetricProjection};
use crate::tasks::SearchTask;

/// Bearings of the six outer children, degrees clockwise from north.
pub const CHILD_BEARINGS_DEG: [f64; 6] = [30.0, 90.0, 150.0, 210.0, 270.0, 330.0];
/// Outer child offset as a share of the parent radius (a 3:2 cut).
pub const CHILD_OFFSET_FACTOR: f64 = 0.6;
pub const DEFAULT_CENTER_RADIUS_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubdivideError {
    #[error("cannot subdivide radius {radius} m: children would not exceed the {min_allowed} m floor")]
    RecursionFloor { radius: f64, min_allowed: f64 },
}

/// Replaces a capped search disc with seven overlapping smaller discs: six on
/// a hexagon around the center plus one on the center itself.
#[derive(Debug, Clone)]
pub struct Subdivider {
    min_allowed_radius: f64,
    center_radius_fraction: f64,
}

impl Subdivider {
    pub fn new(min_allowed_radius: f64, center_radius_fraction: f64) -> Self {
        Self {
            min_allowed_radius: min_allowed_radius.max(0.0),
            center_radius_fraction: center_radius_fraction.clamp(0.1, 0.9),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.min_allowed_radius_m, config.center_radius_fraction)
    }

    pub fn subdivide(&self, task: &SearchTask) -> Result<Vec<SearchTask>, SubdivideError> {
        let child_radius = task.radius / 2.0;
        if child_radius <= self.min_allowed_radius {
            return Err(SubdivideError::RecursionFloor {
                radius: task.radius,
                min_allowed: self.min_allowed_radius,
            });
        }

        let projection = AzimuthalEquidistant::centered_on(task.center());
        let center = projection.to_metric(task.center());
        let offset = task.radius * CHILD_OFFSET_FACTOR;

        let mut children = CHILD_BEARINGS_DEG
            .iter()
            .map(|bearing| {
                let point = projection.to_geographic(center.project(offset, *bearing));
                SearchTask::derived(point.lon, point.lat, child_radius, &task.place_type)
            })
            .collect::<Vec<_>>();

        let center_point = projection.to_geographic(center);
        children.push(SearchTask::derived(
            center_point.lon,
            center_point.lat,
            task.radius * self.center_radius_fraction,
            &task.place_type,
        ));
        Ok(children)
    }
}

impl Default for Subdivider {
    fn default() -> Self {
        Self::new(6.0, DEFAULT_CENTER_RADIUS_FRACTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(radius: f64) -> SearchTask {
        SearchTask::new(27.58, 53.91, radius, "cafe").unwrap()
    }

    #[test]
    fn produces_seven_smaller_children() {
        let task = parent(650.0);
        let children = Subdivider::default().subdivide(&task).unwrap();
        assert_eq!(children.len(), 7);
        for child in &children {
            assert!(child.radius < task.radius);
            assert_eq!(child.place_type, "cafe");
            assert_eq!(child.attempts, 0);
            assert_ne!(child.task_id, task.task_id);
        }
        assert!(children[..6].iter().all(|child| child.radius == 325.0));
        assert_eq!(children[6].radius, 650.0 * DEFAULT_CENTER_RADIUS_FRACTION);
    }

    #[test]
    fn places_outer_children_on_hexagon() {
        let task = parent(650.0);
        let children = Subdivider::default().subdivide(&task).unwrap();
        for child in &children[..6] {
            let distance = task.center().distance_to(&child.center());
            assert!((distance - 390.0).abs() < 1e-3, "distance {distance}");
        }
        let center = children[6].center();
        assert!((center.lon - task.lon).abs() < 1e-9);
        assert!((center.lat - task.lat).abs() < 1e-9);
    }

    #[test]
    fn leaves_parent_untouched() {
        let task = parent(650.0);
        let before = task.clone();
        let _ = Subdivider::default().subdivide(&task).unwrap();
        assert_eq!(task, before);
    }

    #[test]
    fn stops_at_radius_floor() {
        let subdivider = Subdivider::new(6.0, 0.5);
        assert_eq!(
            subdivider.subdivide(&parent(12.0)).unwrap_err(),
            SubdivideError::RecursionFloor {
                radius: 12.0,
                min_allowed: 6.0
            }
        );
        assert!(subdivider.subdivide(&parent(11.0)).is_err());
        assert_eq!(subdivider.subdivide(&parent(12.5)).unwrap().len(), 7);
    }

    #[test]
    fn clamps_center_fraction() {
        let subdivider = Subdivider::new(1.0, 1.5);
        let children = subdivider.subdivide(&parent(100.0)).unwrap();
        assert!(children[6].radius < 100.0);
    }
}
