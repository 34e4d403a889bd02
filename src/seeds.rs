use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::{AzimuthalEquidistant, BoundingBox, GeoPoint, MetricPoint, MetricProjection};
use crate::tasks::SearchTask;

/// One row of an externally generated seed grid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedRow {
    pub lon: f64,
    pub lat: f64,
    pub radius: f64,
    pub category: String,
}

/// Reads `lon,lat,radius,category` rows. A first line whose first cell is not
/// a number is taken as a header.
pub fn read_seed_csv(path: &Path) -> AppResult<Vec<SearchTask>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(false)
        .from_path(path)?;

    let mut tasks = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let line = index + 1;
        if index == 0 && is_header(&record) {
            continue;
        }
        let row: SeedRow = record.deserialize(None).map_err(|err| {
            AppError::Config(format!("{}:{line}: invalid seed row: {err}", path.display()))
        })?;
        let task = SearchTask::new(row.lon, row.lat, row.radius, row.category).map_err(|err| {
            AppError::Config(format!("{}:{line}: {err}", path.display()))
        })?;
        tasks.push(task);
    }
    info!(path = %path.display(), count = tasks.len(), "loaded seed tasks");
    Ok(tasks)
}

fn is_header(record: &csv::StringRecord) -> bool {
    record
        .get(0)
        .map(|cell| cell.parse::<f64>().is_err())
        .unwrap_or(false)
}

/// Square grid of centers covering `bbox`. Adjacent discs of `radius` touch
/// along the diagonal, so the spacing is `radius * sqrt(2)`.
pub fn grid_over_bbox(bbox: &BoundingBox, radius: f64) -> AppResult<Vec<GeoPoint>> {
    if !(radius.is_finite() && radius > 0.0) {
        return Err(AppError::Config(format!(
            "grid radius must be positive, got {radius}"
        )));
    }
    let projection = AzimuthalEquidistant::centered_on(bbox.center());
    let corners = bbox.corners().map(|corner| projection.to_metric(corner));
    let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

    let spacing = radius * std::f64::consts::SQRT_2;
    let columns = ((max_x - min_x) / spacing).ceil().max(1.0) as usize;
    let rows = ((max_y - min_y) / spacing).ceil().max(1.0) as usize;

    let mut points = Vec::with_capacity(columns * rows);
    for row in 0..rows {
        for column in 0..columns {
            let metric = MetricPoint::new(
                min_x + spacing * (column as f64 + 0.5),
                min_y + spacing * (row as f64 + 0.5),
            );
            points.push(projection.to_geographic(metric));
        }
    }
    Ok(points)
}

/// Crosses every grid point with every place type.
pub fn seed_tasks(
    points: &[GeoPoint],
    radius: f64,
    place_types: &[String],
) -> AppResult<Vec<SearchTask>> {
    points
        .iter()
        .flat_map(|point| {
            place_types.iter().map(move |place_type| {
                SearchTask::new(point.lon, point.lat, radius, place_type.as_str())
            })
        })
        .collect()
}

/// The seed batch for a fresh session: the CSV file when configured, the
/// built-in grid otherwise.
pub fn initial_tasks(config: &AppConfig, place_types: &[String]) -> AppResult<Vec<SearchTask>> {
    if let Some(path) = &config.seeds_file {
        return read_seed_csv(path);
    }
    let bbox = config.aoi_bbox.ok_or_else(|| {
        AppError::Config("either SEEDS_FILE or AOI_BBOX must be set for a new session".into())
    })?;
    let points = grid_over_bbox(&bbox, config.initial_radius_m)?;
    let tasks = seed_tasks(&points, config.initial_radius_m, place_types)?;
    info!(
        points = points.len(),
        place_types = place_types.len(),
        tasks = tasks.len(),
        "generated seed grid"
    );
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn reads_csv_with_and_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let with_header = dir.path().join("with.csv");
        fs::write(
            &with_header,
            "lon,lat,radius,category\n27.58,53.91,650,cafe\n27.60, 53.92, 650, bar\n",
        )
        .unwrap();
        let tasks = read_seed_csv(&with_header).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].place_type, "bar");
        assert_eq!(tasks[1].lat, 53.92);

        let bare = dir.path().join("bare.csv");
        fs::write(&bare, "27.58,53.91,650,cafe\n").unwrap();
        assert_eq!(read_seed_csv(&bare).unwrap().len(), 1);
    }

    #[test]
    fn reports_line_of_bad_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "27.58,53.91,650,cafe\n27.58,53.91,-1,cafe\n").unwrap();
        let err = read_seed_csv(&path).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{err}");
    }

    #[test]
    fn grid_covers_bbox_with_diagonal_spacing() {
        let bbox = BoundingBox::new(27.50, 53.85, 27.65, 53.95);
        let points = grid_over_bbox(&bbox, 650.0).unwrap();
        assert!(points.len() > 1);
        for point in &points {
            assert!(point.lon > bbox.west - 0.01 && point.lon < bbox.east + 0.01);
            assert!(point.lat > bbox.south - 0.01 && point.lat < bbox.north + 0.01);
        }
        let spacing = points[0].distance_to(&points[1]);
        assert!((spacing - 650.0 * std::f64::consts::SQRT_2).abs() < 1.0, "{spacing}");
    }

    #[test]
    fn crosses_points_with_types() {
        let points = vec![GeoPoint::new(27.5, 53.9), GeoPoint::new(27.6, 53.9)];
        let types = vec!["cafe".to_string(), "bar".to_string(), "gym".to_string()];
        let tasks = seed_tasks(&points, 650.0, &types).unwrap();
        assert_eq!(tasks.len(), 6);
        assert!(tasks.iter().all(|task| task.radius == 650.0));
    }
}
