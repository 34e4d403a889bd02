use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::geo::BoundingBox;
use crate::subdivide::DEFAULT_CENTER_RADIUS_FRACTION;

const DEFAULT_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub keys_file: PathBuf,
    pub google_places_api_key: Option<SecretString>,
    pub search_types_file: PathBuf,
    pub valid_types_file: PathBuf,
    pub seeds_file: Option<PathBuf>,
    pub aoi_bbox: Option<BoundingBox>,
    pub initial_radius_m: f64,
    pub tracker_file: PathBuf,
    pub raw_archive_enabled: bool,
    pub raw_data_dir: PathBuf,
    pub raw_file_extension: String,
    pub search_language: String,
    pub places_api_base: String,
    pub request_timeout_ms: u64,
    pub max_requests_per_min: u32,
    pub extra_request_delay_ms: u64,
    pub max_task_attempts: u32,
    pub critical_errors_threshold: u32,
    pub idle_timeout_secs: u64,
    pub queue_poll_ms: u64,
    pub min_allowed_radius_m: f64,
    pub center_radius_fraction: f64,
    pub place_batch_size: usize,
    pub commit_every_batches: u64,
    pub tracker_refresh_every: u64,
    pub quota_warn_requests: Option<u64>,
    pub worker_start_stagger_ms: u64,
    /// Each worker sends one known-good search before taking tasks and
    /// refuses to start if its credential is rejected.
    pub verify_credentials: bool,
    pub resume: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub keys_file: String,
    pub has_env_credential: bool,
    pub seeds_file: Option<String>,
    pub aoi_bbox: Option<BoundingBox>,
    pub initial_radius_m: f64,
    pub raw_archive_dir: Option<String>,
    pub search_language: String,
    pub max_requests_per_min: u32,
    pub max_task_attempts: u32,
    pub critical_errors_threshold: u32,
    pub idle_timeout_secs: u64,
    pub min_allowed_radius_m: f64,
    pub center_radius_fraction: f64,
    pub place_batch_size: usize,
    pub commit_every_batches: u64,
    pub verify_credentials: bool,
    pub resume: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_file_name: "poi.sqlite3".to_string(),
            keys_file: PathBuf::from("keys.txt"),
            google_places_api_key: None,
            search_types_file: PathBuf::from("search_types.txt"),
            valid_types_file: PathBuf::from("valid_types.txt"),
            seeds_file: None,
            aoi_bbox: None,
            initial_radius_m: 650.0,
            tracker_file: PathBuf::from("tracker.json"),
            raw_archive_enabled: true,
            raw_data_dir: PathBuf::from("data"),
            raw_file_extension: ".json".to_string(),
            search_language: "en".to_string(),
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            request_timeout_ms: 5_000,
            max_requests_per_min: 60,
            extra_request_delay_ms: 150,
            max_task_attempts: 3,
            critical_errors_threshold: 10,
            idle_timeout_secs: 60,
            queue_poll_ms: 500,
            min_allowed_radius_m: 6.0,
            center_radius_fraction: DEFAULT_CENTER_RADIUS_FRACTION,
            place_batch_size: 1,
            commit_every_batches: 12,
            tracker_refresh_every: 4,
            quota_warn_requests: None,
            worker_start_stagger_ms: 1_000,
            verify_credentials: true,
            resume: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            data_dir: parse_path("DATA_DIR", defaults.data_dir),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
            keys_file: parse_path("KEYS_FILE", defaults.keys_file),
            google_places_api_key: env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            search_types_file: parse_path("SEARCH_TYPES_FILE", defaults.search_types_file),
            valid_types_file: parse_path("VALID_TYPES_FILE", defaults.valid_types_file),
            seeds_file: env::var("SEEDS_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            aoi_bbox: parse_bbox("AOI_BBOX"),
            initial_radius_m: parse_f64("INITIAL_RADIUS_M", defaults.initial_radius_m),
            tracker_file: parse_path("TRACKER_FILE", defaults.tracker_file),
            raw_archive_enabled: parse_bool("RAW_ARCHIVE_ENABLED", defaults.raw_archive_enabled),
            raw_data_dir: parse_path("RAW_DATA_DIR", defaults.raw_data_dir),
            raw_file_extension: env::var("RAW_FILE_EXTENSION")
                .unwrap_or(defaults.raw_file_extension),
            search_language: env::var("SEARCH_LANGUAGE").unwrap_or(defaults.search_language),
            places_api_base: env::var("PLACES_API_BASE").unwrap_or(defaults.places_api_base),
            request_timeout_ms: parse_u64("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            max_requests_per_min: parse_u32("MAX_REQUESTS_PER_MIN", defaults.max_requests_per_min)
                .max(1),
            extra_request_delay_ms: parse_u64(
                "EXTRA_REQUEST_DELAY_MS",
                defaults.extra_request_delay_ms,
            ),
            max_task_attempts: parse_u32("MAX_TASK_ATTEMPTS", defaults.max_task_attempts).max(1),
            critical_errors_threshold: parse_u32(
                "CRITICAL_ERRORS_THRESHOLD",
                defaults.critical_errors_threshold,
            ),
            idle_timeout_secs: parse_u64("IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs).max(1),
            queue_poll_ms: parse_u64("QUEUE_POLL_MS", defaults.queue_poll_ms).clamp(10, 1_000),
            min_allowed_radius_m: parse_f64("MIN_ALLOWED_RADIUS_M", defaults.min_allowed_radius_m)
                .max(0.0),
            center_radius_fraction: parse_f64(
                "CENTER_RADIUS_FRACTION",
                defaults.center_radius_fraction,
            ),
            place_batch_size: parse_usize("PLACE_BATCH_SIZE", defaults.place_batch_size).max(1),
            commit_every_batches: parse_u64("COMMIT_EVERY_BATCHES", defaults.commit_every_batches)
                .max(1),
            tracker_refresh_every: parse_u64(
                "TRACKER_REFRESH_EVERY",
                defaults.tracker_refresh_every,
            )
            .max(1),
            quota_warn_requests: env::var("QUOTA_WARN_REQUESTS")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok()),
            worker_start_stagger_ms: parse_u64(
                "WORKER_START_STAGGER_MS",
                defaults.worker_start_stagger_ms,
            ),
            verify_credentials: parse_bool("VERIFY_CREDENTIALS", defaults.verify_credentials),
            resume: parse_bool("RESUME", defaults.resume),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn tracker_path(&self) -> PathBuf {
        resolve(&self.data_dir, &self.tracker_file)
    }

    pub fn raw_archive_path(&self) -> PathBuf {
        resolve(&self.data_dir, &self.raw_data_dir)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path().to_string_lossy().to_string(),
            keys_file: self.keys_file.to_string_lossy().to_string(),
            has_env_credential: self.google_places_api_key.is_some(),
            seeds_file: self
                .seeds_file
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            aoi_bbox: self.aoi_bbox,
            initial_radius_m: self.initial_radius_m,
            raw_archive_dir: self
                .raw_archive_enabled
                .then(|| self.raw_archive_path().to_string_lossy().to_string()),
            search_language: self.search_language.clone(),
            max_requests_per_min: self.max_requests_per_min,
            max_task_attempts: self.max_task_attempts,
            critical_errors_threshold: self.critical_errors_threshold,
            idle_timeout_secs: self.idle_timeout_secs,
            min_allowed_radius_m: self.min_allowed_radius_m,
            center_radius_fraction: self.center_radius_fraction,
            place_batch_size: self.place_batch_size,
            commit_every_batches: self.commit_every_batches,
            verify_credentials: self.verify_credentials,
            resume: self.resume,
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

fn parse_bbox(key: &str) -> Option<BoundingBox> {
    let raw = env::var(key).ok().filter(|v| !v.trim().is_empty())?;
    match raw.parse::<BoundingBox>() {
        Ok(bbox) => Some(bbox),
        Err(err) => {
            warn!(key, %err, "ignoring invalid bounding box");
            None
        }
    }
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
