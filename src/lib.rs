mod api;
mod archive;
mod config;
mod db;
mod errors;
mod geo;
mod inputs;
mod persistence;
mod places;
mod queues;
mod rate_limit;
mod resume;
mod seeds;
mod session;
mod subdivide;
mod tasks;
mod tracker;
mod worker;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use api::{HttpNearbySearch, NearbyPage, NearbyQuery, NearbySearch, SearchStatus};
pub use archive::{ArchiveStats, RawArchiver};
pub use config::{AppConfig, PublicAppConfig};
pub use db::{
    SessionStore, TaskTable, COMPLETED_TASKS_TABLE, PENDING_TASKS_TABLE, PLACES_TABLE,
    SESSION_TABLES,
};
pub use errors::{AppError, AppResult, WorkerError};
pub use geo::{
    AzimuthalEquidistant, BoundingBox, GeoPoint, MetricPoint, MetricProjection,
    EARTH_RADIUS_M,
};
pub use inputs::{load_credentials, load_place_types, parse_lines, Credential};
pub use persistence::{
    ConsumerSettings, CycleOutcome, PersistenceConsumer, PersistenceInputs, PersistenceStats,
};
pub use places::{PlaceDraft, PlaceRecord, PlaceValidationError};
pub use queues::{channel, Inbox, Message, Outbox, Received, SharedInbox};
pub use rate_limit::RateLimiter;
pub use resume::{restore, ResumeState};
pub use seeds::{grid_over_bbox, initial_tasks, read_seed_csv, seed_tasks, SeedRow};
pub use session::{format_elapsed, run_session, SessionReport, WorkerOutcome};
pub use subdivide::{
    SubdivideError, Subdivider, CHILD_BEARINGS_DEG, CHILD_OFFSET_FACTOR,
    DEFAULT_CENTER_RADIUS_FRACTION,
};
pub use tasks::{generate_task_id, SearchTask};
pub use tracker::UsageTracker;
pub use worker::{
    SearchOutcome, SearchWorker, StopReason, WorkerChannels, WorkerReport, WorkerSettings,
    WorkerStats, RESULT_CAP,
};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,poi_harvester=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
