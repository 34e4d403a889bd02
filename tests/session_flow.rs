use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::tempdir;

use poi_harvester::{
    run_session, AppConfig, AppResult, Credential, GeoPoint, NearbyPage, NearbyQuery,
    NearbySearch, SearchStatus, SearchTask, SessionStore, TaskTable, UsageTracker,
    WorkerOutcome, COMPLETED_TASKS_TABLE, PENDING_TASKS_TABLE, PLACES_TABLE,
};

type Responder = dyn Fn(&NearbyQuery) -> NearbyPage + Send + Sync;

struct FakePlaces {
    responder: Box<Responder>,
    queries: Mutex<Vec<NearbyQuery>>,
}

impl FakePlaces {
    fn new(responder: impl Fn(&NearbyQuery) -> NearbyPage + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn queries(&self) -> Vec<NearbyQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl NearbySearch for FakePlaces {
    async fn search_nearby(
        &self,
        _credential: &Credential,
        query: &NearbyQuery,
    ) -> AppResult<NearbyPage> {
        self.queries.lock().push(query.clone());
        Ok((self.responder)(query))
    }
}

fn payload(place_id: &str) -> Value {
    json!({
        "place_id": place_id,
        "id": format!("legacy-{place_id}"),
        "geometry": { "location": { "lat": 53.91, "lng": 27.58 } },
        "name": format!("Coffee {place_id}"),
        "rating": 4.2,
        "business_status": "OPERATIONAL",
        "scope": "GOOGLE",
        "user_ratings_total": 31,
        "vicinity": "Lenina St 5",
        "types": ["cafe", "food"],
    })
}

fn page(prefix: &str, count: usize, token: Option<&str>) -> NearbyPage {
    NearbyPage {
        status: SearchStatus::Ok,
        results: (0..count)
            .map(|i| payload(&format!("{prefix}-{i}")))
            .collect(),
        next_page_token: token.map(str::to_string),
        error_message: None,
    }
}

fn credentials(count: usize) -> Vec<Credential> {
    (0..count)
        .map(|i| Credential::new(SecretString::from(format!("test-key-{i}"))))
        .collect()
}

fn test_config(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        data_dir: dir.to_path_buf(),
        max_requests_per_min: 60_000,
        extra_request_delay_ms: 0,
        idle_timeout_secs: 1,
        queue_poll_ms: 10,
        worker_start_stagger_ms: 0,
        verify_credentials: false,
        place_batch_size: 4,
        commit_every_batches: 2,
        ..AppConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capped_seed_is_subdivided_and_every_place_lands_once() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let api = FakePlaces::new(|query| match query.page_token.as_deref() {
        None if query.radius == 650.0 => page("first", 40, Some("p2")),
        Some("p2") => page("second", 25, None),
        _ => NearbyPage::from_status(SearchStatus::ZeroResults),
    });

    let seed = SearchTask::new(27.58, 53.91, 650.0, "cafe").unwrap();
    let report = run_session(&config, credentials(2), api.clone(), vec![seed])
        .await
        .unwrap();

    assert!(!report.has_fatal_errors());
    let subdivisions: u64 = report
        .workers
        .iter()
        .map(|outcome| match outcome {
            WorkerOutcome::Finished(report) => report.stats.subdivisions,
            WorkerOutcome::Failed(err) => panic!("worker failed: {err}"),
        })
        .sum();
    assert_eq!(subdivisions, 1);

    let children = api
        .queries()
        .into_iter()
        .filter(|query| query.page_token.is_none() && query.radius != 650.0)
        .collect::<Vec<_>>();
    assert_eq!(children.len(), 7);
    assert!(children.iter().all(|query| query.radius == 325.0));
    let origin = GeoPoint::new(27.58, 53.91);
    let centered = children
        .iter()
        .filter(|query| query.center.distance_to(&origin) < 1.0)
        .count();
    assert_eq!(centered, 1);
    let ring = children
        .iter()
        .filter(|query| (query.center.distance_to(&origin) - 390.0).abs() < 0.5)
        .count();
    assert_eq!(ring, 6);

    assert_eq!(report.persistence.places_received, 65);
    assert_eq!(report.persistence.places_written, 65);
    assert_eq!(report.persistence.pending_written, 8);
    assert_eq!(report.persistence.completed_written, 8);
    assert!(report.persistence.session_tables_dropped);
    assert_eq!(report.archive.as_ref().map(|stats| stats.written), Some(65));

    let store = SessionStore::open(&config.database_path()).unwrap();
    assert_eq!(store.place_count().unwrap(), 65);
    let tables = store.existing_tables().unwrap();
    assert!(tables.contains(PLACES_TABLE));
    assert!(!tables.contains(PENDING_TASKS_TABLE));
    assert!(!tables.contains(COMPLETED_TASKS_TABLE));

    let archived = std::fs::read_dir(config.raw_archive_path()).unwrap().count();
    assert_eq!(archived, 65);

    let usage = UsageTracker::new(config.tracker_path()).snapshot().unwrap();
    assert_eq!(usage.values().sum::<u64>(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_session_runs_only_unfinished_tasks() {
    let dir = tempdir().unwrap();
    let config = AppConfig {
        resume: true,
        ..test_config(dir.path())
    };

    let tasks = (0..3)
        .map(|i| SearchTask::new(27.5 + i as f64 * 0.01, 53.9, 200.0, "bar").unwrap())
        .collect::<Vec<_>>();
    {
        let store = SessionStore::open(&config.database_path()).unwrap();
        store.ensure_schema().unwrap();
        store.insert_tasks(TaskTable::Pending, &tasks).unwrap();
        store
            .insert_tasks(TaskTable::Completed, &tasks[..1])
            .unwrap();
        store.close().unwrap();
    }

    let api = FakePlaces::new(|query| {
        let prefix = format!("{:.2}", query.center.lon);
        page(&prefix, 1, None)
    });
    let report = run_session(&config, credentials(1), api.clone(), Vec::new())
        .await
        .unwrap();

    assert_eq!(report.initial_tasks, 2);
    let searched = api
        .queries()
        .iter()
        .map(|query| format!("{:.2}", query.center.lon))
        .collect::<HashSet<_>>();
    assert_eq!(
        searched,
        HashSet::from(["27.51".to_string(), "27.52".to_string()])
    );
    assert_eq!(report.persistence.places_written, 2);
    assert!(report.persistence.session_tables_dropped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quota_exhaustion_is_reported_and_session_stays_resumable() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let api = FakePlaces::new(|_| NearbyPage::from_status(SearchStatus::OverQueryLimit));

    let seed = SearchTask::new(27.58, 53.91, 650.0, "cafe").unwrap();
    let seed_id = seed.task_id.clone();
    let report = run_session(&config, credentials(1), api, vec![seed])
        .await
        .unwrap();

    assert!(report.has_fatal_errors());
    assert_eq!(report.persistence.unfinished_at_shutdown, 1);
    assert!(!report.persistence.session_tables_dropped);

    let store = SessionStore::open(&config.database_path()).unwrap();
    let unfinished = store.unfinished_tasks().unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].task_id, seed_id);
}
