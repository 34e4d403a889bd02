//! Wires one crawl session together: store, channels, consumers and the worker
//! pool, from startup (fresh or resumed) to the final report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::api::NearbySearch;
use crate::archive::{ArchiveStats, RawArchiver};
use crate::config::AppConfig;
use crate::db::SessionStore;
use crate::errors::{AppError, AppResult, WorkerError};
use crate::inputs::Credential;
use crate::persistence::{
    ConsumerSettings, PersistenceConsumer, PersistenceInputs, PersistenceStats,
};
use crate::queues::{channel, Outbox, SharedInbox};
use crate::resume::{restore, ResumeState};
use crate::subdivide::Subdivider;
use crate::tasks::SearchTask;
use crate::tracker::UsageTracker;
use crate::worker::{SearchWorker, WorkerChannels, WorkerReport, WorkerSettings};

#[derive(Debug)]
pub enum WorkerOutcome {
    Finished(WorkerReport),
    Failed(WorkerError),
}

impl WorkerOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub resumed: bool,
    pub initial_tasks: usize,
    pub interrupted: bool,
    pub workers: Vec<WorkerOutcome>,
    pub persistence: PersistenceStats,
    pub archive: Option<ArchiveStats>,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct WorkerTotals {
    tasks: u64,
    requests: u64,
    places: u64,
    subdivisions: u64,
}

impl SessionReport {
    pub fn has_fatal_errors(&self) -> bool {
        self.workers.iter().any(WorkerOutcome::is_fatal)
    }

    pub fn log_summary(&self) {
        for outcome in &self.workers {
            match outcome {
                WorkerOutcome::Finished(report) => info!(
                    target: "session",
                    worker = %report.worker,
                    reason = ?report.stop_reason,
                    tasks = report.stats.tasks,
                    requests = report.stats.requests,
                    lifetime_requests = report.lifetime_requests,
                    places = report.stats.places,
                    zero_results = report.stats.zero_results,
                    critical_errors = report.stats.critical_errors,
                    request_errors = report.stats.request_errors,
                    invalid_records = report.stats.invalid_records,
                    subdivisions = report.stats.subdivisions,
                    discarded = report.stats.discarded_tasks,
                    avg_latency_ms = report.stats.average_latency_ms(),
                    "worker summary"
                ),
                WorkerOutcome::Failed(err) => error!(target: "session", error = %err, "worker failed"),
            }
        }
        let totals = self.worker_totals();
        info!(
            target: "session",
            resumed = self.resumed,
            interrupted = self.interrupted,
            initial_tasks = self.initial_tasks,
            tasks = totals.tasks,
            requests = totals.requests,
            places_found = totals.places,
            subdivisions = totals.subdivisions,
            unique_places = self.persistence.places_written,
            archived = self.archive.as_ref().map(|stats| stats.written).unwrap_or(0),
            unfinished = self.persistence.unfinished_at_shutdown,
            elapsed = %format_elapsed(self.elapsed),
            "session finished"
        );
    }

    fn worker_totals(&self) -> WorkerTotals {
        self.workers
            .iter()
            .filter_map(|outcome| match outcome {
                WorkerOutcome::Finished(report) => Some(&report.stats),
                WorkerOutcome::Failed(_) => None,
            })
            .fold(
                WorkerTotals {
                    tasks: 0,
                    requests: 0,
                    places: 0,
                    subdivisions: 0,
                },
                |mut totals, stats| {
                    totals.tasks += stats.tasks;
                    totals.requests += stats.requests;
                    totals.places += stats.places;
                    totals.subdivisions += stats.subdivisions;
                    totals
                },
            )
    }
}

/// Renders a duration as `"1 h 2 m 3 s"`, leaving out leading zero units.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours} h {minutes} m {seconds} s")
    } else if minutes > 0 {
        format!("{minutes} m {seconds} s")
    } else {
        format!("{seconds} s")
    }
}

/// Discards the queued backlog, then sends one stop per worker. Discarded
/// tasks are already recorded as pending, so a resumed session picks them up.
async fn halt_workers(
    tasks_in: &SharedInbox<SearchTask>,
    tasks_out: &Outbox<SearchTask>,
    workers: usize,
) -> usize {
    let discarded = tasks_in.discard_queued().await;
    for _ in 0..workers {
        if tasks_out.stop().is_err() {
            break;
        }
    }
    discarded
}

/// Runs one session to completion. With `config.resume` the unfinished tasks
/// of the previous session replace `seeds`.
pub async fn run_session(
    config: &AppConfig,
    credentials: Vec<Credential>,
    api: Arc<dyn NearbySearch>,
    seeds: Vec<SearchTask>,
) -> AppResult<SessionReport> {
    let started = Instant::now();
    if credentials.is_empty() {
        return Err(AppError::Config("a session needs at least one credential".into()));
    }

    let store = SessionStore::open(&config.database_path())?;
    let (initial, restored) = if config.resume {
        if !seeds.is_empty() {
            warn!(target: "session", "ignoring seed tasks while resuming");
        }
        let ResumeState {
            unfinished,
            place_ids,
            completed_ids,
        } = restore(&store)?;
        (unfinished, Some((place_ids, completed_ids)))
    } else {
        (seeds, None)
    };
    store.ensure_schema()?;
    if !config.resume {
        let leftover = store.unfinished_count()?;
        if leftover > 0 {
            warn!(
                target: "session",
                leftover,
                "previous session left unfinished tasks; set RESUME=true to continue them"
            );
        }
    }

    let mut consumer = PersistenceConsumer::new(store, ConsumerSettings::from_config(config));
    if let Some((place_ids, completed_ids)) = restored {
        consumer.preload_place_ids(place_ids);
        consumer.preload_completed_task_ids(completed_ids);
    }
    consumer.preload_pending_tasks(&initial)?;

    let (tasks_out, tasks_in) = channel::<SearchTask>("tasks");
    let tasks_in = tasks_in.shared();
    let (pending_out, pending_in) = channel("pending_tasks");
    let (places_out, places_in) = channel("places");
    let (completed_out, completed_in) = channel("completed_tasks");

    let initial_tasks = initial.len();
    for task in initial {
        tasks_out.push(task)?;
    }
    info!(
        target: "session",
        resumed = config.resume,
        initial_tasks,
        workers = credentials.len(),
        "session starting"
    );

    let archiver = if config.raw_archive_enabled {
        Some(RawArchiver::from_config(config)?)
    } else {
        None
    };
    let (archive_out, archive_handle) = match archiver {
        Some(archiver) => {
            let (archive_out, archive_in) = channel("raw_archive");
            (Some(archive_out), Some(tokio::spawn(archiver.run(archive_in))))
        }
        None => (None, None),
    };
    let consumer_handle = tokio::spawn(consumer.run(PersistenceInputs {
        places: places_in,
        pending: pending_in,
        completed: completed_in,
    }));

    let worker_count = credentials.len();
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupt_handle = {
        let tasks_in = tasks_in.clone();
        let tasks_out = tasks_out.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupted.store(true, Ordering::SeqCst);
            let discarded = halt_workers(&tasks_in, &tasks_out, worker_count).await;
            warn!(
                target: "session",
                discarded,
                "interrupt received; stopping workers (interrupt again to exit immediately)"
            );
            if tokio::signal::ctrl_c().await.is_ok() {
                error!(target: "session", "second interrupt; exiting without a clean shutdown");
                std::process::exit(130);
            }
        })
    };

    let tracker = UsageTracker::new(config.tracker_path());
    let settings = WorkerSettings::from_config(config);
    let subdivider = Subdivider::from_config(config);
    let stagger = Duration::from_millis(config.worker_start_stagger_ms);

    let mut outcomes = Vec::with_capacity(worker_count);
    let mut names = Vec::with_capacity(worker_count);
    let mut handles = Vec::with_capacity(worker_count);
    for (index, credential) in credentials.into_iter().enumerate() {
        let channels = WorkerChannels {
            tasks_in: tasks_in.clone(),
            tasks_out: tasks_out.clone(),
            pending: pending_out.clone(),
            places: places_out.clone(),
            archive: archive_out.clone(),
            completed: completed_out.clone(),
        };
        let worker = match SearchWorker::new(
            format!("worker-{index}"),
            credential,
            api.clone(),
            subdivider.clone(),
            tracker.clone(),
            settings.clone(),
            channels,
        ) {
            Ok(worker) => worker,
            Err(err) => {
                error!(target: "session", error = %err, "worker failed to start");
                outcomes.push(WorkerOutcome::Failed(err));
                continue;
            }
        };
        let delay = stagger * index as u32;
        names.push(worker.name().to_string());
        handles.push(tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            worker.run().await
        }));
    }

    for (worker, joined) in names.into_iter().zip(join_all(handles).await) {
        let result = joined.map_err(|source| WorkerError::Aborted { worker, source });
        match result.and_then(|outcome| outcome) {
            Ok(report) => outcomes.push(WorkerOutcome::Finished(report)),
            Err(err) => {
                error!(target: "session", error = %err, "worker ended with a fatal error");
                outcomes.push(WorkerOutcome::Failed(err));
            }
        }
    }
    interrupt_handle.abort();

    // Workers are gone; everything they produced is already queued ahead of
    // these stop signals.
    for result in [pending_out.stop(), places_out.stop(), completed_out.stop()] {
        if let Err(err) = result {
            warn!(target: "session", error = %err, "persistence consumer already stopped");
        }
    }
    if let Some(archive_out) = &archive_out {
        if let Err(err) = archive_out.stop() {
            warn!(target: "session", error = %err, "raw archiver already stopped");
        }
    }
    drop(tasks_out);

    let persistence = consumer_handle.await??;
    let archive = match archive_handle {
        Some(handle) => Some(handle.await?),
        None => None,
    };

    Ok(SessionReport {
        resumed: config.resume,
        initial_tasks,
        interrupted: interrupted.load(Ordering::SeqCst),
        workers: outcomes,
        persistence,
        archive,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::api::{NearbyPage, SearchStatus};
    use crate::worker::testing::{page, ScriptedSearch};
    use crate::worker::StopReason;

    fn credential() -> Credential {
        Credential::new(SecretString::from("key-0".to_string()))
    }

    fn quick_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            data_dir: dir.to_path_buf(),
            max_requests_per_min: 60_000,
            extra_request_delay_ms: 0,
            idle_timeout_secs: 1,
            queue_poll_ms: 10,
            worker_start_stagger_ms: 0,
            verify_credentials: false,
            raw_archive_enabled: false,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn interrupt_drops_backlog_so_workers_stop_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(dir.path());
        let (tasks_out, tasks_in) = channel::<SearchTask>("tasks");
        let tasks_in = tasks_in.shared();
        let (pending, _pending) = channel("pending_tasks");
        let (places, _places) = channel("places");
        let (completed, _completed) = channel("completed_tasks");
        for i in 0..200 {
            let task = SearchTask::new(27.5 + i as f64 * 1e-4, 53.9, 100.0, "cafe").unwrap();
            tasks_out.push(task).unwrap();
        }
        let worker = SearchWorker::new(
            "worker-0",
            credential(),
            ScriptedSearch::new(|_| Ok(page("one", 1, None))),
            Subdivider::from_config(&config),
            UsageTracker::new(config.tracker_path()),
            WorkerSettings::from_config(&config),
            WorkerChannels {
                tasks_in: tasks_in.clone(),
                tasks_out: tasks_out.clone(),
                pending,
                places,
                archive: None,
                completed,
            },
        )
        .unwrap();

        let handle = tokio::spawn(worker.run());
        let discarded = halt_workers(&tasks_in, &tasks_out, 1).await;
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.stop_reason, StopReason::Signal);
        assert!(report.stats.tasks <= 1, "ran {} tasks", report.stats.tasks);
        assert_eq!(discarded as u64 + report.stats.tasks, 200);
    }

    #[tokio::test]
    async fn panicking_worker_still_lets_persistence_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(dir.path());
        let api = ScriptedSearch::new(|_| -> AppResult<NearbyPage> {
            panic!("backend blew up")
        });
        let seed = SearchTask::new(27.58, 53.91, 650.0, "cafe").unwrap();

        let report = run_session(&config, vec![credential()], api, vec![seed])
            .await
            .unwrap();

        assert!(matches!(
            report.workers.as_slice(),
            [WorkerOutcome::Failed(WorkerError::Aborted { .. })]
        ));
        assert_eq!(report.persistence.pending_written, 1);
        assert_eq!(report.persistence.unfinished_at_shutdown, 1);
        assert!(!report.persistence.session_tables_dropped);
    }

    #[tokio::test]
    async fn denied_credential_leaves_every_seed_unfinished() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            verify_credentials: true,
            ..quick_config(dir.path())
        };
        let api = ScriptedSearch::new(|_| Ok(NearbyPage::from_status(SearchStatus::RequestDenied)));
        let seeds = (0..20)
            .map(|i| SearchTask::new(27.5 + i as f64 * 1e-3, 53.9, 100.0, "cafe").unwrap())
            .collect::<Vec<_>>();

        let report = run_session(&config, vec![credential()], api.clone(), seeds)
            .await
            .unwrap();

        assert!(matches!(
            report.workers.as_slice(),
            [WorkerOutcome::Failed(WorkerError::CredentialRejected { .. })]
        ));
        assert_eq!(api.queries().len(), 1);
        assert_eq!(report.persistence.completed_written, 0);
        assert_eq!(report.persistence.unfinished_at_shutdown, 20);
    }

    #[test]
    fn formats_elapsed_time() {
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1 h 2 m 3 s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2 m 5 s");
        assert_eq!(format_elapsed(Duration::from_millis(9_900)), "9 s");
        assert_eq!(format_elapsed(Duration::from_secs(3600)), "1 h 0 m 0 s");
    }

    #[tokio::test]
    async fn refuses_to_start_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let api = ScriptedSearch::new(|_| Ok(NearbyPage::from_status(SearchStatus::ZeroResults)));
        let result = run_session(&config, Vec::new(), api, Vec::new()).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
