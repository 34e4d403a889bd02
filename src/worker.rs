//! Per-credential search worker.
//!
//! A worker pulls tasks from the shared queue, pages through the nearby-search
//! results for each, and forwards what it finds. Tasks whose results hit the
//! API cap are split by the [`Subdivider`] and the children go back onto the
//! shared queue. Per-task failures are absorbed: the task is still reported
//! complete, just with fewer (or no) places.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::api::{NearbyQuery, NearbySearch, SearchStatus};
use crate::config::AppConfig;
use crate::errors::{AppError, WorkerError};
use crate::geo::GeoPoint;
use crate::inputs::Credential;
use crate::places::PlaceRecord;
use crate::queues::{Outbox, Received, SharedInbox};
use crate::rate_limit::RateLimiter;
use crate::subdivide::Subdivider;
use crate::tasks::SearchTask;
use crate::tracker::UsageTracker;

/// Most results the API hands out for one search, over all pages.
pub const RESULT_CAP: usize = 60;
const PROGRESS_EVERY: u64 = 5;

// A search that is known to return results for any working credential.
const CHECK_CENTER: GeoPoint = GeoPoint::new(27.580184, 53.909804);
const CHECK_RADIUS_M: f64 = 650.0;
const CHECK_PLACE_TYPE: &str = "cafe";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_requests_per_min: u32,
    pub extra_request_delay: Duration,
    pub max_task_attempts: u32,
    pub critical_errors_threshold: u32,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub tracker_refresh_every: u64,
    pub quota_warn_requests: Option<u64>,
    pub search_language: String,
    pub verify_credential: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_requests_per_min: config.max_requests_per_min,
            extra_request_delay: Duration::from_millis(config.extra_request_delay_ms),
            max_task_attempts: config.max_task_attempts,
            critical_errors_threshold: config.critical_errors_threshold,
            idle_timeout: config.idle_timeout(),
            poll_interval: config.queue_poll_interval(),
            tracker_refresh_every: config.tracker_refresh_every.max(1),
            quota_warn_requests: config.quota_warn_requests,
            search_language: config.search_language.clone(),
            verify_credential: config.verify_credentials,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub tasks: u64,
    pub requests: u64,
    pub places: u64,
    pub zero_results: u64,
    pub critical_errors: u32,
    pub request_errors: u64,
    pub invalid_records: u64,
    pub subdivisions: u64,
    pub floor_reached: u64,
    pub discarded_tasks: u64,
    pub total_latency_ms: u64,
}

impl WorkerStats {
    pub fn average_latency_ms(&self) -> u64 {
        if self.requests == 0 {
            0
        } else {
            self.total_latency_ms / self.requests
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Signal,
    Idle,
    QueueClosed,
}

/// Returned by a worker that stopped cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker: String,
    pub credential: String,
    pub stop_reason: StopReason,
    pub lifetime_requests: u64,
    pub stats: WorkerStats,
}

/// Queue ends a worker reads from and writes to.
#[derive(Debug, Clone)]
pub struct WorkerChannels {
    pub tasks_in: SharedInbox<SearchTask>,
    pub tasks_out: Outbox<SearchTask>,
    pub pending: Outbox<SearchTask>,
    pub places: Outbox<Arc<PlaceRecord>>,
    pub archive: Option<Outbox<Arc<PlaceRecord>>>,
    pub completed: Outbox<SearchTask>,
}

/// Everything one task's pagination produced.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub places: Vec<PlaceRecord>,
    /// Results returned by the API, valid or not.
    pub returned: usize,
    /// Pagination ran out of continuation tokens rather than being cut short
    /// by an error.
    pub exhausted: bool,
}

impl SearchOutcome {
    pub fn hit_cap(&self) -> bool {
        self.exhausted && self.returned >= RESULT_CAP
    }
}

pub struct SearchWorker {
    name: String,
    credential: Credential,
    api: Arc<dyn NearbySearch>,
    subdivider: Subdivider,
    tracker: UsageTracker,
    limiter: RateLimiter,
    settings: WorkerSettings,
    channels: WorkerChannels,
    previous_requests: u64,
    requests_since_refresh: u64,
    stats: WorkerStats,
}

impl SearchWorker {
    pub fn new(
        name: impl Into<String>,
        credential: Credential,
        api: Arc<dyn NearbySearch>,
        subdivider: Subdivider,
        tracker: UsageTracker,
        settings: WorkerSettings,
        channels: WorkerChannels,
    ) -> Result<Self, WorkerError> {
        let name = name.into();
        let previous_requests = tracker
            .previous_requests(credential.fingerprint())
            .map_err(|source| WorkerError::Internal {
                worker: name.clone(),
                source,
            })?;
        let limiter = RateLimiter::per_minute(
            settings.max_requests_per_min,
            settings.extra_request_delay,
        );
        Ok(Self {
            name,
            credential,
            api,
            subdivider,
            tracker,
            limiter,
            settings,
            channels,
            previous_requests,
            requests_since_refresh: 0,
            stats: WorkerStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn lifetime_requests(&self) -> u64 {
        self.previous_requests + self.stats.requests
    }

    pub async fn run(mut self) -> Result<WorkerReport, WorkerError> {
        info!(
            worker = %self.name,
            credential = self.credential.fingerprint(),
            previous_requests = self.previous_requests,
            "worker started"
        );
        if let Some(limit) = self.settings.quota_warn_requests {
            if self.previous_requests >= limit {
                warn!(
                    worker = %self.name,
                    credential = self.credential.fingerprint(),
                    previous_requests = self.previous_requests,
                    limit,
                    "credential is close to its request quota"
                );
            }
        }
        if self.settings.verify_credential {
            if let Err(err) = self.verify_credential().await {
                return Err(self.fail(err).await);
            }
        }

        let mut last_task = Instant::now();
        let stop_reason = loop {
            match self
                .channels
                .tasks_in
                .recv_timeout(self.settings.poll_interval)
                .await
            {
                Received::Item(task) => {
                    last_task = Instant::now();
                    if let Err(err) = self.process_task(task).await {
                        return Err(self.fail(err).await);
                    }
                }
                Received::Stop => break StopReason::Signal,
                Received::Closed => break StopReason::QueueClosed,
                Received::Empty => {
                    if last_task.elapsed() >= self.settings.idle_timeout {
                        break StopReason::Idle;
                    }
                }
            }
        };

        self.flush_usage()
            .await
            .map_err(|source| self.internal(source))?;
        self.log_progress();
        info!(worker = %self.name, reason = ?stop_reason, "worker stopped");
        Ok(WorkerReport {
            worker: self.name.clone(),
            credential: self.credential.fingerprint().to_string(),
            stop_reason,
            lifetime_requests: self.lifetime_requests(),
            stats: self.stats,
        })
    }

    /// Searches one task and forwards its children, places and completion, in
    /// that order.
    pub async fn process_task(&mut self, mut task: SearchTask) -> Result<(), WorkerError> {
        if task.attempts >= self.settings.max_task_attempts {
            self.stats.discarded_tasks += 1;
            debug!(
                worker = %self.name,
                task_id = %task.task_id,
                attempts = task.attempts,
                "discarding task after too many attempts"
            );
            return Ok(());
        }
        task.record_attempt();

        let outcome = self.execute_search(&task).await?;
        if outcome.hit_cap() {
            self.split(&task)?;
        }

        self.stats.places += outcome.places.len() as u64;
        for place in outcome.places {
            let place = Arc::new(place);
            let archive_closed = self
                .channels
                .archive
                .as_ref()
                .is_some_and(|archive| archive.push(place.clone()).is_err());
            if archive_closed {
                warn!(worker = %self.name, "raw archive channel closed; archiving disabled");
                self.channels.archive = None;
            }
            self.channels
                .places
                .push(place)
                .map_err(|source| self.internal(source))?;
        }

        self.channels
            .completed
            .push(task)
            .map_err(|source| self.internal(source))?;
        self.stats.tasks += 1;
        if self.stats.tasks % PROGRESS_EVERY == 0 {
            self.log_progress();
        }
        Ok(())
    }

    /// Pages through the results for `task`. Only quota exhaustion and the
    /// critical-error threshold escape as errors.
    pub async fn execute_search(&mut self, task: &SearchTask) -> Result<SearchOutcome, WorkerError> {
        let mut outcome = SearchOutcome::default();
        let mut query = NearbyQuery {
            center: task.center(),
            radius: task.radius,
            place_type: task.place_type.clone(),
            language: self.settings.search_language.clone(),
            page_token: None,
        };

        loop {
            self.limiter.wait().await;
            let started = Instant::now();
            let response = self.api.search_nearby(&self.credential, &query).await;
            self.record_request(started.elapsed()).await?;

            let page = match response {
                Ok(page) => page,
                Err(err) => {
                    self.stats.request_errors += 1;
                    warn!(
                        worker = %self.name,
                        task_id = %task.task_id,
                        error = %err,
                        "nearby search request failed"
                    );
                    return Ok(outcome);
                }
            };

            match &page.status {
                SearchStatus::Ok => {}
                SearchStatus::ZeroResults => {
                    self.stats.zero_results += 1;
                    outcome.exhausted = true;
                    return Ok(outcome);
                }
                SearchStatus::OverQueryLimit => {
                    warn!(
                        worker = %self.name,
                        credential = self.credential.fingerprint(),
                        message = page.error_message.as_deref().unwrap_or_default(),
                        "request quota exhausted"
                    );
                    self.flush_usage()
                        .await
                        .map_err(|source| self.internal(source))?;
                    return Err(self.quota_exhausted());
                }
                SearchStatus::InvalidRequest | SearchStatus::RequestDenied => {
                    self.stats.critical_errors += 1;
                    warn!(
                        worker = %self.name,
                        task_id = %task.task_id,
                        status = page.status.as_str(),
                        message = page.error_message.as_deref().unwrap_or_default(),
                        critical_errors = self.stats.critical_errors,
                        "nearby search rejected"
                    );
                    if self.stats.critical_errors > self.settings.critical_errors_threshold {
                        return Err(WorkerError::TooManyCriticalErrors {
                            worker: self.name.clone(),
                            count: self.stats.critical_errors,
                            threshold: self.settings.critical_errors_threshold,
                        });
                    }
                    return Ok(outcome);
                }
                SearchStatus::Other(status) => {
                    self.stats.request_errors += 1;
                    warn!(
                        worker = %self.name,
                        task_id = %task.task_id,
                        status = %status,
                        "unexpected nearby search status"
                    );
                    return Ok(outcome);
                }
            }

            outcome.returned += page.results.len();
            for payload in page.results {
                match PlaceRecord::from_payload(payload) {
                    Ok(place) => outcome.places.push(place),
                    Err(err) => {
                        self.stats.invalid_records += 1;
                        debug!(worker = %self.name, error = %err, "skipping invalid place");
                    }
                }
            }

            match page.next_page_token {
                Some(token) => {
                    trace!(worker = %self.name, task_id = %task.task_id, "following page token");
                    query.page_token = Some(token);
                }
                None => {
                    outcome.exhausted = true;
                    return Ok(outcome);
                }
            }
        }
    }

    fn split(&mut self, task: &SearchTask) -> Result<(), WorkerError> {
        match self.subdivider.subdivide(task) {
            Ok(children) => {
                self.stats.subdivisions += 1;
                debug!(
                    worker = %self.name,
                    task_id = %task.task_id,
                    radius = task.radius,
                    children = children.len(),
                    "result cap reached; subdividing"
                );
                for child in children {
                    self.channels
                        .pending
                        .push(child.clone())
                        .map_err(|source| self.internal(source))?;
                    self.channels
                        .tasks_out
                        .push(child)
                        .map_err(|source| self.internal(source))?;
                }
            }
            Err(err) => {
                self.stats.floor_reached += 1;
                debug!(
                    worker = %self.name,
                    task_id = %task.task_id,
                    error = %err,
                    "result cap reached at minimum radius; keeping results"
                );
            }
        }
        Ok(())
    }

    /// Sends one sample search. Any answer other than results or an empty
    /// result set means the credential cannot be used.
    async fn verify_credential(&mut self) -> Result<(), WorkerError> {
        let query = NearbyQuery {
            center: CHECK_CENTER,
            radius: CHECK_RADIUS_M,
            place_type: CHECK_PLACE_TYPE.to_string(),
            language: self.settings.search_language.clone(),
            page_token: None,
        };
        self.limiter.wait().await;
        let started = Instant::now();
        let response = self.api.search_nearby(&self.credential, &query).await;
        self.record_request(started.elapsed()).await?;

        let page = response.map_err(|source| self.internal(source))?;
        match page.status {
            SearchStatus::Ok | SearchStatus::ZeroResults => {
                debug!(worker = %self.name, "credential check passed");
                Ok(())
            }
            SearchStatus::OverQueryLimit => Err(self.quota_exhausted()),
            status => Err(WorkerError::CredentialRejected {
                worker: self.name.clone(),
                credential: self.credential.fingerprint().to_string(),
                status: status.as_str().to_string(),
            }),
        }
    }

    async fn fail(&mut self, err: WorkerError) -> WorkerError {
        if let Err(flush_err) = self.flush_usage().await {
            warn!(worker = %self.name, error = %flush_err, "failed to flush usage");
        }
        warn!(worker = %self.name, error = %err, "worker stopped on fatal error");
        err
    }

    async fn record_request(&mut self, latency: Duration) -> Result<(), WorkerError> {
        self.stats.requests += 1;
        self.stats.total_latency_ms += latency.as_millis() as u64;
        self.requests_since_refresh += 1;
        if self.requests_since_refresh >= self.settings.tracker_refresh_every {
            self.flush_usage()
                .await
                .map_err(|source| self.internal(source))?;
        }
        Ok(())
    }

    async fn flush_usage(&mut self) -> Result<(), AppError> {
        let tracker = self.tracker.clone();
        let fingerprint = self.credential.fingerprint().to_string();
        let total = self.lifetime_requests();
        task::spawn_blocking(move || tracker.record(&fingerprint, total)).await??;
        self.requests_since_refresh = 0;
        Ok(())
    }

    fn quota_exhausted(&self) -> WorkerError {
        WorkerError::QuotaExhausted {
            worker: self.name.clone(),
            credential: self.credential.fingerprint().to_string(),
            total_requests: self.lifetime_requests(),
        }
    }

    fn log_progress(&self) {
        info!(
            worker = %self.name,
            tasks = self.stats.tasks,
            requests = self.stats.requests,
            places = self.stats.places,
            subdivisions = self.stats.subdivisions,
            critical_errors = self.stats.critical_errors,
            request_errors = self.stats.request_errors,
            avg_latency_ms = self.stats.average_latency_ms(),
            queued_tasks = self.channels.tasks_out.depth(),
            "worker progress"
        );
    }

    fn internal(&self, source: AppError) -> WorkerError {
        WorkerError::Internal {
            worker: self.name.clone(),
            source,
        }
    }
}
