//! Single writer for the session store.
//!
//! The consumer owns the [`SessionStore`] outright and is fed by three
//! channels: discovered places, newly scheduled tasks and completed tasks. Each
//! cycle snapshots the completions that are already queued, then drains and
//! flushes everything else, and only then records the completions. A
//! completion can therefore never reach the database ahead of the places or
//! child tasks its worker sent before it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::{SessionStore, TaskTable};
use crate::errors::AppResult;
use crate::places::{PlaceRecord, PlaceValidationError};
use crate::queues::{Inbox, Received};
use crate::tasks::SearchTask;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub place_batch_size: usize,
    pub commit_every_batches: u64,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

impl ConsumerSettings {
    /// The consumer outlives the workers' idle window so that it never gives up
    /// while a worker is still allowed to produce.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            place_batch_size: config.place_batch_size.max(1),
            commit_every_batches: config.commit_every_batches.max(1),
            idle_timeout: config.idle_timeout() * 2,
            poll_interval: config.queue_poll_interval(),
        }
    }
}

/// Receiving ends of the three channels the consumer drains.
#[derive(Debug)]
pub struct PersistenceInputs {
    pub places: Inbox<Arc<PlaceRecord>>,
    pub pending: Inbox<SearchTask>,
    pub completed: Inbox<SearchTask>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistenceStats {
    pub places_received: u64,
    pub duplicate_places: u64,
    pub places_written: u64,
    pub pending_written: u64,
    pub completed_written: u64,
    pub duplicate_completions: u64,
    pub inserts: u64,
    pub commits: u64,
    pub unfinished_at_shutdown: u64,
    pub session_tables_dropped: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub received: usize,
    pub stop_requested: bool,
    pub all_closed: bool,
}

#[derive(Debug, Default)]
struct Drained<T> {
    items: Vec<T>,
    stop: bool,
    closed: bool,
}

fn drain<T>(inbox: &mut Inbox<T>) -> Drained<T> {
    let mut drained = Drained {
        items: Vec::new(),
        stop: false,
        closed: false,
    };
    loop {
        match inbox.try_recv() {
            Received::Item(item) => drained.items.push(item),
            Received::Stop => {
                drained.stop = true;
                break;
            }
            Received::Closed => {
                drained.closed = true;
                break;
            }
            Received::Empty => break,
        }
    }
    drained
}

pub struct PersistenceConsumer {
    store: SessionStore,
    settings: ConsumerSettings,
    seen_places: HashSet<String>,
    seen_completed: HashSet<String>,
    place_batch: Vec<Arc<PlaceRecord>>,
    pending_batch: Vec<SearchTask>,
    completed_batch: Vec<SearchTask>,
    flushed_batches: u64,
    stats: PersistenceStats,
}

impl PersistenceConsumer {
    pub fn new(store: SessionStore, settings: ConsumerSettings) -> Self {
        Self {
            store,
            settings,
            seen_places: HashSet::new(),
            seen_completed: HashSet::new(),
            place_batch: Vec::new(),
            pending_batch: Vec::new(),
            completed_batch: Vec::new(),
            flushed_batches: 0,
            stats: PersistenceStats::default(),
        }
    }

    pub fn stats(&self) -> &PersistenceStats {
        &self.stats
    }

    pub fn preload_place_ids(&mut self, ids: impl IntoIterator<Item = String>) {
        self.seen_places.extend(ids);
    }

    pub fn preload_completed_task_ids(&mut self, ids: impl IntoIterator<Item = String>) {
        self.seen_completed.extend(ids);
    }

    /// Records the initial task batch as pending before the main loop starts.
    pub fn preload_pending_tasks(&mut self, tasks: &[SearchTask]) -> AppResult<()> {
        self.pending_batch.extend_from_slice(tasks);
        self.flush_pending()?;
        self.commit()
    }

    /// Returns whether the place was new to this session.
    pub fn ingest_place(&mut self, place: Arc<PlaceRecord>) -> AppResult<bool> {
        if !place.is_valid() {
            return Err(PlaceValidationError::NotValidated(place.place_id().to_string()).into());
        }
        self.stats.places_received += 1;
        if !self.seen_places.insert(place.place_id().to_string()) {
            self.stats.duplicate_places += 1;
            return Ok(false);
        }
        self.place_batch.push(place);
        if self.place_batch.len() >= self.settings.place_batch_size {
            self.flush_places()?;
        }
        Ok(true)
    }

    pub fn ingest_pending_task(&mut self, task: SearchTask) -> AppResult<()> {
        self.pending_batch.push(task);
        if self.pending_batch.len() >= self.settings.place_batch_size {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Returns whether the completion was new to this session.
    pub fn ingest_completed_task(&mut self, task: SearchTask) -> AppResult<bool> {
        if !self.seen_completed.insert(task.task_id.clone()) {
            self.stats.duplicate_completions += 1;
            return Ok(false);
        }
        self.completed_batch.push(task);
        if self.completed_batch.len() >= self.settings.place_batch_size {
            self.flush_completed()?;
        }
        Ok(true)
    }

    pub fn consume_cycle(&mut self, inputs: &mut PersistenceInputs) -> AppResult<CycleOutcome> {
        let completed = drain(&mut inputs.completed);
        let pending = drain(&mut inputs.pending);
        let places = drain(&mut inputs.places);

        let received = completed.items.len() + pending.items.len() + places.items.len();
        let stop_requested = completed.stop || pending.stop || places.stop;
        let all_closed = completed.closed && pending.closed && places.closed;

        for task in pending.items {
            self.ingest_pending_task(task)?;
        }
        for place in places.items {
            self.ingest_place(place)?;
        }
        self.flush_places()?;
        self.flush_pending()?;

        for task in completed.items {
            self.ingest_completed_task(task)?;
        }

        Ok(CycleOutcome {
            received,
            stop_requested,
            all_closed,
        })
    }

    /// Consumes until a stop signal, until every producer is gone, or until
    /// nothing arrives for the idle timeout. Storage errors end the loop.
    pub async fn run(mut self, mut inputs: PersistenceInputs) -> AppResult<PersistenceStats> {
        info!(target: "persistence", "persistence consumer started");
        let mut last_activity = Instant::now();
        loop {
            let outcome = self.consume_cycle(&mut inputs)?;
            if outcome.stop_requested {
                info!(target: "persistence", "stop signal received");
                break;
            }
            if outcome.all_closed {
                info!(target: "persistence", "all producers disconnected");
                break;
            }
            if outcome.received > 0 {
                last_activity = Instant::now();
                continue;
            }
            if last_activity.elapsed() >= self.settings.idle_timeout {
                info!(
                    target: "persistence",
                    idle_secs = self.settings.idle_timeout.as_secs(),
                    "no traffic within idle timeout"
                );
                break;
            }
            sleep(self.settings.poll_interval).await;
        }
        // Anything queued behind a stop signal on another channel.
        self.consume_cycle(&mut inputs)?;
        self.shutdown()
    }

    /// Flushes and commits everything, drops the bookkeeping tables when no
    /// task is left unfinished, and closes the store.
    pub fn shutdown(mut self) -> AppResult<PersistenceStats> {
        self.flush_all()?;
        self.commit()?;

        let unfinished = self.store.unfinished_count()?;
        self.stats.unfinished_at_shutdown = unfinished;
        if unfinished == 0 {
            self.store.drop_session_tables()?;
            self.stats.session_tables_dropped = true;
        } else {
            warn!(
                target: "persistence",
                unfinished,
                "unfinished tasks remain; keeping session tables for resume"
            );
        }
        self.store.close()?;
        info!(
            target: "persistence",
            places_written = self.stats.places_written,
            duplicates = self.stats.duplicate_places,
            pending = self.stats.pending_written,
            completed = self.stats.completed_written,
            commits = self.stats.commits,
            "persistence consumer stopped"
        );
        Ok(self.stats)
    }

    fn flush_all(&mut self) -> AppResult<()> {
        self.flush_places()?;
        self.flush_pending()?;
        self.flush_completed()
    }

    fn flush_places(&mut self) -> AppResult<()> {
        if self.place_batch.is_empty() {
            return Ok(());
        }
        let written = self.store.insert_places(&self.place_batch)?;
        self.stats.places_written += written as u64;
        self.place_batch.clear();
        self.after_flush()
    }

    fn flush_pending(&mut self) -> AppResult<()> {
        if self.pending_batch.is_empty() {
            return Ok(());
        }
        let written = self
            .store
            .insert_tasks(TaskTable::Pending, &self.pending_batch)?;
        self.stats.pending_written += written as u64;
        self.pending_batch.clear();
        self.after_flush()
    }

    fn flush_completed(&mut self) -> AppResult<()> {
        if self.completed_batch.is_empty() {
            return Ok(());
        }
        let written = self
            .store
            .insert_tasks(TaskTable::Completed, &self.completed_batch)?;
        self.stats.completed_written += written as u64;
        self.completed_batch.clear();
        self.after_flush()
    }

    fn after_flush(&mut self) -> AppResult<()> {
        self.flushed_batches += 1;
        self.stats.inserts += 1;
        if self.flushed_batches % self.settings.commit_every_batches == 0 {
            self.commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> AppResult<()> {
        if self.store.commit()? {
            self.stats.commits += 1;
            debug!(
                target: "persistence",
                commits = self.stats.commits,
                places = self.stats.places_written,
                "transaction committed"
            );
        }
        Ok(())
    }
}
