use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::places::PlaceRecord;
use crate::queues::{Inbox, Received};

const PROGRESS_EVERY: u64 = 1_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveStats {
    pub written: u64,
    pub failed: u64,
}

/// Writes the raw API payload of every discovered place to
/// `<dir>/<place_id><extension>`. Best effort: a failed write is logged and
/// skipped.
pub struct RawArchiver {
    dir: PathBuf,
    extension: String,
    idle_timeout: Duration,
    poll_interval: Duration,
    stats: ArchiveStats,
}

impl RawArchiver {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: &str,
        idle_timeout: Duration,
        poll_interval: Duration,
    ) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let extension = if extension.is_empty() || extension.starts_with('.') {
            extension.to_string()
        } else {
            format!(".{extension}")
        };
        Ok(Self {
            dir,
            extension,
            idle_timeout,
            poll_interval,
            stats: ArchiveStats::default(),
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            config.raw_archive_path(),
            &config.raw_file_extension,
            config.idle_timeout() * 2,
            config.queue_poll_interval(),
        )
    }

    pub fn path_for(&self, place_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", sanitize(place_id), self.extension))
    }

    pub fn write(&mut self, place: &PlaceRecord) -> AppResult<()> {
        let serialized = serde_json::to_string_pretty(place.raw())?;
        fs::write(self.path_for(place.place_id()), serialized)?;
        self.stats.written += 1;
        Ok(())
    }

    pub async fn run(mut self, mut inbox: Inbox<Arc<PlaceRecord>>) -> ArchiveStats {
        info!(target: "archive", dir = %self.dir.display(), "raw archiver started");
        let mut last_activity = Instant::now();
        loop {
            match inbox.recv_timeout(self.poll_interval).await {
                Received::Item(place) => {
                    last_activity = Instant::now();
                    if let Err(err) = self.write(&place) {
                        self.stats.failed += 1;
                        warn!(
                            target: "archive",
                            place_id = place.place_id(),
                            error = %err,
                            "failed to archive raw payload"
                        );
                        continue;
                    }
                    if self.stats.written % PROGRESS_EVERY == 0 {
                        info!(target: "archive", written = self.stats.written, "raw payloads archived");
                    }
                }
                Received::Stop => {
                    info!(target: "archive", "stop signal received");
                    break;
                }
                Received::Closed => break,
                Received::Empty => {
                    if last_activity.elapsed() >= self.idle_timeout {
                        info!(target: "archive", "no traffic within idle timeout");
                        break;
                    }
                }
            }
        }
        info!(
            target: "archive",
            written = self.stats.written,
            failed = self.stats.failed,
            "raw archiver stopped"
        );
        self.stats
    }
}

/// Keeps file names inside the archive directory.
fn sanitize(place_id: &str) -> String {
    place_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
