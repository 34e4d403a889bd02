use std::collections::HashSet;

use tracing::info;

use crate::db::{SessionStore, SESSION_TABLES};
use crate::errors::{AppError, AppResult};
use crate::tasks::SearchTask;

/// What a resumed session picks up from the previous run.
#[derive(Debug, Default)]
pub struct ResumeState {
    pub unfinished: Vec<SearchTask>,
    pub place_ids: HashSet<String>,
    pub completed_ids: HashSet<String>,
}

pub fn restore(store: &SessionStore) -> AppResult<ResumeState> {
    let tables = store.existing_tables()?;
    if let Some(missing) = SESSION_TABLES.iter().find(|table| !tables.contains(**table)) {
        return Err(AppError::Config(format!(
            "cannot resume session from {}: table `{missing}` does not exist",
            store.path().display()
        )));
    }

    let state = ResumeState {
        unfinished: store.unfinished_tasks()?,
        place_ids: store.known_place_ids()?,
        completed_ids: store.completed_task_ids()?,
    };
    info!(
        target: "session",
        unfinished = state.unfinished.len(),
        places = state.place_ids.len(),
        completed = state.completed_ids.len(),
        "restored previous session"
    );
    Ok(state)
}
