use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use poi_harvester::{
    init_tracing, initial_tasks, load_credentials, load_place_types, run_session, AppConfig,
    HttpNearbySearch,
};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let config = AppConfig::from_env();
    info!(
        target: "session",
        config = %serde_json::to_string(&config.public_profile())?,
        "configuration loaded"
    );

    let credentials = load_credentials(&config).context("loading API credentials")?;
    let seeds = if config.resume {
        Vec::new()
    } else {
        let place_types = load_place_types(&config.search_types_file, &config.valid_types_file)
            .context("loading place types")?;
        initial_tasks(&config, &place_types).context("building seed tasks")?
    };
    let api = Arc::new(HttpNearbySearch::new(&config).context("building HTTP client")?);

    let report = run_session(&config, credentials, api, seeds)
        .await
        .context("running crawl session")?;
    report.log_summary();

    if report.has_fatal_errors() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
