use anyhow::Result;
use tracing_subscriber::EnvFilter;

use rollcalld::config::Config;
use rollcalld::store::AttendanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let store = AttendanceStore::open(&config.db_path).await?;
    let index = store.load_index().await?;

    tracing::info!(
        db = %config.db_path.display(),
        subjects = store.count_subjects().await?,
        index_entries = index.len(),
        match_threshold = config.match_threshold,
        "roster loaded"
    );

    // The frame-capture front end attaches here and drives the pipeline per
    // attempt; the daemon itself only owns the shared resources.
    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
