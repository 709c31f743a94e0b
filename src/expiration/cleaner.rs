use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::storage::Database;

/// Start the background task that physically removes rows whose TTL has
/// passed. Expired rows are already invisible to reads; this only reclaims
/// space.
pub fn start_expiration_cleaner(db: Database, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);

        loop {
            interval_timer.tick().await;
            run_cleanup(&db).await;
        }
    })
}

/// One sweep, run on the blocking pool. Returns the number of rows removed.
pub async fn run_cleanup(db: &Database) -> usize {
    debug!("Running expiration cleanup");

    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.delete_expired_rows()).await;

    match result {
        Ok(Ok(count)) => {
            if count > 0 {
                debug!(rows_cleaned = count, "Expired rows cleaned");
            }
            count
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to clean up expired rows");
            0
        }
        Err(e) => {
            error!(error = %e, "Expiration cleanup task panicked");
            0
        }
    }
}
