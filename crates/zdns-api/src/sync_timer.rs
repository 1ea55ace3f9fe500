//! Background periodic STIX sync, gated on `ZDNS_STIX_SYNC_INTERVAL_MIN`.
//! Replaces the teacher's daemon-thread-plus-sleep-loop pattern (see
//! `main.rs`'s relay threads) with a `tokio::spawn`ed interval loop, since
//! this process is already async end to end.

use std::time::Duration;

use sqlx::SqlitePool;

use zdns_core::config;
use zdns_core::sync as rule_sync;

/// No-op when the interval is `<= 0` (disabled by default), matching the
/// Python original's `_start_auto_sync`.
pub fn spawn(pool: SqlitePool) {
    let interval_min = config::stix_sync_interval_min();
    if interval_min <= 0 {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs((interval_min * 60) as u64));
        loop {
            ticker.tick().await;
            match rule_sync::sync_rules_from_indicators(&pool).await {
                Ok(synced) => log::info!("[sync] background sync upserted {synced} rules"),
                Err(e) => log::warn!("[sync] background sync failed: {e}"),
            }
        }
    });
}
