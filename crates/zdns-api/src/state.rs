//! Shared `web::Data` handles, mirroring the teacher's `pool_data` /
//! `ai_manager` `web::Data::new(...)` clones passed into every worker.

use std::sync::RwLock;

use sqlx::SqlitePool;
use zdns_core::classifier::Classifier;

/// Holds the immutable-until-reload classifier behind a `RwLock` so
/// `/model/train` can swap in a freshly loaded pipeline without restarting
/// the process (spec §9: "explicit `reload()` for retraining").
pub struct AppState {
    pub pool: SqlitePool,
    pub classifier: RwLock<Classifier>,
}

impl AppState {
    pub fn new(pool: SqlitePool, classifier: Classifier) -> Self {
        AppState {
            pool,
            classifier: RwLock::new(classifier),
        }
    }
}
