//! STIX object store helpers (C4, local half): bundle/array ingestion and
//! manifest projection. The raw per-object upsert/query primitives live in
//! `store` alongside the other tables; this module is the STIX-shaped layer
//! on top of them.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{ZdnsError, ZdnsResult};
use crate::store::{self, StixObjectRow};

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub id: String,
    pub date_added: String,
    pub version: String,
}

pub fn to_manifest(objects: &[StixObjectRow]) -> Vec<ManifestEntry> {
    objects
        .iter()
        .map(|o| ManifestEntry {
            id: o.id.clone(),
            date_added: o.added_at.clone(),
            version: o
                .modified
                .clone()
                .or_else(|| Some(o.added_at.clone()))
                .unwrap_or_default(),
        })
        .collect()
}

/// `POST /taxii2/import` — body must be a STIX bundle (`type == "bundle"`).
pub async fn ingest_bundle(
    pool: &SqlitePool,
    collection_id: &str,
    bundle: &serde_json::Value,
) -> ZdnsResult<usize> {
    let type_ok = bundle.get("type").and_then(|v| v.as_str()) == Some("bundle");
    if !type_ok {
        return Err(ZdnsError::InputInvalid("expected a STIX bundle (type == \"bundle\")".into()));
    }
    let objects = bundle
        .get("objects")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ZdnsError::InputInvalid("bundle missing objects array".into()))?;
    ingest_objects(pool, collection_id, objects).await
}

/// `POST /taxii2/api1/collections/{id}/objects` — upsert a list of STIX
/// objects. Non-array bodies are rejected by the caller before reaching
/// here; skips individual objects that lack an `id` rather than aborting the
/// whole batch (spec §7 `ExternalMalformed`: best-effort parse).
pub async fn ingest_objects(
    pool: &SqlitePool,
    collection_id: &str,
    objects: &[serde_json::Value],
) -> ZdnsResult<usize> {
    let mut count = 0;
    for obj in objects {
        match store::upsert_stix_object(pool, collection_id, obj).await {
            Ok(_) => count += 1,
            Err(e) => log::warn!("[stix] skipping malformed object during ingest: {e}"),
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn mem_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        store::open_store_for_pool(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn ingest_bundle_rejects_non_bundle() {
        let pool = mem_pool().await;
        let err = ingest_bundle(&pool, store::DEFAULT_COLLECTION_ID, &serde_json::json!({"type": "indicator"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ZdnsError::InputInvalid(_)));
    }

    #[tokio::test]
    async fn ingest_bundle_upserts_all_objects() {
        let pool = mem_pool().await;
        let bundle = serde_json::json!({
            "type": "bundle",
            "objects": [
                {"id": "indicator--1", "type": "indicator", "pattern": "[domain-name:value = 'evil.test']"},
                {"id": "indicator--2", "type": "indicator", "pattern": "[domain-name:value = 'evil2.test']"},
            ]
        });
        let count = ingest_bundle(&pool, store::DEFAULT_COLLECTION_ID, &bundle).await.unwrap();
        assert_eq!(count, 2);
        let objs = store::list_stix_objects(&pool, store::DEFAULT_COLLECTION_ID, None, 10).await.unwrap();
        assert_eq!(objs.len(), 2);
    }

    #[tokio::test]
    async fn ingest_objects_skips_missing_id_but_keeps_rest() {
        let pool = mem_pool().await;
        let objects = vec![
            serde_json::json!({"type": "indicator", "pattern": "no id here"}),
            serde_json::json!({"id": "indicator--ok", "type": "indicator", "pattern": "[domain-name:value = 'ok.test']"}),
        ];
        let count = ingest_objects(&pool, store::DEFAULT_COLLECTION_ID, &objects).await.unwrap();
        assert_eq!(count, 1);
    }
}
