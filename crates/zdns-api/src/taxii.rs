//! Local TAXII 2.1 server (C4, serve half) plus the STIX/sync/feed-pull
//! routes that sit behind the same `X-API-Key` check. Shaped after the
//! teacher's `virustotal` external-client pattern but inverted: here this
//! process is the server being polled.

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use zdns_core::config;
use zdns_core::error::ZdnsError;
use zdns_core::store;
use zdns_core::stix;
use zdns_core::sync as rule_sync;
use zdns_core::taxii_client::TaxiiClient;

use crate::error_response;
use crate::state::AppState;

/// `X-API-Key` (case-insensitive header name) must match `ZDNS_TAXII_API_KEY`.
pub fn require_taxii_key(req: &HttpRequest) -> Result<(), HttpResponse> {
    let expected = config::taxii_api_key();
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if provided != Some(expected.as_str()) {
        return Err(error_response::to_response(&ZdnsError::AuthMissing));
    }
    Ok(())
}

#[get("/taxii2")]
pub async fn discovery(req: HttpRequest) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let conn = req.connection_info().clone();
    let base = format!("{}://{}", conn.scheme(), conn.host());
    HttpResponse::Ok().json(serde_json::json!({
        "title": "ZDNS TAXII 2.1",
        "description": "ZDNS Threat Intelligence TAXII server",
        "default": format!("{base}/taxii2/api1"),
        "api_roots": [format!("{base}/taxii2/api1")],
    }))
}

#[get("/taxii2/api1")]
pub async fn api_root(req: HttpRequest) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    HttpResponse::Ok().json(serde_json::json!({
        "title": "ZDNS API Root",
        "versions": ["taxii-2.1"],
        "max_content_length": 10_485_760i64,
    }))
}

#[get("/taxii2/api1/collections")]
pub async fn collections(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    match store::list_collections(&state.pool).await {
        Ok(rows) => HttpResponse::Ok().json(serde_json::json!({ "collections": rows })),
        Err(e) => error_response::to_response(&e),
    }
}

#[get("/taxii2/api1/collections/{id}")]
pub async fn collection(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    match store::get_collection(&state.pool, &path.into_inner()).await {
        Ok(Some(c)) => HttpResponse::Ok().json(c),
        Ok(None) => error_response::to_response(&ZdnsError::NotFound("collection not found".into())),
        Err(e) => error_response::to_response(&e),
    }
}

#[get("/taxii2/api1/collections/{id}/manifest")]
pub async fn manifest(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let collection_id = path.into_inner();
    match store::list_stix_objects(&state.pool, &collection_id, None, 500).await {
        Ok(rows) => HttpResponse::Ok().json(serde_json::json!({ "objects": stix::to_manifest(&rows) })),
        Err(e) => error_response::to_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ObjectsQuery {
    pub added_after: Option<String>,
    pub limit: Option<i64>,
}

#[get("/taxii2/api1/collections/{id}/objects")]
pub async fn list_objects(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    q: web::Query<ObjectsQuery>,
) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let collection_id = path.into_inner();
    let limit = q.limit.unwrap_or(500);
    match store::list_stix_objects(&state.pool, &collection_id, q.added_after.as_deref(), limit).await {
        Ok(rows) => HttpResponse::Ok().json(serde_json::json!({ "objects": rows.into_iter().map(|r| r.data).collect::<Vec<_>>() })),
        Err(e) => error_response::to_response(&e),
    }
}

#[post("/taxii2/api1/collections/{id}/objects")]
pub async fn add_objects(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<serde_json::Value>,
) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let collection_id = path.into_inner();
    let objects = match body.get("objects").and_then(|v| v.as_array()) {
        Some(arr) => arr.clone(),
        None => return error_response::to_response(&ZdnsError::InputInvalid("objects must be a list".into())),
    };
    match stix::ingest_objects(&state.pool, &collection_id, &objects).await {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({ "added": count })),
        Err(e) => error_response::to_response(&e),
    }
}

#[post("/taxii2/import")]
pub async fn import_bundle(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let collection_id = body
        .get("collection_id")
        .and_then(|v| v.as_str())
        .unwrap_or(store::DEFAULT_COLLECTION_ID)
        .to_string();
    match stix::ingest_bundle(&state.pool, &collection_id, &body).await {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({ "added": count })),
        Err(e) => error_response::to_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PullBody {
    pub url: Option<String>,
    pub api_root: Option<String>,
    pub collection_id: Option<String>,
    pub added_after: Option<String>,
}

#[post("/taxii2/pull")]
pub async fn pull(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<PullBody>,
) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let url = match &body.url {
        Some(u) if !u.trim().is_empty() => u.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("url and collection_id are required".into())),
    };
    let collection_id = match &body.collection_id {
        Some(c) if !c.trim().is_empty() => c.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("url and collection_id are required".into())),
    };

    let client = TaxiiClient::new();
    let objects = match client.pull(&url, body.api_root.as_deref(), &collection_id, body.added_after.as_deref()).await {
        Ok(objs) => objs,
        Err(e) => return error_response::to_response(&e),
    };
    match stix::ingest_objects(&state.pool, &collection_id, &objects).await {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({ "added": count })),
        Err(e) => error_response::to_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StixObjectsQuery {
    pub limit: Option<i64>,
    pub only_indicators: Option<bool>,
}

#[get("/stix/objects")]
pub async fn stix_objects(state: web::Data<AppState>, q: web::Query<StixObjectsQuery>) -> HttpResponse {
    let limit = q.limit.unwrap_or(200);
    let rows = match store::list_stix_objects(&state.pool, store::DEFAULT_COLLECTION_ID, None, limit).await {
        Ok(rows) => rows,
        Err(e) => return error_response::to_response(&e),
    };
    let only_indicators = q.only_indicators.unwrap_or(false);
    let objects: Vec<_> = rows
        .into_iter()
        .filter(|r| !only_indicators || r.type_ == "indicator")
        .map(|r| r.data)
        .collect();
    HttpResponse::Ok().json(serde_json::json!({ "objects": objects }))
}

#[post("/stix/sync")]
pub async fn sync(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    match rule_sync::sync_rules_from_indicators(&state.pool).await {
        Ok(synced) => HttpResponse::Ok().json(serde_json::json!({ "synced": synced })),
        Err(e) => error_response::to_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_key_rejects_missing_header() {
        let req = actix_web::test::TestRequest::default().to_http_request();
        assert!(require_taxii_key(&req).is_err());
    }
}
