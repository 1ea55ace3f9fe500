//! `POST /feeds/otx/pull` and `POST /feeds/misp/pull`: pull domains from an
//! external feed, wrap each as a STIX indicator, ingest, then run the rule
//! synchronizer so the pull takes effect immediately rather than waiting for
//! the next sync tick.

use actix_web::{post, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use zdns_core::error::ZdnsError;
use zdns_core::feeds;
use zdns_core::store;
use zdns_core::stix;
use zdns_core::sync as rule_sync;

use crate::error_response;
use crate::state::AppState;
use crate::taxii::require_taxii_key;

#[derive(Debug, Deserialize)]
pub struct OtxPullBody {
    pub api_key: Option<String>,
    pub limit: Option<u32>,
}

#[post("/feeds/otx/pull")]
pub async fn otx_pull(req: HttpRequest, state: web::Data<AppState>, body: web::Json<OtxPullBody>) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let api_key = match &body.api_key {
        Some(k) if !k.trim().is_empty() => k.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("api_key required".into())),
    };
    let limit = body.limit.unwrap_or(1000);

    let domains = match feeds::pull_otx(&api_key, limit).await {
        Ok(d) => d,
        Err(e) => return error_response::to_response(&e),
    };
    ingest_and_sync(&state, domains, "otx").await
}

#[derive(Debug, Deserialize)]
pub struct MispPullBody {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub limit: Option<u32>,
}

#[post("/feeds/misp/pull")]
pub async fn misp_pull(req: HttpRequest, state: web::Data<AppState>, body: web::Json<MispPullBody>) -> HttpResponse {
    if let Err(resp) = require_taxii_key(&req) {
        return resp;
    }
    let base_url = match &body.base_url {
        Some(u) if !u.trim().is_empty() => u.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("base_url and api_key required".into())),
    };
    let api_key = match &body.api_key {
        Some(k) if !k.trim().is_empty() => k.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("base_url and api_key required".into())),
    };
    let limit = body.limit.unwrap_or(1000);

    let domains = match feeds::pull_misp(&base_url, &api_key, limit).await {
        Ok(d) => d,
        Err(e) => return error_response::to_response(&e),
    };
    ingest_and_sync(&state, domains, "misp").await
}

async fn ingest_and_sync(state: &web::Data<AppState>, domains: Vec<String>, label: &str) -> HttpResponse {
    let objects: Vec<serde_json::Value> = domains
        .iter()
        .map(|d| feeds::domain_to_indicator(d, label))
        .collect();
    let imported = match stix::ingest_objects(&state.pool, store::DEFAULT_COLLECTION_ID, &objects).await {
        Ok(count) => count,
        Err(e) => return error_response::to_response(&e),
    };
    let synced = match rule_sync::sync_rules_from_indicators(&state.pool).await {
        Ok(n) => n,
        Err(e) => return error_response::to_response(&e),
    };
    HttpResponse::Ok().json(serde_json::json!({ "imported": imported, "synced": synced }))
}
