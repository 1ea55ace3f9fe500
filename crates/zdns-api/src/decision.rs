//! Decision HTTP API (C7): the one endpoint the DNS data plane calls per
//! query. Synchronous from the caller's view — reads the policy engine,
//! which itself logs the event and bumps device/metric counters, then
//! returns the decision plus a redirect hint for BLOCK/WARN.

use actix_web::{post, web, HttpResponse};
use serde::Deserialize;

use crate::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DnsQueryRequest {
    pub domain: Option<String>,
    pub client_ip: Option<String>,
    pub qtype: Option<String>,
}

#[post("/dns/query")]
pub async fn dns_query(state: web::Data<AppState>, body: web::Json<DnsQueryRequest>) -> HttpResponse {
    let domain = match &body.domain {
        Some(d) if !d.trim().is_empty() => d.clone(),
        _ => {
            return HttpResponse::BadRequest().json(serde_json::json!({ "error": "domain is required" }));
        }
    };

    let classifier = match state.classifier.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let decision = zdns_core::policy::evaluate(
        &state.pool,
        &classifier,
        &domain,
        body.client_ip.as_deref(),
        body.qtype.as_deref(),
    )
    .await;

    match decision {
        Ok(d) => {
            let redirect = match d.action.as_str() {
                "BLOCK" => Some(format!("/block/malicious?domain={}&ray_id={}", urlencoding::encode(&domain), d.ray_id)),
                "WARN" => Some(format!("/block/warning?domain={}&ray_id={}", urlencoding::encode(&domain), d.ray_id)),
                _ => None,
            };
            HttpResponse::Ok().json(serde_json::json!({
                "action": d.action,
                "ray_id": d.ray_id,
                "timestamp": d.timestamp,
                "score": d.score,
                "label": d.label,
                "source": d.source,
                "redirect": redirect,
            }))
        }
        Err(e) => error_response::to_response(&e),
    }
}
