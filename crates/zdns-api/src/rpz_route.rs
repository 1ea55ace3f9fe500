//! `GET /rules/rpz` (C9): renders the current rule set as an RPZ zone file.

use actix_web::{get, web, HttpResponse};
use serde::Deserialize;

use zdns_core::config;
use zdns_core::rpz;
use zdns_core::store;

use crate::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RpzQuery {
    pub zone: Option<String>,
    pub sinkhole: Option<String>,
    pub include_disabled: Option<bool>,
}

#[get("/rules/rpz")]
pub async fn export(state: web::Data<AppState>, q: web::Query<RpzQuery>) -> HttpResponse {
    let rules = match store::list_rules(&state.pool).await {
        Ok(rows) => rows,
        Err(e) => return error_response::to_response(&e),
    };
    let include_disabled = q.include_disabled.unwrap_or(false);
    let rules: Vec<_> = rules.into_iter().filter(|r| include_disabled || r.enabled).collect();

    let zone = q.zone.as_deref().unwrap_or("zones.local");
    let sinkhole = q.sinkhole.clone().unwrap_or_else(config::rpz_sinkhole);
    let body = rpz::render(&rules, zone, &sinkhole);

    HttpResponse::Ok().content_type("text/plain").body(body)
}
