//! Operational HTTP (C10): metrics, events, devices CRUD-adjacent listings,
//! rules CRUD, list-source CRUD plus pull/status, analytics. Handler shapes
//! follow the teacher's `detox_api` module — `web::Data<Pool<..>>` extractor,
//! `#[get]`/`#[post]` attribute routes, JSON in and out.

use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;

use zdns_core::config;
use zdns_core::error::ZdnsError;
use zdns_core::feeds;
use zdns_core::store::{self, Action, MatchType, NewRule};
use zdns_core::sync as rule_sync;

use crate::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[get("/metrics")]
pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    match store::read_metrics(&state.pool, config::active_window_min()).await {
        Ok(m) => HttpResponse::Ok().json(m),
        Err(e) => error_response::to_response(&e),
    }
}

#[get("/events")]
pub async fn events(state: web::Data<AppState>, q: web::Query<LimitQuery>) -> HttpResponse {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    match store::list_events(&state.pool, limit).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response::to_response(&e),
    }
}

#[get("/devices")]
pub async fn devices(state: web::Data<AppState>, q: web::Query<LimitQuery>) -> HttpResponse {
    let limit = q.limit.unwrap_or(50).clamp(1, 1000);
    match store::list_devices(&state.pool, limit).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response::to_response(&e),
    }
}

#[get("/analytics")]
pub async fn analytics(state: web::Data<AppState>) -> HttpResponse {
    match store::analytics(&state.pool).await {
        Ok(a) => HttpResponse::Ok().json(a),
        Err(e) => error_response::to_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Rules CRUD
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RuleBody {
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub match_type: Option<String>,
    pub action: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub notes: Option<String>,
    pub expires_at: Option<String>,
}

fn parse_new_rule(body: &RuleBody) -> Result<NewRule, ZdnsError> {
    let name = body
        .name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ZdnsError::InputInvalid("name is required".into()))?;
    let pattern = body
        .pattern
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ZdnsError::InputInvalid("pattern is required".into()))?;
    let match_type = body
        .match_type
        .as_deref()
        .and_then(MatchType::parse)
        .ok_or_else(|| ZdnsError::InputInvalid("match_type must be EXACT, SUFFIX or REGEX".into()))?;
    let action = body
        .action
        .as_deref()
        .and_then(Action::parse)
        .ok_or_else(|| ZdnsError::InputInvalid("action must be ALLOW, WARN or BLOCK".into()))?;

    Ok(NewRule {
        name: body.name.clone(),
        pattern,
        match_type,
        action,
        enabled: body.enabled.unwrap_or(true),
        priority: body.priority.unwrap_or(100),
        notes: body.notes.clone(),
        source: "admin".to_string(),
        expires_at: body.expires_at.clone(),
    })
}

#[get("/rules")]
pub async fn list_rules(state: web::Data<AppState>) -> HttpResponse {
    match store::list_rules(&state.pool).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response::to_response(&e),
    }
}

#[post("/rules")]
pub async fn create_rule(state: web::Data<AppState>, body: web::Json<RuleBody>) -> HttpResponse {
    let new_rule = match parse_new_rule(&body) {
        Ok(r) => r,
        Err(e) => return error_response::to_response(&e),
    };
    match store::create_rule(&state.pool, &new_rule).await {
        Ok(id) => HttpResponse::Ok().json(serde_json::json!({ "id": id })),
        Err(e) => error_response::to_response(&e),
    }
}

#[put("/rules/{id}")]
pub async fn update_rule(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<RuleBody>,
) -> HttpResponse {
    let new_rule = match parse_new_rule(&body) {
        Ok(r) => r,
        Err(e) => return error_response::to_response(&e),
    };
    match store::update_rule(&state.pool, path.into_inner(), &new_rule).await {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({ "status": "updated" })),
        Ok(false) => error_response::to_response(&ZdnsError::NotFound("rule not found".into())),
        Err(e) => error_response::to_response(&e),
    }
}

#[delete("/rules/{id}")]
pub async fn delete_rule(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    match store::delete_rule(&state.pool, path.into_inner()).await {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({ "status": "deleted" })),
        Ok(false) => error_response::to_response(&ZdnsError::NotFound("rule not found".into())),
        Err(e) => error_response::to_response(&e),
    }
}

// ---------------------------------------------------------------------------
// List sources CRUD + pull + status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListSourceBody {
    pub name: Option<String>,
    pub list_type: Option<String>,
    pub url: Option<String>,
    pub enabled: Option<bool>,
}

#[get("/lists")]
pub async fn list_lists(state: web::Data<AppState>) -> HttpResponse {
    match store::list_list_sources(&state.pool).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response::to_response(&e),
    }
}

#[post("/lists")]
pub async fn create_list(state: web::Data<AppState>, body: web::Json<ListSourceBody>) -> HttpResponse {
    let name = match &body.name {
        Some(n) if !n.trim().is_empty() => n.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("name is required".into())),
    };
    let url = match &body.url {
        Some(u) if !u.trim().is_empty() => u.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("url is required".into())),
    };
    let list_type = match body.list_type.as_deref() {
        Some("blocklist") => "blocklist",
        Some("whitelist") => "whitelist",
        _ => return error_response::to_response(&ZdnsError::InputInvalid("list_type must be blocklist or whitelist".into())),
    };
    match store::create_list_source(&state.pool, &name, list_type, &url).await {
        Ok(id) => HttpResponse::Ok().json(serde_json::json!({ "id": id })),
        Err(e) => error_response::to_response(&e),
    }
}

#[put("/lists/{id}")]
pub async fn update_list(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<ListSourceBody>,
) -> HttpResponse {
    let name = match &body.name {
        Some(n) if !n.trim().is_empty() => n.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("name is required".into())),
    };
    let url = match &body.url {
        Some(u) if !u.trim().is_empty() => u.clone(),
        _ => return error_response::to_response(&ZdnsError::InputInvalid("url is required".into())),
    };
    let list_type = match body.list_type.as_deref() {
        Some("blocklist") => "blocklist",
        Some("whitelist") => "whitelist",
        _ => return error_response::to_response(&ZdnsError::InputInvalid("list_type must be blocklist or whitelist".into())),
    };
    let enabled = body.enabled.unwrap_or(true);
    match store::update_list_source(&state.pool, path.into_inner(), &name, list_type, &url, enabled).await {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({ "status": "updated" })),
        Ok(false) => error_response::to_response(&ZdnsError::NotFound("list source not found".into())),
        Err(e) => error_response::to_response(&e),
    }
}

#[delete("/lists/{id}")]
pub async fn delete_list(state: web::Data<AppState>, path: web::Path<i64>) -> HttpResponse {
    match store::delete_list_source(&state.pool, path.into_inner()).await {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({ "status": "deleted" })),
        Ok(false) => error_response::to_response(&ZdnsError::NotFound("list source not found".into())),
        Err(e) => error_response::to_response(&e),
    }
}

#[get("/lists/status")]
pub async fn list_status(state: web::Data<AppState>) -> HttpResponse {
    match store::list_list_sources(&state.pool).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response::to_response(&e),
    }
}

/// Pulls every enabled `list_sources` row inline and returns a per-source
/// summary. No fire-and-forget (spec §5): the handler awaits every pull
/// before responding.
#[post("/lists/pull")]
pub async fn pull_lists(state: web::Data<AppState>) -> HttpResponse {
    let sources = match store::list_list_sources(&state.pool).await {
        Ok(rows) => rows,
        Err(e) => return error_response::to_response(&e),
    };

    let mut summary = Vec::new();
    for source in sources.iter().filter(|s| s.enabled) {
        let outcome = feeds::pull_list_source(&state.pool, source).await;
        if let Err(e) = store::record_list_outcome(
            &state.pool,
            source.id,
            Some(outcome.imported),
            outcome.error.as_deref(),
        )
        .await
        {
            log::warn!("[lists] failed to record outcome for {}: {e}", source.name);
        }
        summary.push(serde_json::json!({
            "name": source.name,
            "imported": outcome.imported,
            "error": outcome.error,
        }));
    }

    if let Err(e) = rule_sync::sync_rules_from_indicators(&state.pool).await {
        log::warn!("[lists] post-pull sync failed: {e}");
    }

    HttpResponse::Ok().json(serde_json::json!({ "results": summary }))
}
