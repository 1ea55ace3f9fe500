//! Sinkhole/block-page rendering: the static query-param pages under
//! `/block/*`, the root handler, and the catch-all that resolves a sinkholed
//! host into the right page. No template engine in this stack — minimal
//! inline HTML, matching the teacher's plain `.body(format!(...))` handlers.

use actix_web::{get, http::StatusCode, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use zdns_core::store;

use crate::error_response;
use crate::state::AppState;

const EXCLUDED_PREFIXES: &[&str] = &[
    "dashboard", "block", "static", "metrics", "events", "rules", "devices", "analytics", "model",
];

#[derive(Debug, Deserialize)]
pub struct BlockQuery {
    pub domain: Option<String>,
    pub ray_id: Option<String>,
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head><body>{body}</body></html>"
    )
}

#[get("/block/malicious")]
pub async fn malicious(q: web::Query<BlockQuery>) -> HttpResponse {
    let domain = q.domain.as_deref().unwrap_or("unknown");
    let ray_id = q.ray_id.as_deref().unwrap_or("RAY-unknown");
    let body = page(
        "Blocked - ZDNS",
        &format!(
            "<h1>Access blocked</h1><p>Domain: {domain}</p><p>Category: DGA Malware</p><p>Ray ID: {ray_id}</p>"
        ),
    );
    HttpResponse::Ok().content_type("text/html").body(body)
}

#[get("/block/warning")]
pub async fn warning(q: web::Query<BlockQuery>) -> HttpResponse {
    let domain = q.domain.as_deref().unwrap_or("unknown");
    let ray_id = q.ray_id.as_deref().unwrap_or("RAY-unknown");
    let body = page(
        "Warning - ZDNS",
        &format!(
            "<h1>Proceed with caution</h1><p>Domain: {domain}</p><p>Category: Unusual Entropy</p><p>Ray ID: {ray_id}</p>"
        ),
    );
    HttpResponse::Ok().content_type("text/html").body(body)
}

#[get("/block/error")]
pub async fn error(q: web::Query<BlockQuery>) -> HttpResponse {
    let domain = q.domain.as_deref().unwrap_or("unknown");
    let ray_id = q.ray_id.as_deref().unwrap_or("RAY-unknown");
    let body = page(
        "DNS Error - ZDNS",
        &format!("<h1>DNS resolution failed</h1><p>Domain: {domain}</p><p>Ray ID: {ray_id}</p>"),
    );
    HttpResponse::Ok()
        .status(StatusCode::NOT_FOUND)
        .content_type("text/html")
        .body(body)
}

#[get("/block/maintenance")]
pub async fn maintenance() -> HttpResponse {
    let body = page("Maintenance - ZDNS", "<h1>ZDNS is undergoing maintenance</h1>");
    HttpResponse::Ok().content_type("text/html").body(body)
}

fn domain_from_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_lowercase()
}

/// Looks up the most recent decision for `domain` and renders the matching
/// block/warn page, or `None` if the domain has no recorded decision or the
/// decision wasn't BLOCK/WARN.
async fn render_sinkhole_for_host(state: &AppState, host: &str) -> Option<HttpResponse> {
    let domain = domain_from_host(host);
    if domain.is_empty() || domain == "localhost" || domain == "127.0.0.1" {
        return None;
    }

    let event = match store::latest_event_for_domain(&state.pool, &domain).await {
        Ok(Some(e)) => e,
        Ok(None) => {
            let body = page(
                "DNS Error - ZDNS",
                &format!("<h1>No decision on record</h1><p>Domain: {domain}</p><p>Error: NO_DECISION</p>"),
            );
            return Some(HttpResponse::NotFound().content_type("text/html").body(body));
        }
        Err(e) => return Some(error_response::to_response(&e)),
    };

    match event.action.as_str() {
        "BLOCK" => {
            let category = event.label.as_deref().unwrap_or("Threat");
            let body = page(
                "Blocked - ZDNS",
                &format!(
                    "<h1>Access blocked</h1><p>Domain: {domain}</p><p>Category: {category}</p><p>Ray ID: {}</p><p>Source: {}</p>",
                    event.ray_id, event.source
                ),
            );
            Some(HttpResponse::Ok().content_type("text/html").body(body))
        }
        "WARN" => {
            let category = event.label.as_deref().unwrap_or("Suspicious");
            let body = page(
                "Warning - ZDNS",
                &format!(
                    "<h1>Proceed with caution</h1><p>Domain: {domain}</p><p>Category: {category}</p><p>Risk score: {}</p><p>Ray ID: {}</p>",
                    event.score, event.ray_id
                ),
            );
            Some(HttpResponse::Ok().content_type("text/html").body(body))
        }
        _ => None,
    }
}

#[get("/")]
pub async fn root(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let host = req.headers().get("host").and_then(|v| v.to_str().ok()).unwrap_or("");
    if let Some(resp) = render_sinkhole_for_host(&state, host).await {
        return resp;
    }
    HttpResponse::Ok().json(serde_json::json!({ "status": "ZDNS running" }))
}

/// Matches any path not already claimed by a registered service. A sinkholed
/// client queries `http://<blocked-domain>/` for a redirect page; this is
/// that page.
pub async fn catch_all(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let path = req.path().trim_start_matches('/');
    if EXCLUDED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": "Not found" }));
    }

    let host = req.headers().get("host").and_then(|v| v.to_str().ok()).unwrap_or("");
    if let Some(resp) = render_sinkhole_for_host(&state, host).await {
        return resp;
    }
    HttpResponse::NotFound().json(serde_json::json!({ "error": "Not found" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_from_host_strips_port() {
        assert_eq!(domain_from_host("evil.test:8443"), "evil.test");
    }
}
