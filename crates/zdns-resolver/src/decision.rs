//! Calls zdns-api's `/dns/query` per incoming packet and applies the
//! fail-open/fail-closed policy from spec §4.3 step 7 when that call itself
//! fails or times out.

use serde::Deserialize;
use zdns_core::config;
use zdns_core::rayid::{new_ray_id, FAIL_CLOSED_RAY_ID};

#[derive(Debug, Deserialize)]
pub struct DnsQueryResponse {
    pub action: String,
    pub ray_id: String,
    #[allow(dead_code)]
    pub score: f64,
    #[allow(dead_code)]
    pub source: String,
}

/// Resolves to a decision even when the HTTP call fails: fail-open maps an
/// unreachable/erroring decision API to `ALLOW` with a freshly generated ray
/// id (spec §4.3 names a synthetic sentinel only for the fail-closed case),
/// fail-closed to a synthetic `BLOCK` carrying the `RAY-fail-closed`
/// sentinel.
pub async fn decide(client: &reqwest::Client, domain: &str, client_ip: &str, qtype: &str) -> DnsQueryResponse {
    let body = serde_json::json!({
        "domain": domain,
        "client_ip": client_ip,
        "qtype": qtype,
    });

    let result = client
        .post(config::dns_threat_api())
        .timeout(config::dns_threat_timeout())
        .json(&body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => match resp.json::<DnsQueryResponse>().await {
            Ok(decision) => decision,
            Err(e) => {
                log::error!("[dns] decision API returned unparseable body for {domain}: {e}");
                fallback()
            }
        },
        Ok(resp) => {
            log::error!("[dns] decision API returned status {} for {domain}", resp.status());
            fallback()
        }
        Err(e) => {
            log::error!("[dns] decision API unreachable for {domain}: {e}");
            fallback()
        }
    }
}

fn fallback() -> DnsQueryResponse {
    if config::dns_fail_open() {
        DnsQueryResponse {
            action: "ALLOW".to_string(),
            ray_id: new_ray_id(),
            score: 0.0,
            source: "fail_open".to_string(),
        }
    } else {
        DnsQueryResponse {
            action: "BLOCK".to_string(),
            ray_id: FAIL_CLOSED_RAY_ID.to_string(),
            score: 1.0,
            source: "fail_closed".to_string(),
        }
    }
}
