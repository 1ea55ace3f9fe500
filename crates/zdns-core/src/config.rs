//! Environment variable reads, grouped by concern. Kept flat (`env::var(..)
//! .unwrap_or_else(..)` at each call site) the way the teacher backend reads
//! `PROXMOX_URL`, `OLLAMA_URL` etc. — no declarative config schema.

use std::env;
use std::time::Duration;

pub fn dns_listen_host() -> String {
    env::var("DNS_LISTEN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

pub fn dns_listen_port() -> u16 {
    env::var("DNS_LISTEN_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(53)
}

pub fn dns_upstream() -> String {
    env::var("DNS_UPSTREAM").unwrap_or_else(|_| "1.1.1.1:53".to_string())
}

pub fn dns_upstream_timeout() -> Duration {
    let secs: f64 = env::var("DNS_UPSTREAM_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2.0);
    Duration::from_secs_f64(secs)
}

pub fn dns_threat_api() -> String {
    env::var("DNS_THREAT_API").unwrap_or_else(|_| "http://127.0.0.1:8000/dns/query".to_string())
}

pub fn dns_threat_timeout() -> Duration {
    let secs: f64 = env::var("DNS_THREAT_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1.5);
    Duration::from_secs_f64(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    Sinkhole,
    NxDomain,
}

pub fn dns_block_mode() -> BlockMode {
    match env::var("DNS_BLOCK_MODE").unwrap_or_default().to_uppercase().as_str() {
        "NXDOMAIN" => BlockMode::NxDomain,
        _ => BlockMode::Sinkhole,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnMode {
    Allow,
    Sinkhole,
    NxDomain,
}

pub fn dns_warn_mode() -> WarnMode {
    match env::var("DNS_WARN_MODE").unwrap_or_default().to_uppercase().as_str() {
        "SINKHOLE" => WarnMode::Sinkhole,
        "NXDOMAIN" => WarnMode::NxDomain,
        _ => WarnMode::Allow,
    }
}

pub fn dns_fail_open() -> bool {
    env::var("DNS_FAIL_OPEN")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(true)
}

pub fn dns_sinkhole_ipv4() -> String {
    env::var("DNS_SINKHOLE_IPV4").unwrap_or_else(|_| "0.0.0.0".to_string())
}

pub fn dns_sinkhole_ipv6() -> String {
    env::var("DNS_SINKHOLE_IPV6").unwrap_or_else(|_| "::".to_string())
}

pub fn taxii_api_key() -> String {
    env::var("ZDNS_TAXII_API_KEY").unwrap_or_else(|_| "zdns-dev-key".to_string())
}

pub fn stix_sync_interval_min() -> i64 {
    env::var("ZDNS_STIX_SYNC_INTERVAL_MIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn rpz_sinkhole() -> String {
    env::var("ZDNS_RPZ_SINKHOLE").unwrap_or_else(|_| "sinkhole.zdns.local.".to_string())
}

pub fn active_window_min() -> i64 {
    env::var("ZDNS_ACTIVE_WINDOW_MIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60)
}

pub fn database_path() -> String {
    env::var("ZDNS_DATABASE_PATH").unwrap_or_else(|_| "events.db".to_string())
}

pub fn classifier_model_path() -> Option<String> {
    env::var("ZDNS_MODEL_PATH").ok()
}

pub fn http_listen_addr() -> String {
    env::var("ZDNS_HTTP_LISTEN").unwrap_or_else(|_| "0.0.0.0:8000".to_string())
}
