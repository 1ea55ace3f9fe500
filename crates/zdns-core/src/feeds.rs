//! Feed ingesters (C5): pull OTX / MISP / hosts-style list URLs and
//! normalize them into STIX indicators (OTX, MISP) or directly into SUFFIX
//! rules (hosts-style lists). Shaped like the teacher's
//! `virustotal::fetch_full_report` — a `reqwest::Client`, a bounded request,
//! best-effort parsing of whatever shape the remote actually returns (spec §7
//! `ExternalMalformed`: skip bad entries, import the rest).

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::error::{ZdnsError, ZdnsResult};
use crate::store::{self, Action, MatchType, NewRule};

const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Wraps a bare domain as a STIX `indicator` object with an
/// `[domain-name:value = '<d>']` pattern, the shape the rule synchronizer
/// (C6) expects to find in `zdns-threat-intel`.
pub fn domain_to_indicator(domain: &str, label: &str) -> serde_json::Value {
    let id = format!("indicator--{}", uuid::Uuid::new_v4());
    let now = store::now_iso();
    serde_json::json!({
        "id": id,
        "type": "indicator",
        "spec_version": "2.1",
        "created": now,
        "modified": now,
        "pattern": format!("[domain-name:value = '{}']", domain),
        "pattern_type": "stix",
        "valid_from": now,
        "labels": [label],
    })
}

// ---------------------------------------------------------------------------
// OTX
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OtxResponse {
    Wrapped { results: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

/// `GET https://otx.alienvault.com/api/v1/indicators/export?type=domain&limit=N`
/// with `X-OTX-API-KEY`. Accepts a JSON list, `{results:[...]}`, or
/// newline-delimited plain text (optionally CSV — first token per line).
pub async fn pull_otx(api_key: &str, limit: u32) -> ZdnsResult<Vec<String>> {
    let client = Client::new();
    let url = format!(
        "https://otx.alienvault.com/api/v1/indicators/export?type=domain&limit={}",
        limit
    );
    let resp = client
        .get(&url)
        .header("X-OTX-API-KEY", api_key)
        .timeout(FEED_TIMEOUT)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(ZdnsError::ExternalMalformed(format!("OTX returned {}", resp.status())));
    }
    let body = resp.text().await?;

    if let Ok(parsed) = serde_json::from_str::<OtxResponse>(&body) {
        let items = match parsed {
            OtxResponse::Wrapped { results } => results,
            OtxResponse::Bare(items) => items,
        };
        return Ok(items.iter().filter_map(extract_domain_field).collect());
    }

    // Plain-text fallback: newline-delimited, optionally CSV.
    Ok(body
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn extract_domain_field(value: &serde_json::Value) -> Option<String> {
    for key in ["indicator", "domain", "value"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// MISP
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MispSearchResponse {
    response: Option<MispResponseInner>,
    #[serde(rename = "Attribute")]
    attribute: Option<Vec<MispAttribute>>,
}

#[derive(Debug, Deserialize)]
struct MispResponseInner {
    #[serde(rename = "Attribute")]
    attribute: Option<Vec<MispAttribute>>,
}

#[derive(Debug, Deserialize)]
struct MispAttribute {
    #[serde(rename = "type")]
    type_: String,
    value: String,
}

/// `POST {base}/attributes/restSearch` with
/// `{type:[domain,hostname,domain|ip], limit, returnFormat:"json"}`.
pub async fn pull_misp(base_url: &str, api_key: &str, limit: u32) -> ZdnsResult<Vec<String>> {
    let client = Client::new();
    let url = format!("{}/attributes/restSearch", base_url.trim_end_matches('/'));
    let resp = client
        .post(&url)
        .header("Authorization", api_key)
        .header("Accept", "application/json")
        .json(&serde_json::json!({
            "type": ["domain", "hostname", "domain|ip"],
            "limit": limit,
            "returnFormat": "json",
        }))
        .timeout(FEED_TIMEOUT)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(ZdnsError::ExternalMalformed(format!("MISP returned {}", resp.status())));
    }
    let parsed: MispSearchResponse = resp
        .json()
        .await
        .map_err(|e| ZdnsError::ExternalMalformed(format!("invalid MISP response: {e}")))?;

    let attrs = parsed
        .response
        .and_then(|r| r.attribute)
        .or(parsed.attribute)
        .unwrap_or_default();

    Ok(attrs
        .into_iter()
        .map(|a| {
            if a.type_ == "domain|ip" {
                a.value.split('|').next().unwrap_or(&a.value).to_string()
            } else {
                a.value
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Hosts-style lists
// ---------------------------------------------------------------------------

/// Parses one hosts-file-style line per spec §4.6. Returns a validated,
/// lowercased, dot-trimmed hostname, or `None` for blank/comment/invalid
/// lines.
pub fn parse_hosts_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") || line.starts_with(';') {
        return None;
    }

    let candidate = if line.starts_with("0.0.0.0") || line.starts_with("127.0.0.1") {
        line.split_whitespace().nth(1)?
    } else if line.starts_with("http://") || line.starts_with("https://") {
        return reqwest::Url::parse(line).ok()?.host_str().map(|h| h.to_string()).filter(|h| is_valid_hostname(&normalize_host(h)));
    } else {
        line.split(|c: char| c.is_whitespace() || c == ',').next()?
    };

    let normalized = normalize_host(candidate);
    if is_valid_hostname(&normalized) {
        Some(normalized)
    } else {
        None
    }
}

fn normalize_host(s: &str) -> String {
    s.trim().trim_end_matches('.').to_lowercase()
}

/// Labels `[a-z0-9-]{1..63}`, no leading/trailing dash, total length <=255,
/// and none of `:/@` anywhere.
fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 255 {
        return false;
    }
    if host.contains(':') || host.contains('/') || host.contains('@') {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

pub struct ListPullOutcome {
    pub imported: i64,
    pub error: Option<String>,
}

/// Pulls one `list_sources` row's URL, parses it line by line, and upserts a
/// SUFFIX rule per valid hostname: BLOCK priority 100 for blocklists, ALLOW
/// priority 1 for whitelists, `source="list"`.
pub async fn pull_list_source(pool: &SqlitePool, source: &store::ListSource) -> ListPullOutcome {
    let client = Client::new();
    let result: ZdnsResult<i64> = async {
        let resp = client.get(&source.url).timeout(FEED_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            return Err(ZdnsError::ExternalMalformed(format!("list fetch returned {}", resp.status())));
        }
        let body = resp.text().await?;

        let (action, priority) = if source.list_type == "whitelist" {
            (Action::Allow, 1)
        } else {
            (Action::Block, 100)
        };

        let mut imported = 0i64;
        for line in body.lines() {
            if let Some(host) = parse_hosts_line(line) {
                let rule = NewRule {
                    name: Some(format!("{}:{}", source.name, host)),
                    pattern: host,
                    match_type: MatchType::Suffix,
                    action,
                    enabled: true,
                    priority,
                    notes: Some(format!("source:{}", source.name)),
                    source: "list".to_string(),
                    expires_at: None,
                };
                store::upsert_rule_by_pattern(pool, &rule).await?;
                imported += 1;
            }
        }
        Ok(imported)
    }
    .await;

    match result {
        Ok(imported) => ListPullOutcome { imported, error: None },
        Err(e) => ListPullOutcome { imported: 0, error: Some(e.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hosts_0_0_0_0_line() {
        assert_eq!(parse_hosts_line("0.0.0.0 bad.example"), Some("bad.example".to_string()));
    }

    #[test]
    fn parses_127_0_0_1_line() {
        assert_eq!(parse_hosts_line("127.0.0.1 bad.example # comment"), Some("bad.example".to_string()));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        assert_eq!(parse_hosts_line("# a comment"), None);
        assert_eq!(parse_hosts_line("  "), None);
        assert_eq!(parse_hosts_line("// also a comment"), None);
        assert_eq!(parse_hosts_line("; semicolon comment"), None);
    }

    #[test]
    fn extracts_host_from_url_line() {
        assert_eq!(parse_hosts_line("https://bad.example/path"), Some("bad.example".to_string()));
    }

    #[test]
    fn plain_domain_line_takes_first_token() {
        assert_eq!(parse_hosts_line("bad.example,extra"), Some("bad.example".to_string()));
        assert_eq!(parse_hosts_line("bad.example"), Some("bad.example".to_string()));
    }

    #[test]
    fn rejects_invalid_hostnames() {
        assert_eq!(parse_hosts_line("-bad.example"), None);
        assert_eq!(parse_hosts_line("has:colon.example"), None);
    }

    #[test]
    fn misp_domain_ip_keeps_left_side() {
        let attrs = vec![
            MispAttribute { type_: "domain|ip".to_string(), value: "evil.test|1.2.3.4".to_string() },
        ];
        let parsed: Vec<String> = attrs
            .into_iter()
            .map(|a| if a.type_ == "domain|ip" { a.value.split('|').next().unwrap_or(&a.value).to_string() } else { a.value })
            .collect();
        assert_eq!(parsed, vec!["evil.test".to_string()]);
    }
}
