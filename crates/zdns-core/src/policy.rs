//! The policy engine (C3): merges admin/list/threat-intel rules, classifier
//! output and device bookkeeping into one `Decision` per domain.

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::classifier::Classifier;
use crate::error::ZdnsResult;
use crate::rayid::new_ray_id;
use crate::store::{self, MatchType, NewEvent};

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action: String,
    pub score: f64,
    pub label: String,
    pub source: String,
    pub ray_id: String,
    pub timestamp: String,
    pub rule_id: Option<i64>,
}

pub async fn evaluate(
    pool: &SqlitePool,
    classifier: &Classifier,
    domain: &str,
    client_ip: Option<&str>,
    qtype: Option<&str>,
) -> ZdnsResult<Decision> {
    let normalized = normalize_domain(domain);
    let now = Utc::now();
    let ray_id = new_ray_id();
    let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let rules = store::list_enabled_rules_ordered(pool).await?;

    let mut decision = None;
    for rule in &rules {
        if is_expired(&rule.expires_at, now) {
            continue;
        }
        if rule_matches(&normalized, &rule.pattern, &rule.match_type) {
            let action = store::Action::parse(&rule.action).unwrap_or(store::Action::Allow);
            let source = if rule.source == "threat_intel" {
                "threat_intel"
            } else {
                "admin"
            };
            let score = match action {
                store::Action::Block => 1.0,
                store::Action::Warn => 0.7,
                store::Action::Allow => 0.0,
            };
            decision = Some(Decision {
                action: action.as_str().to_string(),
                score,
                label: "ADMIN_RULE".to_string(),
                source: source.to_string(),
                ray_id: ray_id.clone(),
                timestamp: timestamp.clone(),
                rule_id: Some(rule.id),
            });
            break;
        }
    }

    let decision = match decision {
        Some(d) => d,
        None => {
            let classified = classifier.classify(&normalized);
            let action = if classified.score >= 0.9 {
                "BLOCK"
            } else if classified.score >= 0.6 {
                "WARN"
            } else {
                "ALLOW"
            };
            Decision {
                action: action.to_string(),
                score: classified.score,
                label: classified.label.as_str().to_string(),
                source: classified.source.to_string(),
                ray_id: ray_id.clone(),
                timestamp: timestamp.clone(),
                rule_id: None,
            }
        }
    };

    store::append_event(
        pool,
        &NewEvent {
            ray_id: decision.ray_id.clone(),
            domain: normalized.clone(),
            score: decision.score,
            action: decision.action.clone(),
            timestamp: decision.timestamp.clone(),
            source: decision.source.clone(),
            client_ip: client_ip.map(|s| s.to_string()),
            rule_id: decision.rule_id,
            rule_action: decision.rule_id.map(|_| decision.action.clone()),
            label: Some(decision.label.clone()),
            qtype: qtype.map(|s| s.to_string()),
            raw_json: None,
        },
    )
    .await?;

    if let Some(ip) = client_ip {
        store::upsert_device(pool, ip, &decision.action).await?;
    }

    Ok(decision)
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

fn is_expired(expires_at: &Option<String>, now: chrono::DateTime<Utc>) -> bool {
    match expires_at {
        None => false,
        Some(s) => match chrono::DateTime::parse_from_rfc3339(s) {
            Ok(dt) => dt.with_timezone(&Utc) <= now,
            // A malformed expiry is surfaced at write time (rules CRUD); at
            // evaluation time we treat it as non-expiring rather than
            // silently dropping an otherwise-valid rule.
            Err(_) => false,
        },
    }
}

/// A malformed regex must never match and must never panic the evaluator
/// (spec §7 `PatternInvalid`).
fn rule_matches(domain: &str, pattern: &str, match_type: &str) -> bool {
    match MatchType::parse(match_type) {
        Some(MatchType::Exact) => domain == pattern,
        Some(MatchType::Suffix) => domain == pattern || domain.ends_with(&format!(".{}", pattern)),
        Some(MatchType::Regex) => match Regex::new(pattern) {
            Ok(re) => re.is_match(domain),
            Err(_) => false,
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn mem_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::store::open_store_for_pool(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn benign_domain_allows_via_heuristic() {
        let pool = mem_pool().await;
        let classifier = Classifier::new(None);
        let decision = evaluate(&pool, &classifier, "google.com", Some("10.0.0.1"), Some("A"))
            .await
            .unwrap();
        assert_eq!(decision.action, "ALLOW");
        assert_eq!(decision.source, "heuristic");
    }

    #[tokio::test]
    async fn admin_suffix_rule_blocks_subdomain_and_exact() {
        let pool = mem_pool().await;
        let classifier = Classifier::new(None);
        store::create_rule(
            &pool,
            &store::NewRule {
                name: Some("ads".into()),
                pattern: "ads.example".into(),
                match_type: MatchType::Suffix,
                action: store::Action::Block,
                enabled: true,
                priority: 10,
                notes: None,
                source: "admin".into(),
                expires_at: None,
            },
        )
        .await
        .unwrap();

        let d1 = evaluate(&pool, &classifier, "tracker.ads.example", None, None).await.unwrap();
        assert_eq!(d1.action, "BLOCK");
        assert_eq!(d1.source, "admin");

        let d2 = evaluate(&pool, &classifier, "ads.example", None, None).await.unwrap();
        assert_eq!(d2.action, "BLOCK");

        let d3 = evaluate(&pool, &classifier, "notads.example", None, None).await.unwrap();
        assert_ne!(d3.source, "admin");
    }

    #[tokio::test]
    async fn expired_rule_never_matches() {
        let pool = mem_pool().await;
        let classifier = Classifier::new(None);
        store::create_rule(
            &pool,
            &store::NewRule {
                name: Some("expired".into()),
                pattern: "google.com".into(),
                match_type: MatchType::Exact,
                action: store::Action::Block,
                enabled: true,
                priority: 5,
                notes: None,
                source: "admin".into(),
                expires_at: Some("2000-01-01T00:00:00Z".into()),
            },
        )
        .await
        .unwrap();

        let decision = evaluate(&pool, &classifier, "google.com", None, None).await.unwrap();
        assert_eq!(decision.action, "ALLOW");
        assert_eq!(decision.source, "heuristic");
    }

    #[tokio::test]
    async fn lower_priority_number_wins_ties_break_on_id() {
        let pool = mem_pool().await;
        let classifier = Classifier::new(None);
        store::create_rule(
            &pool,
            &store::NewRule {
                name: None,
                pattern: "x.test".into(),
                match_type: MatchType::Exact,
                action: store::Action::Warn,
                enabled: true,
                priority: 50,
                notes: None,
                source: "admin".into(),
                expires_at: None,
            },
        )
        .await
        .unwrap();
        store::create_rule(
            &pool,
            &store::NewRule {
                name: None,
                pattern: "x.test".into(),
                match_type: MatchType::Exact,
                action: store::Action::Block,
                enabled: true,
                priority: 10,
                notes: None,
                source: "admin".into(),
                expires_at: None,
            },
        )
        .await
        .unwrap();

        let decision = evaluate(&pool, &classifier, "x.test", None, None).await.unwrap();
        assert_eq!(decision.action, "BLOCK");
    }

    #[test]
    fn malformed_regex_never_matches() {
        assert!(!rule_matches("evil.test", "(unclosed", "REGEX"));
    }
}
