//! Rule synchronizer (C6): projects STIX indicators in `zdns-threat-intel`
//! into BLOCK rules. Triggered on demand (`POST /stix/sync`), after each feed
//! pull, and by an optional background timer
//! (`ZDNS_STIX_SYNC_INTERVAL_MIN`).

use sqlx::SqlitePool;

use crate::error::ZdnsResult;
use crate::store::{self, Action, MatchType, NewRule, DEFAULT_COLLECTION_ID};

const PATTERN_KEY: &str = "domain-name:value";

/// Parses the first single-quoted token following `domain-name:value` in a
/// STIX indicator pattern, e.g. `[domain-name:value = 'evil.test']` -> `evil.test`.
pub fn extract_domain_from_pattern(pattern: &str) -> Option<String> {
    let key_pos = pattern.find(PATTERN_KEY)?;
    let rest = &pattern[key_pos + PATTERN_KEY.len()..];
    let start = rest.find('\'')? + 1;
    let end = rest[start..].find('\'')? + start;
    let domain = &rest[start..end];
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

fn indicator_expiry(obj: &serde_json::Value) -> Option<String> {
    obj.get("valid_until")
        .and_then(|v| v.as_str())
        .or_else(|| obj.get("expiration").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

/// Scans indicators in the default collection whose pattern contains
/// `domain-name:value`, and upserts `{EXACT, BLOCK, priority:50,
/// source:"threat_intel", expires_at}` by `(pattern, match_type)`. Idempotent:
/// running it repeatedly on the same indicator set upserts the same rows
/// (same id, same fields) rather than growing the rule count.
pub async fn sync_rules_from_indicators(pool: &SqlitePool) -> ZdnsResult<usize> {
    let indicators = store::list_indicators(pool, DEFAULT_COLLECTION_ID).await?;

    let mut synced = 0usize;
    for indicator in indicators {
        let pattern = match indicator.data.get("pattern").and_then(|v| v.as_str()) {
            Some(p) if p.contains(PATTERN_KEY) => p,
            _ => continue,
        };
        let Some(domain) = extract_domain_from_pattern(pattern) else {
            continue;
        };

        let rule = NewRule {
            name: Some(format!("threat-intel:{}", domain)),
            pattern: domain,
            match_type: MatchType::Exact,
            action: Action::Block,
            enabled: true,
            priority: 50,
            notes: None,
            source: "threat_intel".to_string(),
            expires_at: indicator_expiry(&indicator.data),
        };
        store::upsert_rule_by_pattern(pool, &rule).await?;
        synced += 1;
    }

    Ok(synced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn mem_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        store::open_store_for_pool(&pool).await.unwrap();
        pool
    }

    #[test]
    fn extracts_domain_from_canonical_pattern() {
        assert_eq!(
            extract_domain_from_pattern("[domain-name:value = 'evil.test']"),
            Some("evil.test".to_string())
        );
    }

    #[test]
    fn non_domain_pattern_yields_none() {
        assert_eq!(extract_domain_from_pattern("[ipv4-addr:value = '1.2.3.4']"), None);
    }

    #[tokio::test]
    async fn sync_upserts_block_rule_with_expiry() {
        let pool = mem_pool().await;
        let indicator = serde_json::json!({
            "id": "indicator--1",
            "type": "indicator",
            "pattern": "[domain-name:value = 'evil.test']",
            "valid_until": "2099-01-01T00:00:00Z",
        });
        store::upsert_stix_object(&pool, DEFAULT_COLLECTION_ID, &indicator).await.unwrap();

        let synced = sync_rules_from_indicators(&pool).await.unwrap();
        assert_eq!(synced, 1);

        let rules = store::list_rules(&pool).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "evil.test");
        assert_eq!(rules[0].action, "BLOCK");
        assert_eq!(rules[0].priority, 50);
        assert_eq!(rules[0].source, "threat_intel");
        assert_eq!(rules[0].expires_at.as_deref(), Some("2099-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let pool = mem_pool().await;
        let indicator = serde_json::json!({
            "id": "indicator--1",
            "type": "indicator",
            "pattern": "[domain-name:value = 'evil.test']",
        });
        store::upsert_stix_object(&pool, DEFAULT_COLLECTION_ID, &indicator).await.unwrap();

        sync_rules_from_indicators(&pool).await.unwrap();
        sync_rules_from_indicators(&pool).await.unwrap();

        let rules = store::list_rules(&pool).await.unwrap();
        assert_eq!(rules.len(), 1);
    }
}
