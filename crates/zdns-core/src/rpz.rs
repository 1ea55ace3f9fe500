//! RPZ exporter (C9): renders the current rule set as a DNS Response Policy
//! Zone for external resolvers. Pure string rendering over `store::Rule` —
//! no I/O of its own, so `zdns-api`'s `/rules/rpz` handler just calls
//! `render` and sets `Content-Type: text/plain`.

use chrono::Utc;

use crate::store::Rule;

/// Renders `rules` (already filtered to enabled-unless-`include_disabled` by
/// the caller) as an RPZ zone file. REGEX rules and rules with a malformed
/// (non-hostname-shaped) pattern are skipped — they have no CNAME owner
/// representation.
pub fn render(rules: &[Rule], zone: &str, sinkhole: &str) -> String {
    let serial = Utc::now().format("%Y%m%d%H").to_string();
    let mut out = String::new();
    out.push_str("$TTL 60\n");
    out.push_str(&format!(
        "@ IN SOA localhost. hostmaster.{} {} 60 60 60 60\n",
        zone, serial
    ));
    out.push_str("@ IN NS localhost.\n");

    for rule in rules {
        if rule.match_type == "REGEX" {
            continue;
        }
        if !is_rpz_hostname(&rule.pattern) {
            continue;
        }
        let target = match rule.action.as_str() {
            "BLOCK" => ".".to_string(),
            "WARN" => sinkhole.to_string(),
            _ => "rpz-passthru.".to_string(),
        };

        match rule.match_type.as_str() {
            "EXACT" => {
                out.push_str(&format!("{} CNAME {}\n", rule.pattern, target));
            }
            "SUFFIX" => {
                out.push_str(&format!("{} CNAME {}\n", rule.pattern, target));
                out.push_str(&format!("*.{} CNAME {}\n", rule.pattern, target));
            }
            _ => {}
        }
    }

    out
}

fn is_rpz_hostname(pattern: &str) -> bool {
    if pattern.is_empty() || pattern.len() > 255 {
        return false;
    }
    if pattern.contains(':') || pattern.contains('/') || pattern.contains('@') {
        return false;
    }
    pattern.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, match_type: &str, action: &str) -> Rule {
        Rule {
            id: 1,
            name: None,
            pattern: pattern.to_string(),
            match_type: match_type.to_string(),
            action: action.to_string(),
            enabled: true,
            priority: 10,
            notes: None,
            source: "admin".to_string(),
            expires_at: None,
            created_at: "now".to_string(),
            updated_at: "now".to_string(),
        }
    }

    #[test]
    fn renders_exact_suffix_and_skips_regex() {
        let rules = vec![
            rule("a.test", "EXACT", "BLOCK"),
            rule("bad.test", "SUFFIX", "WARN"),
            rule(".*", "REGEX", "BLOCK"),
        ];
        let zone = render(&rules, "zones.local", "sh.zdns.");

        assert!(zone.contains("a.test CNAME .\n"));
        assert!(zone.contains("bad.test CNAME sh.zdns.\n"));
        assert!(zone.contains("*.bad.test CNAME sh.zdns.\n"));
        assert!(!zone.contains(".* CNAME"));
    }

    #[test]
    fn allow_rule_maps_to_passthru() {
        let rules = vec![rule("ok.test", "EXACT", "ALLOW")];
        let zone = render(&rules, "zones.local", "sh.zdns.");
        assert!(zone.contains("ok.test CNAME rpz-passthru.\n"));
    }

    #[test]
    fn header_carries_zone_and_serial_format() {
        let zone = render(&[], "zones.local", "sh.zdns.");
        assert!(zone.starts_with("$TTL 60\n"));
        assert!(zone.contains("hostmaster.zones.local"));
    }
}
