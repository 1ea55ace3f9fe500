//! Remote TAXII 2.1 client (C4, pull half). Shaped like the teacher's
//! `virustotal::get_cached_or_fetch`: build a `reqwest::Client`, hit an
//! external API with a bounded timeout, and hand back parsed JSON or a typed
//! error the caller can fall back on.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::error::{ZdnsError, ZdnsResult};

const TAXII_ACCEPT: &str = "application/taxii+json;version=2.1";

pub struct TaxiiClient {
    http: Client,
}

#[derive(Debug, Deserialize)]
struct Discovery {
    api_roots: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectsResponse {
    #[serde(default)]
    objects: Vec<serde_json::Value>,
}

impl TaxiiClient {
    pub fn new() -> Self {
        TaxiiClient { http: Client::new() }
    }

    /// Pulls objects from a remote TAXII root. If `api_root` is absent, GETs
    /// `discovery_url` first and resolves `api_roots[0]` against it (the
    /// discovery document may list relative paths).
    pub async fn pull(
        &self,
        discovery_url: &str,
        api_root: Option<&str>,
        collection_id: &str,
        added_after: Option<&str>,
    ) -> ZdnsResult<Vec<serde_json::Value>> {
        let root = match api_root {
            Some(r) => r.to_string(),
            None => self.discover_root(discovery_url).await?,
        };

        let url = format!("{}/collections/{}/objects/", root.trim_end_matches('/'), collection_id);
        let mut req = self
            .http
            .get(&url)
            .header("Accept", TAXII_ACCEPT)
            .timeout(Duration::from_secs(20));
        if let Some(after) = added_after {
            req = req.query(&[("added_after", after)]);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ZdnsError::ExternalMalformed(format!(
                "taxii objects fetch returned {}",
                resp.status()
            )));
        }
        let parsed: ObjectsResponse = resp
            .json()
            .await
            .map_err(|e| ZdnsError::ExternalMalformed(format!("invalid taxii objects response: {e}")))?;
        Ok(parsed.objects)
    }

    async fn discover_root(&self, discovery_url: &str) -> ZdnsResult<String> {
        let resp = self
            .http
            .get(discovery_url)
            .header("Accept", TAXII_ACCEPT)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ZdnsError::ExternalMalformed(format!(
                "taxii discovery returned {}",
                resp.status()
            )));
        }
        let discovery: Discovery = resp
            .json()
            .await
            .map_err(|e| ZdnsError::ExternalMalformed(format!("invalid taxii discovery response: {e}")))?;
        let first = discovery
            .api_roots
            .first()
            .ok_or_else(|| ZdnsError::ExternalMalformed("taxii discovery listed no api_roots".into()))?;
        resolve_relative(discovery_url, first)
    }
}

impl Default for TaxiiClient {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_relative(base: &str, candidate: &str) -> ZdnsResult<String> {
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return Ok(candidate.to_string());
    }
    let base_url = reqwest::Url::parse(base)
        .map_err(|e| ZdnsError::ExternalMalformed(format!("invalid discovery url: {e}")))?;
    let joined = base_url
        .join(candidate)
        .map_err(|e| ZdnsError::ExternalMalformed(format!("cannot resolve api_root against discovery url: {e}")))?;
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_api_root_passes_through() {
        let resolved = resolve_relative("https://intel.example/taxii2", "https://other.example/root").unwrap();
        assert_eq!(resolved, "https://other.example/root");
    }

    #[test]
    fn relative_api_root_resolves_against_discovery_base() {
        let resolved = resolve_relative("https://intel.example/taxii2", "api1").unwrap();
        assert_eq!(resolved, "https://intel.example/api1");
    }
}
