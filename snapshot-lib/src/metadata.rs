//! Off-chain account metadata, published by accounts as a JSON document at the
//! URL they register on chain.

use alloy_primitives::Address;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid metadata url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("metadata request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(default)]
    claims: Vec<Claim>,
}

#[derive(Deserialize)]
struct Claim {
    #[serde(rename = "type")]
    kind: String,
    domain: Option<String>,
}

pub struct MetadataFetcher {
    http: Client,
}

impl MetadataFetcher {
    pub fn new(timeout: Duration) -> Result<Self, MetadataError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
        })
    }

    /// Returns the first `DOMAIN` claim of the document at `url`, or an empty
    /// string when the document makes no such claim.
    pub async fn fetch_domain(&self, url: &str) -> Result<String, MetadataError> {
        let metadata: Metadata = self
            .http
            .get(normalize_url(url)?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(metadata
            .claims
            .into_iter()
            .filter(|claim| claim.kind == "DOMAIN")
            .find_map(|claim| claim.domain)
            .unwrap_or_default())
    }

    /// Metadata is best effort: an unset URL, an unreachable host or a
    /// malformed document all yield an empty domain.
    pub async fn domain_or_default(&self, account: Address, url: &str) -> String {
        if url.trim().is_empty() {
            return String::new();
        }
        match self.fetch_domain(url).await {
            Ok(domain) => domain,
            Err(error) => {
                warn!(%account, url, %error, "could not read account metadata");
                String::new()
            }
        }
    }
}

/// Accounts often register bare host names; those are assumed to be https.
fn normalize_url(url: &str) -> Result<Url, MetadataError> {
    let url = url.trim();
    let lowercase = url.to_ascii_lowercase();
    let candidate = if lowercase.starts_with("http://") || lowercase.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    Url::parse(&candidate).map_err(|source| MetadataError::InvalidUrl {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn fetcher() -> MetadataFetcher {
        MetadataFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn bare_hosts_default_to_https() {
        assert_eq!(
            normalize_url("example.org/metadata.json").unwrap().as_str(),
            "https://example.org/metadata.json"
        );
        assert_eq!(
            normalize_url("HTTP://example.org/m.json").unwrap().scheme(),
            "http"
        );
        assert!(normalize_url("https://").is_err());
    }

    #[tokio::test]
    async fn reads_the_domain_claim() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/metadata.json");
                then.status(200).json_body(json!({
                    "meta": { "address": "0x01" },
                    "claims": [
                        { "type": "NAME", "name": "validators inc" },
                        { "type": "DOMAIN", "domain": "validators.example" },
                    ],
                }));
            })
            .await;

        let domain = fetcher()
            .fetch_domain(&server.url("/metadata.json"))
            .await
            .unwrap();
        assert_eq!(domain, "validators.example");
    }

    #[tokio::test]
    async fn failures_fall_back_to_an_empty_domain() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing.json");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/garbage.json");
                then.status(200).body("not json");
            })
            .await;

        let fetcher = fetcher();
        let account = Address::with_last_byte(7);
        for path in ["/missing.json", "/garbage.json"] {
            assert_eq!(
                fetcher.domain_or_default(account, &server.url(path)).await,
                ""
            );
        }
        assert_eq!(fetcher.domain_or_default(account, "").await, "");
    }
}
