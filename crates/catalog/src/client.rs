//! Type catalog HTTP client.
//!
//! Blocking reqwest client (no Tokio runtime required). One `GET` per run;
//! the resolver calls it from its lookup thread and stops waiting after its
//! own timeout, while the client enforces the same limit per request.

use std::time::Duration;

use crossdetect_recon::config::AuthoritativeConfig;
use crossdetect_recon::resolver::{AuthoritativeSource, LookupError};
use serde::Deserialize;
use url::Url;

/// Catalog client (blocking).
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::blocking::Client,
    endpoint: Url,
    token: Option<String>,
}

/// Error type for catalog lookups.
#[derive(Debug)]
pub enum CatalogError {
    /// Endpoint is not an absolute http(s) URL
    InvalidEndpoint(String),
    /// HTTP client could not be constructed
    Client(String),
    /// Network error
    Network(String),
    /// Request exceeded the configured timeout
    Timeout(String),
    /// HTTP error with status code
    Http(u16, String),
    /// Response body is not a recognisable catalog
    Parse(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::InvalidEndpoint(msg) => write!(f, "Invalid catalog endpoint: {}", msg),
            CatalogError::Client(msg) => write!(f, "HTTP client error: {}", msg),
            CatalogError::Network(msg) => write!(f, "Network error: {}", msg),
            CatalogError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CatalogError::Http(code, msg) => write!(f, "HTTP {}: {}", code, msg),
            CatalogError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for CatalogError {}

/// One `id -> name` entry as served by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,
    #[serde(alias = "Name")]
    pub name: String,
}

impl CatalogClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| CatalogError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(CatalogError::InvalidEndpoint(format!(
                "{endpoint}: scheme must be http or https"
            )));
        }

        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("crossdetect/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Client(e.to_string()))?;

        Ok(Self {
            http,
            endpoint,
            token: None,
        })
    }

    /// Build from `[types.authoritative]`. A `token_env` that is unset is
    /// logged and the request goes out unauthenticated.
    pub fn from_config(config: &AuthoritativeConfig) -> Result<Self, CatalogError> {
        let client = Self::new(&config.endpoint, Duration::from_millis(config.timeout_ms))?;
        match config.token_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(client.with_token(token.trim())),
                _ => {
                    tracing::warn!("{var} is not set; querying the type catalog without a token");
                    Ok(client)
                }
            },
            None => Ok(client),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Fetch every catalog entry.
    pub fn fetch(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut request = self
            .http
            .get(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                CatalogError::Timeout(e.to_string())
            } else {
                CatalogError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CatalogError::Http(status, body));
        }

        let body: serde_json::Value = response.json().map_err(|e| {
            if e.is_timeout() {
                CatalogError::Timeout(e.to_string())
            } else {
                CatalogError::Parse(e.to_string())
            }
        })?;
        parse_catalog(&body)
    }
}

/// Accepts a bare array of entries or an object wrapping them in `value`.
/// Entries missing an id or name are skipped.
pub fn parse_catalog(body: &serde_json::Value) -> Result<Vec<CatalogEntry>, CatalogError> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(obj) => obj
            .get("value")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CatalogError::Parse("expected a 'value' array".into()))?,
        _ => return Err(CatalogError::Parse("expected a JSON array or object".into())),
    };

    let entries: Vec<CatalogEntry> = items
        .iter()
        .filter_map(|item| serde_json::from_value::<CatalogEntry>(item.clone()).ok())
        .filter(|e| !e.id.trim().is_empty() && !e.name.trim().is_empty())
        .collect();

    if entries.len() < items.len() {
        tracing::debug!(
            skipped = items.len() - entries.len(),
            "catalog entries without id or name"
        );
    }
    Ok(entries)
}

impl AuthoritativeSource for CatalogClient {
    fn describe(&self) -> String {
        format!("type catalog {}", self.endpoint)
    }

    fn fetch_mappings(&self) -> Result<Vec<(String, String)>, LookupError> {
        let entries = self.fetch()?;
        Ok(entries.into_iter().map(|e| (e.id, e.name)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossdetect_recon::resolver::TypeResolver;
    use httpmock::prelude::*;

    const SSN_GUID: &str = "a44669fe-0d48-453d-a9b1-2cc83f2cba77";

    fn client(server: &MockServer, timeout_ms: u64) -> CatalogClient {
        CatalogClient::new(&server.url("/sits"), Duration::from_millis(timeout_ms)).unwrap()
    }

    #[test]
    fn parses_bare_array() {
        let body = serde_json::json!([
            { "id": SSN_GUID, "name": "U.S. Social Security Number (SSN)" },
            { "id": "x" },
        ]);
        let entries = parse_catalog(&body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, SSN_GUID);
    }

    #[test]
    fn parses_wrapped_value_with_pascal_case() {
        let body = serde_json::json!({
            "value": [{ "Id": SSN_GUID, "Name": "U.S. Social Security Number (SSN)" }]
        });
        let entries = parse_catalog(&body).unwrap();
        assert_eq!(entries[0].name, "U.S. Social Security Number (SSN)");
        assert!(parse_catalog(&serde_json::json!({ "items": [] })).is_err());
        assert!(parse_catalog(&serde_json::json!("nope")).is_err());
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let err = CatalogClient::new("file:///etc/sits.json", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::InvalidEndpoint(_)));
        assert!(CatalogClient::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn fetch_sends_bearer_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/sits")
                .header("authorization", "Bearer secret");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "value": [{ "Id": SSN_GUID, "Name": "U.S. Social Security Number (SSN)" }]
                }));
        });

        let entries = client(&server, 2_000).with_token("secret").fetch().unwrap();
        mock.assert();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn http_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/sits");
            then.status(503).body("maintenance");
        });

        let err = client(&server, 2_000).fetch().unwrap_err();
        match err {
            CatalogError::Http(code, body) => {
                assert_eq!(code, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slow_catalog_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/sits");
            then.status(200)
                .delay(Duration::from_millis(1_500))
                .json_body(serde_json::json!([]));
        });

        let err = client(&server, 100).fetch().unwrap_err();
        assert!(matches!(err, CatalogError::Timeout(_)), "got {err}");
    }

    #[test]
    fn merges_into_resolver() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/sits");
            then.status(200).json_body(serde_json::json!([
                { "id": SSN_GUID, "name": "U.S. Social Security Number (SSN)" }
            ]));
        });

        let mut resolver = TypeResolver::new();
        let stored = resolver
            .merge_authoritative(Box::new(client(&server, 2_000)), Duration::from_secs(5))
            .unwrap();
        assert_eq!(stored, 1);
        assert_eq!(
            resolver.resolve(&SSN_GUID.to_uppercase()).name,
            "U.S. Social Security Number (SSN)"
        );
    }

    #[test]
    fn from_config_without_token_env() {
        let config = AuthoritativeConfig {
            endpoint: "https://catalog.example.com/sits".into(),
            timeout_ms: 3_000,
            token_env: Some("CROSSDETECT_TEST_TOKEN_THAT_IS_NEVER_SET".into()),
        };
        let client = CatalogClient::from_config(&config).unwrap();
        assert!(client.token.is_none());
        assert_eq!(client.endpoint(), "https://catalog.example.com/sits");
    }
}
