//! HTTP client for the Conveyor API.

use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder, Response};
use url::Url;

/// Header carrying the config version for optimistic concurrency.
pub const CONFIG_ID_HEADER: &str = "X-Conveyor-Config-ID";

pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let mut base =
            Url::parse(api_url).with_context(|| format!("invalid API URL: {}", api_url))?;
        // Keep any path prefix when joining relative paths onto it.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
        })
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid API path: {}", path))
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let mut request = self.http.request(method, self.url(path)?);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// Send a request, turning non-2xx responses into errors carrying the
    /// server's message.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.context("request to API failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("API returned {}: {}", status, body.trim());
        }
        Ok(response)
    }
}

/// API path of a pipeline's config; the default pipeline when unnamed.
pub fn config_path(pipeline: Option<&str>) -> String {
    match pipeline {
        Some(pipeline) => format!("api/v1/pipelines/{}/config", pipeline),
        None => "api/v1/config".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_keeps_prefix() {
        let client = ApiClient::new("http://ci.example.com/conveyor", None).unwrap();
        assert_eq!(
            client.url("/api/v1/config").unwrap().as_str(),
            "http://ci.example.com/conveyor/api/v1/config"
        );
    }

    #[test]
    fn test_config_path() {
        assert_eq!(config_path(None), "api/v1/config");
        assert_eq!(config_path(Some("release")), "api/v1/pipelines/release/config");
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(ApiClient::new("not a url", None).is_err());
    }
}
