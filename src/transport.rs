//! Authenticated, retrying JSON transport (`spec.md` §4.4).
//!
//! Plays the role the teacher's `connection.rs`/`try_request!` macro plays
//! for `MultiClient`: attach credentials, execute, classify failures, and
//! — for `get_with_retry` — retry transient ones with exponential backoff
//! while honoring cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::logger::Logger;

const USER_AGENT: &str = "proxmox-tui";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Post,
    Put,
    Delete,
}

pub struct HttpClient {
    base_url: Url,
    http: reqwest::Client,
    auth: Arc<AuthManager>,
    logger: Arc<dyn Logger>,
}

impl HttpClient {
    pub fn new(base_url: Url, http: reqwest::Client, auth: Arc<AuthManager>, logger: Arc<dyn Logger>) -> Self {
        HttpClient { base_url, http, auth, logger }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::Get, path, None::<&()>).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(Method::Post, path, Some(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.request(Method::Put, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::Delete, path, None::<&()>).await
    }

    /// Retries transient failures (connection errors, timeouts, 5xx) with
    /// backoff `attempt * 500ms`; 4xx and data-shape errors are not
    /// retried (`spec.md` §4.4/§7).
    pub async fn get_with_retry<T: DeserializeOwned>(&self, path: &str, max_retries: u32) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get(path).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_retries && err.is_transient() => {
                    let backoff = Duration::from_millis(500 * attempt as u64);
                    log::debug!(
                        "transient error on {path} (attempt {attempt}/{max_retries}): {err}; retrying in {backoff:?}"
                    );
                    self.logger.debug(&format!(
                        "transient error on {path} (attempt {attempt}/{max_retries}): {err}; retrying in {backoff:?}"
                    ));
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request<B: Serialize, T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T> {
        let value = self.request_raw(method, path, body).await?;
        serde_json::from_value(value).map_err(Error::from)
    }

    /// Executes one request and returns the parsed `data` envelope as a
    /// generic `Value`; used internally and by callers that want to defer
    /// typed deserialization (e.g. the enrichment pipeline inspecting
    /// config strings).
    pub(crate) async fn request_raw<B: Serialize>(&self, method: Method, path: &str, body: Option<&B>) -> Result<serde_json::Value> {
        let token = self.auth.get_valid_token().await?;
        let url = self
            .base_url
            .join(&format!("/api2/json{path}"))
            .map_err(|e| Error::config(e.to_string()))?;

        let reqwest_method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .http
            .request(reqwest_method, url.clone())
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json");

        if self.auth.is_token_mode() {
            builder = builder.header("Authorization", &token.ticket);
        } else {
            builder = builder.header("Cookie", format!("PVEAuthCookie={}", token.ticket));
            if method != Method::Get && !token.csrf_token.is_empty() {
                builder = builder.header("CSRFPreventionToken", &token.csrf_token);
            }
        }

        if let Some(body) = body {
            builder = builder.json(body);
        }

        log::debug!("{method:?} {url}");
        self.logger.debug(&format!("{method:?} {url}"));

        let response = builder.send().await.map_err(|e| Error::transport(e))?;
        let status = response.status();

        if status.as_u16() == 401 {
            if self.auth.is_token_mode() {
                return Err(Error::authentication("token rejected with 401"));
            }
            self.auth.clear_token().await;
            return Err(Error::authentication("authentication failed"));
        }

        let body_text = response.text().await.map_err(|e| Error::transport(e))?;

        if !status.is_success() {
            return Err(Error::Api { status: status.as_u16(), body: body_text });
        }

        let envelope: serde_json::Value = serde_json::from_str(&body_text)?;
        Ok(envelope.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::default_logger;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token_auth(base: &str) -> Arc<AuthManager> {
        Arc::new(AuthManager::token(
            Url::parse(base).unwrap(),
            reqwest::Client::new(),
            "root",
            "pam",
            "tui",
            "secret",
            default_logger(),
        ))
    }

    #[tokio::test]
    async fn get_parses_data_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .and(header("Authorization", "PVEAPIToken=root@pam!tui=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "version": "8.1" }
            })))
            .mount(&server)
            .await;

        let auth = token_auth(&server.uri());
        let http = HttpClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new(), auth, default_logger());

        #[derive(serde::Deserialize)]
        struct Version {
            version: String,
        }
        let version: Version = http.get("/version").await.unwrap();
        assert_eq!(version.version, "8.1");
    }

    #[tokio::test]
    async fn non_2xx_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Permission denied"))
            .mount(&server)
            .await;

        let auth = token_auth(&server.uri());
        let http = HttpClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new(), auth, default_logger());
        let err = http.get::<serde_json::Value>("/nodes").await.unwrap_err();
        match err {
            Error::Api { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "Permission denied");
            }
            other => panic!("expected Error::Api, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries_on_persistent_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let auth = token_auth(&server.uri());
        let http = HttpClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new(), auth, default_logger());
        let err = http.get_with_retry::<serde_json::Value>("/nodes", 3).await.unwrap_err();
        assert!(matches!(err, Error::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn retry_does_not_retry_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let auth = token_auth(&server.uri());
        let http = HttpClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new(), auth, default_logger());
        let _ = http.get_with_retry::<serde_json::Value>("/nodes", 5).await;
    }
}
