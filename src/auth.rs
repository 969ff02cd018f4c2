//! Ticket/CSRF lifecycle for password auth, stateless bearer mode for API
//! tokens (`spec.md` §4.3).
//!
//! Mirrors the double-checked-locking shape the teacher uses around its own
//! connection cache (`connection::connect_or_login`): a read-lock fast path
//! for the common case, falling back to a write lock that re-checks
//! validity before doing the actual network round trip, so concurrent
//! callers either see the cached ticket or await the single in-flight
//! refresh instead of each re-authenticating.

use std::sync::Arc;

use tokio::sync::RwLock;
use url::Url;

use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::model::AuthToken;

enum AuthMode {
    Password {
        username: String,
        password: String,
        realm: String,
    },
    /// `header_value` is the full `PVEAPIToken=USER@REALM!TOKENID=SECRET`
    /// string, precomputed once at construction.
    Token { header_value: String, username: String },
}

pub struct AuthManager {
    mode: AuthMode,
    base_url: Url,
    http: reqwest::Client,
    token: RwLock<Option<AuthToken>>,
    logger: Arc<dyn Logger>,
}

impl AuthManager {
    pub fn password(
        base_url: Url,
        http: reqwest::Client,
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        AuthManager {
            mode: AuthMode::Password {
                username: username.into(),
                password: password.into(),
                realm: realm.into(),
            },
            base_url,
            http,
            token: RwLock::new(None),
            logger,
        }
    }

    pub fn token(
        base_url: Url,
        http: reqwest::Client,
        username: impl Into<String>,
        realm: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let username = username.into();
        let realm = realm.into();
        let header_value = format!(
            "PVEAPIToken={}@{}!{}={}",
            username,
            realm,
            token_id.into(),
            token_secret.into()
        );
        AuthManager {
            mode: AuthMode::Token {
                header_value,
                username: format!("{username}@{realm}"),
            },
            base_url,
            http,
            token: RwLock::new(None),
            logger,
        }
    }

    pub fn is_token_mode(&self) -> bool {
        matches!(self.mode, AuthMode::Token { .. })
    }

    /// Returns a currently-valid token, authenticating (or minting the
    /// synthetic token-mode record) only when necessary.
    pub async fn get_valid_token(&self) -> Result<AuthToken> {
        if let AuthMode::Token { header_value, username } = &self.mode {
            return Ok(AuthToken::synthetic(header_value.clone(), username.clone()));
        }

        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.is_valid() {
                    return Ok(token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if token.is_valid() {
                return Ok(token.clone());
            }
        }

        let fresh = self.authenticate().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Alias kept for callers that want to force a round trip before
    /// issuing the first real request (`spec.md` §4.3/§4.5 "initialization
    /// must verify connectivity by authenticating").
    pub async fn ensure_authenticated(&self) -> Result<()> {
        self.get_valid_token().await.map(|_| ())
    }

    /// Drops the cached ticket; the next call to `get_valid_token`
    /// re-authenticates. No-op in token mode.
    pub async fn clear_token(&self) {
        if self.is_token_mode() {
            return;
        }
        *self.token.write().await = None;
        log::debug!("auth ticket cleared, next request will re-authenticate");
        self.logger.debug("auth ticket cleared, next request will re-authenticate");
    }

    async fn authenticate(&self) -> Result<AuthToken> {
        let AuthMode::Password { username, password, realm } = &self.mode else {
            unreachable!("token mode never reaches authenticate");
        };

        let url = self
            .base_url
            .join("/api2/json/access/ticket")
            .map_err(|e| Error::config(e.to_string()))?;

        log::debug!("authenticating {username}@{realm} against {url}");
        self.logger.debug(&format!("authenticating {username}@{realm} against {url}"));

        let response = self
            .http
            .post(url)
            .form(&[
                ("username", format!("{username}@{realm}")),
                ("password", password.clone()),
            ])
            .send()
            .await
            .map_err(|e| Error::transport(e))?;

        let status = response.status();
        if !status.is_success() {
            log::error!("authentication failed with status {status}");
            self.logger.error(&format!("authentication failed with status {status}"));
            return Err(Error::authentication(format!(
                "authentication failed with status {}",
                status.as_u16()
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| Error::transport(e))?;
        let data = body.get("data").ok_or_else(|| Error::data_shape("access/ticket"))?;

        let ticket = data
            .get("ticket")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::authentication("no ticket received"))?;
        let csrf_token = data
            .get("CSRFPreventionToken")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let returned_username = data
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or(username);

        Ok(AuthToken::password(
            ticket.to_string(),
            csrf_token.to_string(),
            returned_username.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn logger() -> Arc<dyn Logger> {
        crate::logger::default_logger()
    }

    #[tokio::test]
    async fn password_mode_authenticates_and_caches_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "ticket": "PVE:ticket",
                    "CSRFPreventionToken": "csrf",
                    "username": "root@pam",
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = AuthManager::password(
            Url::parse(&server.uri()).unwrap(),
            reqwest::Client::new(),
            "root",
            "hunter2",
            "pam",
            logger(),
        );

        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token.ticket, "PVE:ticket");
        assert_eq!(token.csrf_token, "csrf");

        // Second call must hit the cache, not the mock (expect(1) enforces this).
        let token2 = manager.get_valid_token().await.unwrap();
        assert_eq!(token2.ticket, token.ticket);
    }

    #[tokio::test]
    async fn non_200_surfaces_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let manager = AuthManager::password(
            Url::parse(&server.uri()).unwrap(),
            reqwest::Client::new(),
            "root",
            "wrong",
            "pam",
            logger(),
        );

        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn clear_token_forces_reauthentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "ticket": "t1", "CSRFPreventionToken": "c1", "username": "root@pam" }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let manager = AuthManager::password(
            Url::parse(&server.uri()).unwrap(),
            reqwest::Client::new(),
            "root",
            "hunter2",
            "pam",
            logger(),
        );

        manager.get_valid_token().await.unwrap();
        manager.clear_token().await;
        manager.get_valid_token().await.unwrap();
    }

    #[tokio::test]
    async fn token_mode_never_calls_the_network() {
        let manager = AuthManager::token(
            Url::parse("https://pve.example.com:8006").unwrap(),
            reqwest::Client::new(),
            "root",
            "pam",
            "tui",
            "secret",
            logger(),
        );
        let token = manager.get_valid_token().await.unwrap();
        assert!(token.ticket.starts_with("PVEAPIToken="));
        assert!(token.is_valid());
    }
}
