//! Per-connection credentials and endpoint (`spec.md` §4.5/§6).
//!
//! The core only consumes this interface; loading it from a file or
//! environment is an out-of-scope collaborator. `StaticConfig` is a plain
//! in-memory implementation good enough for embedding and tests, in the
//! same spirit as the teacher's `Remote`/`NodeUrl` plain-data records.

pub trait Config: Send + Sync {
    /// `https://host:port`, already normalized. Implementations are not
    /// required to normalize it themselves — `Client::new` does that.
    fn address(&self) -> &str;
    fn insecure(&self) -> bool;

    fn username(&self) -> Option<&str> {
        None
    }
    fn password(&self) -> Option<&str> {
        None
    }
    fn realm(&self) -> Option<&str> {
        None
    }
    fn token_id(&self) -> Option<&str> {
        None
    }
    fn token_secret(&self) -> Option<&str> {
        None
    }

    /// Token mode is selected whenever both token fields are present;
    /// otherwise password mode is assumed.
    fn is_token_auth(&self) -> bool {
        self.token_id().is_some() && self.token_secret().is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    pub address: String,
    pub insecure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
}

impl StaticConfig {
    pub fn password_auth(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: Some(username.into()),
            password: Some(password.into()),
            realm: Some(realm.into()),
            ..Default::default()
        }
    }

    pub fn token_auth(
        address: impl Into<String>,
        username: impl Into<String>,
        realm: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: Some(username.into()),
            realm: Some(realm.into()),
            token_id: Some(token_id.into()),
            token_secret: Some(token_secret.into()),
            ..Default::default()
        }
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

impl Config for StaticConfig {
    fn address(&self) -> &str {
        &self.address
    }
    fn insecure(&self) -> bool {
        self.insecure
    }
    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
    fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
    fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }
    fn token_id(&self) -> Option<&str> {
        self.token_id.as_deref()
    }
    fn token_secret(&self) -> Option<&str> {
        self.token_secret.as_deref()
    }
}

/// Validates and normalizes `addr` per `spec.md` §4.5: non-empty, forced
/// `https://`, port required. Any scheme the caller supplies (`http://`,
/// `https://`, or none at all) is discarded in favor of `https` — PVE's API
/// is always TLS, so "forced" means coerced, not merely validated.
pub fn normalize_address(addr: &str) -> crate::error::Result<String> {
    use crate::error::Error;

    if addr.trim().is_empty() {
        return Err(Error::config("address must not be empty"));
    }
    let host_and_port = match addr.split_once("://") {
        Some((_, rest)) => rest,
        None => addr,
    };
    let with_scheme = format!("https://{host_and_port}");
    let url = url::Url::parse(&with_scheme)
        .map_err(|e| Error::config(format!("invalid address {addr:?}: {e}")))?;
    if url.port().is_none() {
        return Err(Error::config(format!("address {addr:?} is missing a port")));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("address {addr:?} is missing a host")))?;
    Ok(format!("https://{}:{}", host, url.port().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_host_port() {
        assert_eq!(
            normalize_address("10.0.0.1:8006").unwrap(),
            "https://10.0.0.1:8006"
        );
    }

    #[test]
    fn rejects_empty_address() {
        assert!(normalize_address("").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(normalize_address("https://pve.example.com").is_err());
    }

    #[test]
    fn coerces_explicit_http_scheme_to_https() {
        assert_eq!(
            normalize_address("http://10.0.0.1:8006").unwrap(),
            "https://10.0.0.1:8006"
        );
    }

    #[test]
    fn token_auth_detected_when_both_fields_present() {
        let cfg = StaticConfig::token_auth("pve:8006", "root", "pam", "tui", "secret");
        assert!(cfg.is_token_auth());
    }

    #[test]
    fn password_auth_when_token_fields_absent() {
        let cfg = StaticConfig::password_auth("pve:8006", "root", "hunter2", "pam");
        assert!(!cfg.is_token_auth());
    }
}
