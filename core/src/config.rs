//! Client options, loadable from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Connection and behaviour settings for a `Session`.
///
/// Every field has a default, so a config file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub host: String,
    pub use_tls: bool,
    /// Log request and response bodies at `info`.
    pub log_traffic: bool,
    /// When false, `Session::execute` hands back responses carrying an error
    /// code instead of failing.
    pub throw_on_error: bool,
    pub trace: bool,
    pub timeout_secs: u64,
    /// Requested ticket lifetime; the service default applies when unset.
    pub ticket_hours: Option<u32>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "www.quickbase.com".to_string(),
            use_tls: true,
            log_traffic: false,
            throw_on_error: true,
            trace: false,
            timeout_secs: 30,
            ticket_hours: None,
        }
    }
}

impl ClientOptions {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// `https://host` or `http://host`. A host that already carries a scheme
    /// is used as is.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            return host.to_string();
        }
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{host}")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.base_url(), "https://www.quickbase.com");
        assert!(options.throw_on_error);
        assert!(!options.log_traffic);
        assert_eq!(options.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let options = ClientOptions::from_json(r#"{"host": "127.0.0.1:3000", "use_tls": false}"#).unwrap();
        assert_eq!(options.base_url(), "http://127.0.0.1:3000");
        assert_eq!(options.timeout_secs, 30);
        assert_eq!(options.ticket_hours, None);
    }

    #[test]
    fn explicit_scheme_wins() {
        let options = ClientOptions {
            host: "http://localhost:8080/".to_string(),
            ..Default::default()
        };
        assert_eq!(options.base_url(), "http://localhost:8080");
    }

    #[test]
    fn bad_json_is_config_error() {
        assert!(matches!(ClientOptions::from_json("{host"), Err(Error::Config(_))));
        assert!(matches!(
            ClientOptions::load("/definitely/not/here.json"),
            Err(Error::Config(_))
        ));
    }
}
