use std::{env, path::PathBuf};

use email_address::EmailAddress;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("mailbox address {0:?} is not a valid email address")]
    InvalidMailboxAddress(String),
    #[error("no mailboxes configured")]
    NoMailboxes,
    #[error("at least one of smtp_port, smtps_port, pop3_port, pop3s_port must be set")]
    NoListeners,
    #[error("smtps_port/pop3s_port is set but no [tls] section is configured")]
    MissingTlsForImplicitPort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpsProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_attachment_limit_mb() -> u64 {
    80
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client_id: String,
    pub tenant_id: String,
    pub mailboxes: Vec<MailboxConfig>,
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub smtp_port: Option<u16>,
    pub pop3_port: Option<u16>,
    pub smtps_port: Option<u16>,
    pub pop3s_port: Option<u16>,
    pub tls: Option<TlsConfig>,
    pub token_path: PathBuf,
    pub queue_dir: PathBuf,
    #[serde(default = "default_attachment_limit_mb")]
    pub attachment_limit_mb: u64,
    pub https_proxy: Option<HttpsProxyConfig>,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mailboxes.is_empty() {
            return Err(ConfigError::NoMailboxes);
        }

        for mailbox in &self.mailboxes {
            mailbox
                .username
                .parse::<EmailAddress>()
                .map_err(|_| ConfigError::InvalidMailboxAddress(mailbox.username.clone()))?;
        }

        if self
            .allowed_domains
            .iter()
            .any(|domain| domain == "*")
        {
            warn!("allowed_domains contains \"*\": relaying is permitted to any domain");
        }

        if self.smtp_port.is_none()
            && self.pop3_port.is_none()
            && self.smtps_port.is_none()
            && self.pop3s_port.is_none()
        {
            return Err(ConfigError::NoListeners);
        }

        if (self.smtps_port.is_some() || self.pop3s_port.is_some()) && self.tls.is_none() {
            return Err(ConfigError::MissingTlsForImplicitPort);
        }

        Ok(())
    }

    /// Resolves the forward proxy URL honoring the documented precedence:
    /// configured `https_proxy` block, then `HTTPS_PROXY`/`https_proxy`, then
    /// `HTTP_PROXY`/`http_proxy`.
    pub fn effective_https_proxy(&self) -> Option<String> {
        if let Some(proxy) = &self.https_proxy {
            return Some(proxy.url.clone());
        }

        env::var("HTTPS_PROXY")
            .or_else(|_| env::var("https_proxy"))
            .or_else(|_| env::var("HTTP_PROXY"))
            .or_else(|_| env::var("http_proxy"))
            .ok()
    }

    pub fn allows_domain(&self, domain: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(domain))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_json() -> serde_json::Value {
        serde_json::json!({
            "client_id": "00000000-0000-0000-0000-000000000000",
            "tenant_id": "tenant",
            "mailboxes": [{"username": "a@x.test", "password": "hash"}],
            "allowed_domains": ["y.test"],
            "smtp_port": 2525,
            "token_path": "/tmp/token.bin",
            "queue_dir": "/tmp/queue",
        })
    }

    #[test]
    fn rejects_invalid_mailbox_address() {
        let mut json = base_json();
        json["mailboxes"] = serde_json::json!([{"username": "not-an-email", "password": "x"}]);
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMailboxAddress(_))
        ));
    }

    #[test]
    fn rejects_no_listeners() {
        let mut json = base_json();
        json.as_object_mut().unwrap().remove("smtp_port");
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoListeners)));
    }

    #[test]
    fn requires_tls_for_implicit_port() {
        let mut json = base_json();
        json["smtps_port"] = serde_json::json!(465);
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTlsForImplicitPort)
        ));
    }

    #[test]
    fn wildcard_allows_any_domain() {
        let mut json = base_json();
        json["allowed_domains"] = serde_json::json!(["*"]);
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(config.allows_domain("anything.example"));
    }

    #[test]
    fn allowed_domains_is_case_insensitive() {
        let config: Config = serde_json::from_value(base_json()).unwrap();
        assert!(config.allows_domain("Y.TEST"));
        assert!(!config.allows_domain("z.test"));
    }
}
