use crate::{env_or_default, ConfigError, FromEnv};
use std::str::FromStr;
use strum::{Display, EnumString};

/// TLS protocol names accepted in `AMQP_SSL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum TlsProtocol {
    None,
    Ssl2,
    Ssl3,
    Tls,
    Tls11,
    Tls12,
    Tls13,
    Default,
}

/// Broker connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub tls_protocols: Vec<TlsProtocol>,
    /// Prefetch applied to consumers that don't set their own
    pub default_prefetch: Option<u16>,
}

impl AmqpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_default_prefetch(mut self, prefetch: u16) -> Self {
        self.default_prefetch = (prefetch > 0).then_some(prefetch);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_protocols.iter().any(|p| *p != TlsProtocol::None)
    }

    /// Connection URI, `amqp[s]://[user[:pass]@]host:port/<vhost>`
    pub fn uri(&self) -> String {
        self.build_uri(&self.password)
    }

    /// Same as [`uri`](Self::uri) with the password masked
    pub fn redacted_uri(&self) -> String {
        if self.password.is_empty() {
            self.uri()
        } else {
            self.build_uri("****")
        }
    }

    fn build_uri(&self, password: &str) -> String {
        let scheme = if self.tls_enabled() { "amqps" } else { "amqp" };
        let credentials = match (self.user.is_empty(), password.is_empty()) {
            (true, _) => String::new(),
            (false, true) => format!("{}@", urlencoding::encode(&self.user)),
            (false, false) => format!(
                "{}:{}@",
                urlencoding::encode(&self.user),
                urlencoding::encode(password)
            ),
        };

        format!(
            "{}://{}{}:{}/{}",
            scheme,
            credentials,
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

/// Split a protocol list on `,` `;` `|`, dropping unknown names.
pub fn parse_tls_protocols(raw: &str) -> Vec<TlsProtocol> {
    raw.split([',', ';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| TlsProtocol::from_str(s).ok())
        .collect()
}

impl FromEnv for AmqpConfig {
    /// Reads from environment variables with defaults:
    /// - AMQP_HOST: localhost
    /// - AMQP_PORT: 5672
    /// - AMQP_VHOST: /
    /// - AMQP_USER / AMQP_PASS: empty
    /// - AMQP_SSL: empty (plain AMQP)
    /// - AMQP_DBC: 0 (no default prefetch)
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("AMQP_HOST", "localhost");
        let port = env_or_default("AMQP_PORT", "5672")
            .parse()
            .map_err(|e| ConfigError::ParseError {
                key: "AMQP_PORT".to_string(),
                details: format!("{}", e),
            })?;
        let vhost = env_or_default("AMQP_VHOST", "/");
        let user = env_or_default("AMQP_USER", "");
        let password = env_or_default("AMQP_PASS", "");
        let tls_protocols = parse_tls_protocols(&env_or_default("AMQP_SSL", ""));

        // unparsable counts as unset
        let default_prefetch = env_or_default("AMQP_DBC", "0")
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|n| *n > 0);

        Ok(Self {
            host,
            port,
            vhost,
            user,
            password,
            tls_protocols,
            default_prefetch,
        })
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            user: String::new(),
            password: String::new(),
            tls_protocols: Vec::new(),
            default_prefetch: None,
        }
    }
}
