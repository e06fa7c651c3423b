use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Wire transport selected by the broker URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerScheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl BrokerScheme {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Self::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Tcp => 1883,
            Self::Tls => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "mqtt",
            Self::Tls => "mqtts",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Broker URL is empty")]
    Empty,

    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Broker URL has no host: {0}")]
    MissingHost(String),

    #[error("Invalid broker port: {0}")]
    InvalidPort(String),
}

/// Parsed broker address, e.g. `wss://broker.example:8884/mqtt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BrokerEndpoint {
    /// URLs without a scheme are treated as plain TCP (`host[:port]`).
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(EndpointError::Empty);
        }

        let (scheme, rest) = match url.split_once("://") {
            Some((prefix, rest)) => (
                BrokerScheme::from_prefix(prefix)
                    .ok_or_else(|| EndpointError::UnsupportedScheme(prefix.to_string()))?,
                rest,
            ),
            None => (BrokerScheme::Tcp, url),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(EndpointError::MissingHost(url.to_string()));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Address handed to rumqttc. Websocket transports take the full URL,
    /// socket transports only the host.
    pub fn broker_addr(&self) -> String {
        if self.scheme.is_websocket() {
            self.to_string()
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.path
        )
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_empty() {
                    &"<not set>"
                } else {
                    &"<redacted>"
                },
            )
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub endpoint: BrokerEndpoint,
    pub credentials: Option<BrokerCredentials>,
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub channel_capacity: usize,
}

impl MqttConfig {
    /// Every session gets its own client id so two sessions never share a
    /// broker-side connection.
    pub fn client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.client_id_prefix, &suffix[..8])
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.client_id(),
            self.endpoint.broker_addr(),
            self.endpoint.port,
        );
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);

        if let Some(credentials) = &self.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        match self.endpoint.scheme {
            BrokerScheme::Tcp => {}
            BrokerScheme::Tls => {
                options.set_transport(Transport::tls_with_default_config());
            }
            BrokerScheme::Ws => {
                options.set_transport(Transport::Ws);
            }
            BrokerScheme::Wss => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_secure_websocket_url_with_path() {
        let endpoint = BrokerEndpoint::parse("wss://broker.example.cloud:8884/mqtt").unwrap();
        assert_eq!(endpoint.scheme, BrokerScheme::Wss);
        assert_eq!(endpoint.host, "broker.example.cloud");
        assert_eq!(endpoint.port, 8884);
        assert_eq!(endpoint.path, "/mqtt");
        assert_eq!(
            endpoint.broker_addr(),
            "wss://broker.example.cloud:8884/mqtt"
        );
    }

    #[test]
    fn bare_host_defaults_to_tcp() {
        let endpoint = BrokerEndpoint::parse("localhost").unwrap();
        assert_eq!(endpoint.scheme, BrokerScheme::Tcp);
        assert_eq!(endpoint.port, 1883);
        assert_eq!(endpoint.broker_addr(), "localhost");
    }

    #[test]
    fn scheme_supplies_default_port() {
        let endpoint = BrokerEndpoint::parse("mqtts://broker.local").unwrap();
        assert_eq!(endpoint.port, 8883);
        let endpoint = BrokerEndpoint::parse("wss://broker.local/mqtt").unwrap();
        assert_eq!(endpoint.port, 443);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(BrokerEndpoint::parse("  "), Err(EndpointError::Empty));
        assert_eq!(
            BrokerEndpoint::parse("http://broker.local"),
            Err(EndpointError::UnsupportedScheme("http".to_string()))
        );
        assert_eq!(
            BrokerEndpoint::parse("mqtt://broker.local:abc"),
            Err(EndpointError::InvalidPort("abc".to_string()))
        );
        assert!(matches!(
            BrokerEndpoint::parse("mqtt://:1883"),
            Err(EndpointError::MissingHost(_))
        ));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = BrokerCredentials {
            username: "operator".to_string(),
            password: "s3cret".to_string(),
        };
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("operator"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn client_ids_are_unique_per_call() {
        let config = MqttConfig {
            endpoint: BrokerEndpoint::parse("localhost").unwrap(),
            credentials: None,
            client_id_prefix: "esteira".to_string(),
            keep_alive: Duration::from_secs(30),
            channel_capacity: 10,
        };
        let a = config.client_id();
        let b = config.client_id();
        assert!(a.starts_with("esteira_"));
        assert_eq!(a.len(), "esteira_".len() + 8);
        assert_ne!(a, b);
    }
}
