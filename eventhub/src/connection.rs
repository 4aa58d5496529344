use crate::error::{EventHubError, Result};

/// Resolves the broker namespace credentials to a connection string.
pub trait ConnectionStringProvider: Send + Sync {
    fn connection_string(&self) -> Result<String>;
}

/// Provider for a connection string known up front, typically from configuration.
#[derive(Clone, Debug)]
pub struct StaticConnectionString(String);

impl StaticConnectionString {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self(connection_string.into())
    }
}

impl ConnectionStringProvider for StaticConnectionString {
    fn connection_string(&self) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(EventHubError::invalid_argument(
                "namespace connection string can't be empty",
            ));
        }
        Ok(self.0.clone())
    }
}

/// Port of the Kafka-compatible endpoint exposed by Event Hubs namespaces.
const NAMESPACE_KAFKA_PORT: u16 = 9093;
const SASL_USERNAME: &str = "$ConnectionString";

/// Broker endpoint resolved from a connection string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceEndpoint {
    /// Plain `host:port[,host:port]` bootstrap list.
    Bootstrap(String),
    /// Event Hubs namespace reached over SASL_SSL / PLAIN.
    Namespace {
        bootstrap_servers: String,
        sasl_username: String,
        sasl_password: String,
    },
}

impl NamespaceEndpoint {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let trimmed = connection_string.trim();
        if trimmed.is_empty() {
            return Err(EventHubError::invalid_argument(
                "namespace connection string can't be empty",
            ));
        }

        let Some(endpoint) = trimmed
            .split(';')
            .filter_map(|part| part.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("endpoint"))
            .map(|(_, value)| value.trim())
        else {
            return Ok(NamespaceEndpoint::Bootstrap(trimmed.to_string()));
        };

        let host = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint)
            .trim_end_matches('/');
        let host = host.split(':').next().unwrap_or_default();

        if host.is_empty() {
            return Err(EventHubError::invalid_argument(format!(
                "connection string endpoint has no host: {endpoint}"
            )));
        }

        Ok(NamespaceEndpoint::Namespace {
            bootstrap_servers: format!("{host}:{NAMESPACE_KAFKA_PORT}"),
            sasl_username: SASL_USERNAME.to_string(),
            sasl_password: trimmed.to_string(),
        })
    }

    pub fn bootstrap_servers(&self) -> &str {
        match self {
            NamespaceEndpoint::Bootstrap(servers) => servers,
            NamespaceEndpoint::Namespace {
                bootstrap_servers, ..
            } => bootstrap_servers,
        }
    }
}
