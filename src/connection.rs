//! Broker connection parameters shared by every worker of a consumer.

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 5672;

/// Immutable broker connection parameters.
///
/// Use [`ConnectionSpec::builder`] or [`ConnectionSpec::from_env`] to construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Extra options forwarded verbatim to the connection layer.
    pub options: Vec<(String, String)>,
}

impl ConnectionSpec {
    /// Creates a new `ConnectionSpecBuilder` for the given broker host.
    pub fn builder(host: impl Into<String>) -> ConnectionSpecBuilder {
        ConnectionSpecBuilder::new(host.into())
    }

    /// Reads connection details from `QUEUE_HOST`, `QUEUE_PORT`, `QUEUE_USERNAME`,
    /// `QUEUE_PASSWORD` and `QUEUE_VHOST`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("QUEUE_HOST").ok_or(ConfigError::Missing("QUEUE_HOST"))?;
        let mut builder = Self::builder(host);

        if let Some(port) = lookup("QUEUE_PORT") {
            let port = port.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "QUEUE_PORT",
                value: port.clone(),
            })?;
            builder = builder.port(port);
        }
        if let Some(username) = lookup("QUEUE_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(password) = lookup("QUEUE_PASSWORD") {
            builder = builder.password(password);
        }
        if let Some(vhost) = lookup("QUEUE_VHOST") {
            builder = builder.vhost(vhost);
        }
        builder.build()
    }

    /// Renders the AMQP URI used to open a connection.
    pub fn amqp_uri(&self) -> String {
        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
        );
        for (i, (key, value)) in self.options.iter().enumerate() {
            uri.push(if i == 0 { '?' } else { '&' });
            uri.push_str(key);
            uri.push('=');
            uri.push_str(value);
        }
        uri
    }

    /// Address without credentials, for logging.
    pub fn display_addr(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.vhost)
    }
}

/// A builder for creating `ConnectionSpec` instances.
pub struct ConnectionSpecBuilder {
    host: String,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    vhost: Option<String>,
    options: Vec<(String, String)>,
}

impl ConnectionSpecBuilder {
    fn new(host: String) -> Self {
        Self {
            host,
            port: None,
            username: None,
            password: None,
            vhost: None,
            options: Vec::new(),
        }
    }

    /// Defaults to 5672.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Defaults to `guest`.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Defaults to `guest`.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Defaults to `/`.
    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    /// Adds a connection option such as `heartbeat` or `connection_timeout`.
    pub fn option(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.options.push((key.into(), value.to_string()));
        self
    }

    /// Builds the final `ConnectionSpec`, rejecting an empty host.
    pub fn build(self) -> Result<ConnectionSpec, ConfigError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::Missing("host"));
        }
        Ok(ConnectionSpec {
            host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            username: self.username.unwrap_or_else(|| "guest".to_string()),
            password: self.password.unwrap_or_else(|| "guest".to_string()),
            vhost: self.vhost.unwrap_or_else(|| "/".to_string()),
            options: self.options,
        })
    }
}
