use thiserror::Error;

use crate::status::WorkerId;

/// Error type returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid connection or listener configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required connection detail was not provided.
    #[error("missing connection detail: {0}")]
    Missing(&'static str),

    /// A connection detail could not be parsed.
    #[error("invalid value for {field}: {value:?}")]
    Invalid { field: &'static str, value: String },

    /// A listener was configured with a queue name that cannot be consumed.
    #[error("queue name must not be empty")]
    EmptyQueue,

    /// A listener was configured with zero workers.
    #[error("worker count for queue '{0}' must be at least 1")]
    ZeroWorkers(String),
}

/// Failure reported by the broker layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The connection or channel was closed underneath the caller.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The broker refused a declaration or command.
    #[error("broker refused {operation}: {reason}")]
    Refused { operation: &'static str, reason: String },

    /// The broker cancelled the consumer or the delivery stream ended.
    #[error("consumer on queue '{0}' was cancelled")]
    ConsumerCancelled(String),
}

/// Failure while turning a delivery into handler arguments or a reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The body could not be decoded by the configured decoder.
    #[error("failed to decode message body: {0}")]
    Decode(String),

    /// The handler return value could not be encoded.
    #[error("failed to encode reply: {0}")]
    Encode(String),

    /// A handler argument could not be extracted from the message.
    #[error("cannot bind handler argument `{argument}`: {reason}")]
    Extract { argument: &'static str, reason: String },

    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Publishing through the channel failed.
    #[error("failed to publish: {0}")]
    Publish(#[from] BrokerError),
}

/// Terminal failure of a single worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The broker connection failed and the listener does not restart.
    #[error("worker {worker} gave up: {source}")]
    ConnectionFailed {
        worker: WorkerId,
        #[source]
        source: BrokerError,
    },
}

/// Failure of the orchestrator lifecycle.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Configuration was rejected before start.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker ended before every worker reported connected.
    #[error("worker {0} exited before the consumer finished starting")]
    WorkerExited(WorkerId),

    /// Waiting for the shutdown signal failed.
    #[error("failed to install shutdown signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Decode(err.to_string())
    }
}

/// Renders an error and its source chain on one line.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct Inner;

    #[derive(Debug, Error)]
    #[error("write failed")]
    struct Outer(#[source] Inner);

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Outer(Inner);
        assert_eq!(error_chain(&err), "write failed: disk full");
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::Missing("host").to_string(),
            "missing connection detail: host"
        );
        assert_eq!(
            ConfigError::ZeroWorkers("orders".into()).to_string(),
            "worker count for queue 'orders' must be at least 1"
        );
    }
}
