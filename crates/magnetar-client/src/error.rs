use magnetar_protocol::proto::ServerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Already closed")]
    AlreadyClosed,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Checksum verification failed for sequence {0}")]
    ChecksumFailed(u64),

    #[error("Producer pending queue is full")]
    ProducerQueueFull,

    #[error("Producer blocked: quota exceeded (broker holds messages)")]
    ProducerBlockedQuotaExceededError,

    #[error("Producer blocked: quota exceeded (broker rejects messages)")]
    ProducerBlockedQuotaExceededException,

    #[error("Topic was terminated; no more messages can be published")]
    TopicTerminated,

    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Broker metadata error: {0}")]
    BrokerMetadataError(String),

    #[error("Broker error {kind:?}: {message}")]
    ServerError { kind: ServerError, message: String },

    #[error("Service URL is invalid: {0}")]
    InvalidServiceUrl(String),

    #[error("Unexpected broker response: expected {0}")]
    UnexpectedResponse(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] magnetar_protocol::ProtocolError),
}

impl Error {
    /// Transient failures are absorbed by the connection handler and retried
    /// under backoff until the operation budget runs out; everything else is
    /// surfaced to the caller immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::NotConnected
            | Error::ConnectionFailed(_)
            | Error::Io(_)
            | Error::Timeout(_)
            | Error::LookupFailed(_) => true,
            Error::ServerError { kind, .. } => matches!(
                kind,
                ServerError::ServiceNotReady
                    | ServerError::TooManyRequests
                    | ServerError::ConsumerBusy
                    | ServerError::ProducerBusy
            ),
            _ => false,
        }
    }

    /// Map a broker `ERROR` / `SEND_ERROR` code to the client taxonomy.
    pub fn from_server_error(kind: i32, message: String) -> Self {
        let kind = ServerError::try_from(kind).unwrap_or(ServerError::UnknownError);
        match kind {
            ServerError::AuthenticationError | ServerError::AuthorizationError => {
                Error::AuthFailed(message)
            }
            ServerError::TopicTerminatedError => Error::TopicTerminated,
            ServerError::ProducerBlockedQuotaExceededError => {
                Error::ProducerBlockedQuotaExceededError
            }
            ServerError::ProducerBlockedQuotaExceededException => {
                Error::ProducerBlockedQuotaExceededException
            }
            ServerError::MetadataError => Error::BrokerMetadataError(message),
            kind => Error::ServerError { kind, message },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
