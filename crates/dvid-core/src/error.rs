use thiserror::Error;

/// Errors produced by the dvid protocol layer.
#[derive(Debug, Error)]
pub enum DvidError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for DvidError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        DvidError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for DvidError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        DvidError::Codec(e.to_string())
    }
}

pub type DvidResult<T> = Result<T, DvidError>;
