use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Identity is empty")]
    EmptyIdentity,

    #[error("Invalid topic key: {0}")]
    InvalidTopic(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}
