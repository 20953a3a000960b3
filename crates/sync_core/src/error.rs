use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncClientError {
    #[error("failed to establish sync connection: {0}")]
    Connection(String),
    #[error("sync channel closed before the first tick arrived")]
    HandshakeInterrupted,
    #[error("step superseded before its tick arrived")]
    StepSuperseded,
    #[error("remote reply for {method} is missing field {field}")]
    MissingField {
        method: &'static str,
        field: &'static str,
    },
}
