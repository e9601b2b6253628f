use dssp_common::{ErrorCode, PayloadError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Gateway session is closed")]
    Closed,
    #[error("No response from CANopen device")]
    Timeout,
    #[error("Gateway reported error: {0}")]
    Remote(ErrorCode),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Invalid node id {0}, expected 1-127")]
    InvalidNode(u8),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Map a confirmation code to the outcome of a request
    pub fn check(code: ErrorCode) -> Result<(), GatewayError> {
        match code {
            ErrorCode::Ok => Ok(()),
            ErrorCode::NoResponse => Err(GatewayError::Timeout),
            other => Err(GatewayError::Remote(other)),
        }
    }
}
