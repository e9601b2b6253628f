//! # DSSP Gateway
//!
//! Host side of the DSSP serial link to an embedded CANopen gateway.
//!
//! - [`session`] turns a byte stream into an acknowledged, retried channel
//!   of gateway messages
//! - [`canopen`] offers blocking-style SDO, NMT and scan requests on top
//! - [`config`] holds link and timing settings loaded from TOML

pub mod canopen;
pub mod config;
pub mod error;
pub mod session;

pub use canopen::{CanOpenGateway, NmtCommand, NodeHandle};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use session::{GatewayHandler, GatewaySession, NoopHandler, SessionOptions, SessionStats};

// Protocol types used throughout the public API
pub use dssp_common::{ErrorCode, GatewayMessage, PayloadType, SdoMessage, Value};
