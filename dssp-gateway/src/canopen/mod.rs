// CANopen services on top of the gateway session
pub mod connect;

pub use connect::{CanOpenGateway, NmtCommand, NodeHandle};
