//! # Mock DSSP Gateway Node
//!
//! A simulated embedded gateway for testing the DSSP host library without
//! hardware.
//!
//! This mock node:
//! - Decodes DSSP frames from any async byte stream (serial port or in-memory pipe)
//! - Answers SDO uploads and downloads from a configurable object dictionary,
//!   including segmented domain transfers
//! - Tracks NMT state and acknowledges raw CAN messages
//! - Can simulate dynamic changing values (like sensor readings)

pub mod link;
pub mod object_dictionary;
pub mod sdo_server;

pub use link::{serve, MockBus};
pub use object_dictionary::ObjectDictionary;
pub use sdo_server::{NmtState, SdoServer};

/// A node populated with the standard test objects
pub fn test_node(node_id: u8) -> SdoServer {
    let mut object_dict = ObjectDictionary::new();
    object_dict.add_test_objects();
    SdoServer::new(node_id, object_dict)
}
