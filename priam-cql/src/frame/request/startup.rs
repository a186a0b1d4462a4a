//! Protocol-level representation of a `STARTUP` request.

use std::collections::HashMap;

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// The first request of every connection, finalising the negotiation
/// phase and establishing the CQL connection.
pub struct Startup {
    /// The protocol options accepted by the client, e.g. `CQL_VERSION`
    /// and `COMPRESSION`.
    pub options: HashMap<String, String>,
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}
