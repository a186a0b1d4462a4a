//! Protocol-level representation of a `PREPARE` request.

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// Prepares a single statement for later execution through EXECUTE.
pub struct Prepare<'a> {
    /// CQL statement string to prepare.
    pub query: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(self.query, buf)?;
        Ok(())
    }
}
