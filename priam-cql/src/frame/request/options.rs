//! Protocol-level representation of an `OPTIONS` request.

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};

/// Asks the server which STARTUP options it supports. May be sent
/// before STARTUP; the server answers with SUPPORTED.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        _buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        Ok(())
    }
}
