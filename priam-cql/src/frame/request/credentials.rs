//! Protocol-level representation of a `CREDENTIALS` request (v1).

use std::collections::HashMap;

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// Plaintext credentials sent in response to an AUTHENTICATE challenge
/// from a server running the PasswordAuthenticator. Protocol v1 only.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl SerializableRequest for Credentials {
    const OPCODE: RequestOpcode = RequestOpcode::Credentials;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        let map = HashMap::from([
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ]);
        types::write_string_map(&map, buf)?;
        Ok(())
    }
}
