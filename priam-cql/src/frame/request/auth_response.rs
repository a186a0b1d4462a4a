//! Protocol-level representation of an `AUTH_RESPONSE` request (v2).

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::write_bytes_opt;

/// A SASL token answering a server authentication challenge.
pub struct AuthResponse {
    /// Token computed by the authenticator; `None` maps to a null
    /// `[bytes]` body.
    pub response: Option<Vec<u8>>,
}

impl AuthResponse {
    /// Builds the initial token of the SASL PLAIN mechanism.
    pub fn plain(username: &str, password: &str) -> Self {
        let mut response = Vec::with_capacity(username.len() + password.len() + 2);
        response.push(0);
        response.extend_from_slice(username.as_bytes());
        response.push(0);
        response.extend_from_slice(password.as_bytes());
        AuthResponse {
            response: Some(response),
        }
    }
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        write_bytes_opt(self.response.as_ref(), buf)?;
        Ok(())
    }
}
