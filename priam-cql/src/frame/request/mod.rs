//! CQL requests sent by the client.

pub mod auth_response;
pub mod credentials;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;

use super::ProtocolVersion;
use super::frame_errors::RequestSerializationError;

pub use auth_response::AuthResponse;
pub use credentials::Credentials;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::{Query, QueryParameters};
pub use register::Register;
pub use startup::Startup;

/// Opcode of a request, identifying the request type in a frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    /// Plaintext credentials; protocol v1 only, v2 replaced it with
    /// SASL AUTH_RESPONSE.
    Credentials = 0x04,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x04 => Ok(Self::Credentials),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0F => Ok(Self::AuthResponse),
            other => Err(other),
        }
    }
}

/// Requests that can be serialized into a frame body.
///
/// Serialization is version-aware: a few requests lay out their bodies
/// differently between protocol v1 and v2.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError>;

    fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, RequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(version, &mut v)?;
        Ok(v.into())
    }
}
