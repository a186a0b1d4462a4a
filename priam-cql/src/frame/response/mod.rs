pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use num_enum::TryFromPrimitive;

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::ParseError;
pub use error::Error;
pub use supported::Supported;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthSuccess = 0x10,
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::CqlResult),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    pub fn deserialize(
        version: ProtocolVersion,
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> Result<Response, ParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(authenticate::Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => {
                Response::AuthSuccess(authenticate::AuthSuccess::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(version, buf)?),
            ResponseOpcode::Event => Response::Event(event::Event::deserialize(buf)?),
        };

        Ok(response)
    }

    /// A short human-readable tag naming the response kind, used in
    /// "unexpected response" errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Error(_) => "ERROR",
            Response::Ready => "READY",
            Response::Result(_) => "RESULT",
            Response::Authenticate(_) => "AUTHENTICATE",
            Response::AuthSuccess(_) => "AUTH_SUCCESS",
            Response::Supported(_) => "SUPPORTED",
            Response::Event(_) => "EVENT",
        }
    }
}
