use crate::frame::frame_errors::ParseError;
use crate::frame::types;

/// A server challenge demanding authentication before the connection
/// becomes ready.
#[derive(Debug)]
pub struct Authenticate {
    /// Fully qualified class name of the authenticator the server runs.
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticator_name = types::read_string(buf)?.to_string();

        Ok(Authenticate { authenticator_name })
    }
}

/// Successful conclusion of a v2 SASL exchange.
#[derive(Debug)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let success_message = types::read_bytes_opt(buf)?.map(ToOwned::to_owned);

        Ok(AuthSuccess { success_message })
    }
}
