use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::frame::types::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// An ERROR response: the server's error code expanded into a
/// [DbError], plus the accompanying message.
#[derive(Debug)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: types::read_string(buf)?.to_owned(),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: types::read_raw_bytes(1, buf)?[0] != 0,
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_owned(),
                table: types::read_string(buf)?.to_owned(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(types::read_short_bytes(buf)?.to_owned()),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

/// An error code sent by the server in an ERROR response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Something unexpected happened server side.
    #[error("Internal server error")]
    ServerError,

    /// The frame or its contents violated the protocol.
    #[error("Protocol error")]
    ProtocolError,

    /// Authentication was required and failed.
    #[error("Authentication failed")]
    AuthenticationError,

    /// Not enough live replicas to reach the requested consistency.
    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    /// The coordinator was overloaded.
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    /// The coordinator is still bootstrapping.
    #[error("The request was sent to a node that is still bootstrapping")]
    IsBootstrapping,

    /// A truncate operation failed.
    #[error("Error during truncate operation")]
    TruncateError,

    /// Not enough replicas acknowledged a write in time.
    #[error(
        "Not enough replicas responded to the write within the timeout \
        (consistency: {consistency}, received: {received}, required: {required}, \
        write_type: {write_type})"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: String,
    },

    /// Not enough replicas answered a read in time.
    #[error(
        "Not enough replicas responded to the read within the timeout \
        (consistency: {consistency}, received: {received}, required: {required}, \
        data_present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    /// The submitted statement has a syntax error.
    #[error("The submitted query has a syntax error")]
    SyntaxError,

    /// The logged user is not authorized for this operation.
    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    /// The statement is syntactically correct but invalid.
    #[error("The query is syntactically correct but invalid")]
    Invalid,

    /// The statement is invalid due to a configuration issue.
    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    /// The created keyspace/table already exists.
    #[error("The keyspace or table to create already exists (keyspace: {keyspace}, table: {table})")]
    AlreadyExists { keyspace: String, table: String },

    /// The EXECUTE referenced an id unknown to this node.
    #[error("Can not execute an unprepared statement (statement id: {statement_id:?})")]
    Unprepared { statement_id: Bytes },

    /// An error code this client does not recognize.
    #[error("Unrecognized error code: {0:#06x}")]
    Other(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_with(code: i32, reason: &str, extra: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(code, &mut buf);
        types::write_string(reason, &mut buf).unwrap();
        buf.extend_from_slice(extra);
        buf
    }

    #[test]
    fn deserialize_simple_error() {
        let buf = body_with(0x2000, "line 1: no viable alternative", &[]);
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(err.error, DbError::SyntaxError);
        assert_eq!(err.reason, "line 1: no viable alternative");
    }

    #[test]
    fn deserialize_unavailable() {
        let mut extra = Vec::new();
        types::write_consistency(Consistency::Quorum, &mut extra);
        types::write_int(3, &mut extra);
        types::write_int(1, &mut extra);
        let buf = body_with(0x1000, "down", &extra);

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 3,
                alive: 1,
            }
        );
    }

    #[test]
    fn deserialize_unknown_code() {
        let buf = body_with(0x4242, "?", &[]);
        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(err.error, DbError::Other(0x4242));
    }
}
