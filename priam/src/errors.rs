//! Error types surfaced by the driver.

use priam_cql::frame::frame_errors::{FrameError, ParseError, RequestSerializationError};
use priam_cql::frame::response::error::DbError;
use priam_cql::frame::value::SerializeValueError;
use thiserror::Error;

/// An error returned by a single driver operation: a query, a prepare,
/// an execute or a register.
#[derive(Error, Debug)]
pub enum RequestError {
    /// The server replied with an ERROR frame.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The frame envelope could not be produced or understood.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The response body could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The request body could not be serialized.
    #[error(transparent)]
    Serialize(#[from] RequestSerializationError),

    /// A bound value could not be encoded for its parameter column.
    #[error(transparent)]
    Value(#[from] SerializeValueError),

    /// Named or positional bind values did not match the statement's
    /// parameter columns.
    #[error(transparent)]
    Bind(#[from] BindError),

    /// The server answered with an opcode this request cannot accept.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    /// The RESULT carried a different kind than the caller asked for.
    #[error("Expected {expected} result, got {got}")]
    ResultKindMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// No consistency argument and no configured default.
    #[error("No consistency was provided and the session has no default")]
    MissingConsistency,

    /// Every primary is down or still initializing and no replacement
    /// could be picked.
    #[error("No primary connection is available")]
    NoPrimaryAvailable,

    /// The connection died before the response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session was shut down.
    #[error("Session is closed")]
    SessionClosed,

    /// An error shared by every waiter of one coalesced PREPARE flight.
    #[error(transparent)]
    Shared(#[from] std::sync::Arc<RequestError>),
}

/// An error in binding values to a prepared statement's parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("Bound name {0:?} does not match any parameter column")]
    UnknownName(String),
    #[error("Bound name {0:?} matches more than one parameter column")]
    AmbiguousName(String),
    #[error("Expected {expected} positional values, got {got}")]
    WrongValueCount { expected: usize, got: usize },
}

/// An error during the authentication exchange of connection setup.
#[derive(Error, Debug, Clone)]
pub enum AuthenticationError {
    #[error("Authenticator {0} is not supported")]
    UnsupportedAuthenticator(String),
    #[error("Server requires authentication, but no credentials were configured")]
    MissingCredentials,
}

/// An error while establishing and setting up a single connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error("USE {expected} left the connection in keyspace {got}")]
    KeyspaceMismatch { expected: String, got: String },
}

/// A fatal error that killed an established connection. Reported
/// through the connection's error receiver; every request pending on
/// the connection observes a uniform [RequestError::ConnectionClosed].
#[derive(Error, Debug)]
pub enum BrokenConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Write failed: {0}")]
    Write(std::io::Error),
    #[error("Received response with unexpected stream id {0}")]
    UnexpectedStreamId(i8),
    #[error("Server reported a connection-level error: {error}, Error message: {reason}")]
    ServerError { error: DbError, reason: String },
    #[error("Failed to parse an incoming event: {0}")]
    Event(ParseError),
}

/// An error that aborted [crate::Session::connect].
#[derive(Error, Debug)]
pub enum NewSessionError {
    #[error("No contact hosts were provided")]
    NoHostsProvided,
    #[error("None of the configured hosts could be resolved")]
    HostResolution,
    #[error("Failed to connect to any of the seed hosts; last error: {0}")]
    SeedsExhausted(#[source] Box<ConnectionError>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("Topology query returned unexpected data: {0}")]
    Metadata(String),
}
