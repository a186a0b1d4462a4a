use super::response::ResponseOpcode;
use thiserror::Error;

/// An error concerning a whole frame: its header, its body extensions
/// or the compression envelope.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    RequestSerialization(#[from] RequestSerializationError),
    #[error("Frame is compressed, but no compression negotiated for connection")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame of protocol version {got:#04x}, expected {expected:#04x}")]
    VersionMismatch { expected: u8, got: u8 },
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame is compressed with {0}, but the codec was not compiled in")]
    CompressionUnsupported(&'static str),
    #[error("Frame decompression failed")]
    FrameDecompression,
    #[error("Frame compression failed")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Unknown response opcode: {0}")]
    UnknownOpcode(#[from] num_enum::TryFromPrimitiveError<ResponseOpcode>),
    #[cfg(feature = "lz4")]
    #[error("Error decompressing lz4 data: {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
}

/// An error that occurred while parsing a frame body.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Low-level deserialization failed: {0}")]
    LowLevelDeserializationError(#[from] LowLevelDeserializationError),
    #[error("Could not deserialize frame: {0}")]
    BadIncomingData(String),
    #[error("Unknown query result kind: {0}")]
    UnknownResultKind(i32),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Unknown type of cluster change: {0}")]
    UnknownChangeType(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// A low level deserialization error, returned when reading one of the
/// protocol's primitive values out of a buffer fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(u16),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

/// An error type returned when serialization of a request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RequestSerializationError {
    /// A string, bytes or list payload was too long for its length prefix.
    #[error("Payload too long for its length prefix: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    /// Too many bound values for the u16 count prefix.
    #[error("Too many bound values: {0}")]
    TooManyValues(usize),
}
