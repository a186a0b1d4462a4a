pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use request::SerializableRequest;
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 8;

// Frame flags
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;

/// The protocol versions spoken by this crate.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    #[default]
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn request_byte(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 0x01,
            ProtocolVersion::V2 => 0x02,
        }
    }

    pub fn response_byte(self) -> u8 {
        self.request_byte() | 0x80
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// Snappy, the algorithm protocol v1 speaks.
    Snappy,
    /// LZ4, added in protocol v2. The compressed body is prefixed with
    /// a big-endian u32 holding the uncompressed length.
    Lz4,
}

impl Compression {
    /// The algorithm used for a given protocol version, if the codec
    /// was compiled in.
    pub fn negotiated(version: ProtocolVersion) -> Option<Compression> {
        match version {
            #[cfg(feature = "snappy")]
            ProtocolVersion::V1 => Some(Compression::Snappy),
            #[cfg(feature = "lz4")]
            ProtocolVersion::V2 => Some(Compression::Lz4),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully serialized request frame, missing only its stream id.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        let body = req.to_bytes(version)?;
        if let Some(compression) = compression {
            compress_append(&body, compression, &mut data)?;
            if data.len() - HEADER_SIZE < body.len() {
                flags |= FLAG_COMPRESSION;
            } else {
                // Compression did not help, send the frame plain.
                data.truncate(HEADER_SIZE);
                data.extend_from_slice(&body);
            }
        } else {
            data.extend_from_slice(&body);
        }

        data[0] = version.request_byte();
        data[1] = flags;
        // Leave space for the stream id
        data[3] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[4..8].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i8) {
        self.data[2] = stream as u8;
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the
// request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
}

pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let frame_version = buf.get_u8();
    if frame_version & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if frame_version & 0x7F != version.request_byte() {
        return Err(FrameError::VersionMismatch {
            expected: version.response_byte(),
            got: frame_version,
        });
    }

    let flags = buf.get_u8();
    let stream = buf.get_u8() as i8;

    let frame_params = FrameParams {
        version: frame_version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Undoes the body extensions signalled in the frame flags:
/// decompresses the body when the compression flag is set and discards
/// the tracing id when the tracing flag is set.
pub fn parse_response_body(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<Bytes, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    if flags & FLAG_TRACING != 0 {
        if body.len() < 16 {
            return Err(frame_errors::ParseError::BadIncomingData(
                "traced response body too short to hold a tracing id".to_string(),
            )
            .into());
        }
        body.advance(16);
    }

    Ok(body)
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        #[cfg(feature = "lz4")]
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        #[cfg(feature = "snappy")]
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
        #[allow(unreachable_patterns)]
        other => Err(FrameError::CompressionUnsupported(other.as_str())),
    }
}

fn decompress(comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    #[allow(unused_mut)]
    let mut comp_body = comp_body;
    match compression {
        #[cfg(feature = "lz4")]
        Compression::Lz4 => {
            let uncomp_len = Buf::get_u32(&mut comp_body) as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        #[cfg(feature = "snappy")]
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
        #[allow(unreachable_patterns)]
        other => Err(FrameError::CompressionUnsupported(other.as_str())),
    }
}
