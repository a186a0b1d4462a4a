use bytes::{BufMut, Bytes};

use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::frame::types::SerialConsistency;

// Query flags, protocol v2 and later.
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;

/// Executes a single unprepared statement. The server answers with a
/// RESULT frame.
pub struct Query<'q> {
    pub contents: &'q str,
    pub parameters: QueryParameters,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(self.contents, buf)?;
        self.parameters.serialize(version, &[], buf)?;
        Ok(())
    }
}

/// The per-request execution parameters shared by QUERY and EXECUTE.
///
/// Protocol v1 knows only the consistency; the remaining fields are v2
/// options and are ignored when serializing a v1 body.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    pub consistency: types::Consistency,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<SerialConsistency>,
}

impl QueryParameters {
    /// Serializes the parameter block, together with the bound values
    /// used by EXECUTE. The layout differs between versions: v1 puts
    /// the values (if any) before a lone consistency short, while v2
    /// leads with the consistency and a flags byte.
    pub(crate) fn serialize(
        &self,
        version: ProtocolVersion,
        values: &[Option<Vec<u8>>],
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        match version {
            ProtocolVersion::V1 => {
                if !values.is_empty() {
                    write_values(values, buf)?;
                }
                types::write_consistency(self.consistency, buf);
            }
            ProtocolVersion::V2 => {
                types::write_consistency(self.consistency, buf);

                let mut flags = 0;
                if !values.is_empty() {
                    flags |= FLAG_VALUES;
                }
                if self.skip_metadata {
                    flags |= FLAG_SKIP_METADATA;
                }
                if self.page_size.is_some() {
                    flags |= FLAG_PAGE_SIZE;
                }
                if self.paging_state.is_some() {
                    flags |= FLAG_WITH_PAGING_STATE;
                }
                if self.serial_consistency.is_some() {
                    flags |= FLAG_WITH_SERIAL_CONSISTENCY;
                }
                buf.put_u8(flags);

                if !values.is_empty() {
                    write_values(values, buf)?;
                }
                if let Some(page_size) = self.page_size {
                    types::write_int(page_size, buf);
                }
                if let Some(paging_state) = &self.paging_state {
                    types::write_bytes(paging_state, buf)?;
                }
                if let Some(serial_consistency) = self.serial_consistency {
                    types::write_serial_consistency(serial_consistency, buf);
                }
            }
        }
        Ok(())
    }
}

fn write_values(
    values: &[Option<Vec<u8>>],
    buf: &mut Vec<u8>,
) -> Result<(), RequestSerializationError> {
    let count: u16 = values
        .len()
        .try_into()
        .map_err(|_| RequestSerializationError::TooManyValues(values.len()))?;
    types::write_short(count, buf);
    for value in values {
        types::write_bytes_opt(value.as_ref(), buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;

    #[test]
    fn query_body_v1() {
        let query = Query {
            contents: "USE test;",
            parameters: QueryParameters {
                consistency: Consistency::Any,
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        query.serialize(ProtocolVersion::V1, &mut buf).unwrap();

        let mut expected: Vec<u8> = vec![0x00, 0x00, 0x00, 0x09];
        expected.extend_from_slice(b"USE test;");
        expected.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(buf, expected);
    }

    #[test]
    fn query_body_v2_flags() {
        let query = Query {
            contents: "SELECT a FROM b",
            parameters: QueryParameters {
                consistency: Consistency::Quorum,
                skip_metadata: true,
                page_size: Some(100),
                paging_state: Some(Bytes::from_static(&[0xCA, 0xFE])),
                serial_consistency: Some(SerialConsistency::Serial),
            },
        };
        let mut buf = Vec::new();
        query.serialize(ProtocolVersion::V2, &mut buf).unwrap();

        let mut rest = &buf[..];
        assert_eq!(types::read_long_string(&mut rest).unwrap(), "SELECT a FROM b");
        assert_eq!(types::read_consistency(&mut rest).unwrap(), Consistency::Quorum);
        // skip_metadata | page_size | paging_state | serial_consistency
        assert_eq!(rest[0], 0x1E);
        rest = &rest[1..];
        assert_eq!(types::read_int(&mut rest).unwrap(), 100);
        assert_eq!(types::read_bytes(&mut rest).unwrap(), &[0xCA, 0xFE]);
        assert_eq!(types::read_short(&mut rest).unwrap(), 0x0008);
        assert!(rest.is_empty());
    }

    #[test]
    fn v2_options_ignored_in_v1() {
        let query = Query {
            contents: "SELECT a FROM b",
            parameters: QueryParameters {
                consistency: Consistency::One,
                page_size: Some(100),
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        query.serialize(ProtocolVersion::V1, &mut buf).unwrap();

        let mut rest = &buf[..];
        types::read_long_string(&mut rest).unwrap();
        types::read_consistency(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
