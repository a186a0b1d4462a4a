use crate::frame::ProtocolVersion;
use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// Executes a prepared statement by its server-assigned id, with values
/// already encoded for the statement's parameter columns.
pub struct Execute<'e> {
    pub id: &'e [u8],
    pub values: Vec<Option<Vec<u8>>>,
    pub parameters: QueryParameters,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_short_bytes(self.id, buf)?;
        self.parameters.serialize(version, &self.values, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;

    #[test]
    fn execute_body_v1() {
        let execute = Execute {
            id: b"0123456789ABCDEF",
            values: vec![Some(b"abc".to_vec()), None],
            parameters: QueryParameters {
                consistency: Consistency::One,
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        execute.serialize(ProtocolVersion::V1, &mut buf).unwrap();

        let mut expected: Vec<u8> = vec![0x00, 0x10];
        expected.extend_from_slice(b"0123456789ABCDEF");
        expected.extend_from_slice(&[0x00, 0x02]);
        expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x03]);
        expected.extend_from_slice(b"abc");
        expected.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        expected.extend_from_slice(&[0x00, 0x01]);
        assert_eq!(buf, expected);
    }

    #[test]
    fn execute_body_v2() {
        let execute = Execute {
            id: b"id",
            values: vec![Some(vec![0x64])],
            parameters: QueryParameters {
                consistency: Consistency::Quorum,
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        execute.serialize(ProtocolVersion::V2, &mut buf).unwrap();

        let mut rest = &buf[..];
        assert_eq!(types::read_short_bytes(&mut rest).unwrap(), b"id");
        assert_eq!(types::read_consistency(&mut rest).unwrap(), Consistency::Quorum);
        assert_eq!(rest[0], 0x01); // values flag
        rest = &rest[1..];
        assert_eq!(types::read_short(&mut rest).unwrap(), 1);
        assert_eq!(types::read_bytes(&mut rest).unwrap(), &[0x64]);
        assert!(rest.is_empty());
    }
}
