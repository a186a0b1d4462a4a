use bigdecimal::BigDecimal;
use bigdecimal::num_bigint::BigInt;
use byteorder::{BigEndian, ReadBytesExt};
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::frame::frame_errors::ParseError;
use crate::frame::response::result::ColumnType;
use crate::frame::types;

/// A typed CQL value, the in-memory form of one table cell or one bound
/// parameter.
///
/// Null is not a value: a null cell or bound parameter is an
/// `Option::None` around this type, encoded as a negative-length
/// `[bytes]` at the framing layer.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    BigInt(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Decimal(BigDecimal),
    Double(f64),
    Float(f32),
    Inet(IpAddr),
    Int(i32),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    Timeuuid(Uuid),
    Varchar(String),
    Varint(BigInt),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    /// Raw bytes of a value whose type tag this client does not know.
    /// Produced by the decoder only; encoding it is an error.
    Opaque { type_id: u16, bytes: Vec<u8> },
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) | Self::Varchar(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Varchar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// A short tag naming the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ascii(_) => "ascii",
            Self::BigInt(_) => "bigint",
            Self::Blob(_) => "blob",
            Self::Boolean(_) => "boolean",
            Self::Decimal(_) => "decimal",
            Self::Double(_) => "double",
            Self::Float(_) => "float",
            Self::Inet(_) => "inet",
            Self::Int(_) => "int",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
            Self::Timeuuid(_) => "timeuuid",
            Self::Varchar(_) => "varchar",
            Self::Varint(_) => "varint",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Opaque { .. } => "opaque",
        }
    }
}

/// An error returned when a value cannot be encoded for its parameter
/// column's type.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SerializeValueError {
    #[error("Value is not valid ASCII")]
    NotAscii,
    #[error("Cannot serialize a {value} value as CQL type {typ:?}")]
    TypeMismatch { typ: ColumnType, value: &'static str },
    #[error("Cannot serialize to unknown CQL type tag {0:#06x}")]
    UnknownType(u16),
    #[error("Cannot serialize to custom CQL type {0}")]
    CustomType(String),
    #[error("Decimal scale {0} does not fit the protocol's 32-bit scale field")]
    ScaleOverflow(i64),
    #[error("Collection count or element too large: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
}

fn mismatch(typ: &ColumnType, value: &CqlValue) -> SerializeValueError {
    SerializeValueError::TypeMismatch {
        typ: typ.clone(),
        value: value.kind(),
    }
}

/// Encodes a value for a column of the given type. The result is the
/// bare value bytes; the `[bytes]` length prefix belongs to the framing
/// layer.
pub fn ser_cql_value(value: &CqlValue, typ: &ColumnType) -> Result<Vec<u8>, SerializeValueError> {
    use ColumnType::*;

    Ok(match (typ, value) {
        (Ascii, CqlValue::Ascii(s)) | (Ascii, CqlValue::Varchar(s)) => {
            if !s.is_ascii() {
                return Err(SerializeValueError::NotAscii);
            }
            s.as_bytes().to_vec()
        }
        (Varchar, CqlValue::Varchar(s))
        | (Varchar, CqlValue::Ascii(s))
        | (Text, CqlValue::Varchar(s))
        | (Text, CqlValue::Ascii(s)) => s.as_bytes().to_vec(),
        (Boolean, CqlValue::Boolean(b)) => vec![*b as u8],
        (Blob, CqlValue::Blob(b)) => b.clone(),
        (Int, CqlValue::Int(i)) => i.to_be_bytes().to_vec(),
        (BigInt, CqlValue::BigInt(i))
        | (Counter, CqlValue::BigInt(i))
        | (Timestamp, CqlValue::BigInt(i))
        | (Timestamp, CqlValue::Timestamp(i)) => i.to_be_bytes().to_vec(),
        // Accept a plain int where a wider integer column expects one.
        (BigInt, CqlValue::Int(i)) | (Counter, CqlValue::Int(i)) => {
            (*i as i64).to_be_bytes().to_vec()
        }
        (Float, CqlValue::Float(f)) => f.to_be_bytes().to_vec(),
        (Double, CqlValue::Double(d)) => d.to_be_bytes().to_vec(),
        (Uuid, CqlValue::Uuid(u))
        | (Uuid, CqlValue::Timeuuid(u))
        | (Timeuuid, CqlValue::Timeuuid(u))
        | (Timeuuid, CqlValue::Uuid(u)) => u.as_bytes().to_vec(),
        (Inet, CqlValue::Inet(addr)) => match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        },
        (Varint, CqlValue::Varint(big)) => big.to_signed_bytes_be(),
        (Varint, CqlValue::Int(i)) => bigdecimal::num_bigint::BigInt::from(*i).to_signed_bytes_be(),
        (Varint, CqlValue::BigInt(i)) => bigdecimal::num_bigint::BigInt::from(*i).to_signed_bytes_be(),
        (Decimal, CqlValue::Decimal(decimal)) => {
            let (unscaled, scale) = decimal.as_bigint_and_exponent();
            let scale: i32 = scale
                .try_into()
                .map_err(|_| SerializeValueError::ScaleOverflow(scale))?;
            let mut buf = Vec::new();
            types::write_int(scale, &mut buf);
            buf.extend_from_slice(&unscaled.to_signed_bytes_be());
            buf
        }
        (List(inner), CqlValue::List(elements)) | (Set(inner), CqlValue::Set(elements)) => {
            let mut buf = Vec::new();
            types::write_short_length(elements.len(), &mut buf)?;
            for element in elements {
                let serialized = ser_cql_value(element, inner)?;
                types::write_short_bytes(&serialized, &mut buf)?;
            }
            buf
        }
        (Map(key_type, value_type), CqlValue::Map(entries)) => {
            let mut buf = Vec::new();
            types::write_short_length(entries.len(), &mut buf)?;
            for (key, value) in entries {
                let serialized_key = ser_cql_value(key, key_type)?;
                types::write_short_bytes(&serialized_key, &mut buf)?;
                let serialized_value = ser_cql_value(value, value_type)?;
                types::write_short_bytes(&serialized_value, &mut buf)?;
            }
            buf
        }
        (Custom(class), _) => return Err(SerializeValueError::CustomType(class.clone())),
        (Unknown(id), _) => return Err(SerializeValueError::UnknownType(*id)),
        (typ, value) => return Err(mismatch(typ, value)),
    })
}

/// Decodes the bare value bytes of a column of the given type.
pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> Result<CqlValue, ParseError> {
    use ColumnType::*;

    fn expect_len(typ: &ColumnType, buf: &[u8], len: usize) -> Result<(), ParseError> {
        if buf.len() != len {
            return Err(ParseError::BadIncomingData(format!(
                "Buffer length should be {} not {} for type {:?}",
                len,
                buf.len(),
                typ
            )));
        }
        Ok(())
    }

    Ok(match typ {
        Ascii => {
            if !buf.is_ascii() {
                return Err(ParseError::BadIncomingData(
                    "ASCII value contains non-ASCII bytes".to_string(),
                ));
            }
            CqlValue::Ascii(std::str::from_utf8(buf).map_err(|e| {
                ParseError::BadIncomingData(format!("Invalid UTF-8: {}", e))
            })?.to_owned())
        }
        Varchar | Text => CqlValue::Varchar(
            std::str::from_utf8(buf)
                .map_err(|e| ParseError::BadIncomingData(format!("Invalid UTF-8: {}", e)))?
                .to_owned(),
        ),
        Boolean => {
            expect_len(typ, buf, 1)?;
            CqlValue::Boolean(buf[0] != 0x00)
        }
        Blob => CqlValue::Blob(buf.to_vec()),
        Int => {
            expect_len(typ, buf, 4)?;
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        BigInt | Counter => {
            expect_len(typ, buf, 8)?;
            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        Timestamp => {
            expect_len(typ, buf, 8)?;
            CqlValue::Timestamp(buf.read_i64::<BigEndian>()?)
        }
        Float => {
            expect_len(typ, buf, 4)?;
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        Double => {
            expect_len(typ, buf, 8)?;
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        Uuid => {
            expect_len(typ, buf, 16)?;
            CqlValue::Uuid(uuid::Uuid::from_slice(buf).map_err(|e| {
                ParseError::BadIncomingData(format!("Invalid UUID: {}", e))
            })?)
        }
        Timeuuid => {
            expect_len(typ, buf, 16)?;
            CqlValue::Timeuuid(uuid::Uuid::from_slice(buf).map_err(|e| {
                ParseError::BadIncomingData(format!("Invalid UUID: {}", e))
            })?)
        }
        Inet => CqlValue::Inet(match buf.len() {
            4 => IpAddr::from(<[u8; 4]>::try_from(&buf[0..4]).unwrap()),
            16 => IpAddr::from(<[u8; 16]>::try_from(&buf[0..16]).unwrap()),
            v => {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid inet bytes length: {}",
                    v
                )));
            }
        }),
        Varint => CqlValue::Varint(bigdecimal::num_bigint::BigInt::from_signed_bytes_be(buf)),
        Decimal => {
            let scale = types::read_int(buf)? as i64;
            let unscaled = bigdecimal::num_bigint::BigInt::from_signed_bytes_be(buf);
            CqlValue::Decimal(BigDecimal::from((unscaled, scale)))
        }
        List(inner) => {
            let len = types::read_short(buf)? as usize;
            let mut elements = Vec::with_capacity(len);
            for _ in 0..len {
                let mut element = types::read_short_bytes(buf)?;
                elements.push(deser_cql_value(inner, &mut element)?);
            }
            CqlValue::List(elements)
        }
        Set(inner) => {
            let len = types::read_short(buf)? as usize;
            let mut elements = Vec::with_capacity(len);
            for _ in 0..len {
                let mut element = types::read_short_bytes(buf)?;
                elements.push(deser_cql_value(inner, &mut element)?);
            }
            CqlValue::Set(elements)
        }
        Map(key_type, value_type) => {
            let len = types::read_short(buf)? as usize;
            let mut entries = Vec::with_capacity(len);
            for _ in 0..len {
                let mut raw_key = types::read_short_bytes(buf)?;
                let key = deser_cql_value(key_type, &mut raw_key)?;
                let mut raw_value = types::read_short_bytes(buf)?;
                let value = deser_cql_value(value_type, &mut raw_value)?;
                entries.push((key, value));
            }
            CqlValue::Map(entries)
        }
        Custom(class) => {
            warn!(
                "Decoding value of custom type {} as opaque bytes",
                class
            );
            CqlValue::Opaque {
                type_id: 0x0000,
                bytes: buf.to_vec(),
            }
        }
        Unknown(id) => {
            warn!("Decoding value of unknown type tag {:#06x} as opaque bytes", id);
            CqlValue::Opaque {
                type_id: *id,
                bytes: buf.to_vec(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn roundtrip(value: CqlValue, typ: ColumnType) {
        let serialized = ser_cql_value(&value, &typ).unwrap();
        let deserialized = deser_cql_value(&typ, &mut &serialized[..]).unwrap();
        assert_eq!(deserialized, value);
    }

    #[test]
    fn roundtrip_scalars() {
        roundtrip(CqlValue::Ascii("priam".to_string()), ColumnType::Ascii);
        roundtrip(CqlValue::BigInt(-(1 << 42)), ColumnType::BigInt);
        roundtrip(CqlValue::Blob(vec![0x00, 0xFF, 0x7F]), ColumnType::Blob);
        roundtrip(CqlValue::Boolean(true), ColumnType::Boolean);
        roundtrip(CqlValue::Boolean(false), ColumnType::Boolean);
        roundtrip(CqlValue::Double(-1.5e300), ColumnType::Double);
        roundtrip(CqlValue::Int(-42), ColumnType::Int);
        roundtrip(CqlValue::Timestamp(1356998400000), ColumnType::Timestamp);
        roundtrip(CqlValue::Varchar("zażółć".to_string()), ColumnType::Varchar);
        roundtrip(
            CqlValue::Uuid(Uuid::from_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap()),
            ColumnType::Uuid,
        );
        roundtrip(CqlValue::Inet("127.0.0.1".parse().unwrap()), ColumnType::Inet);
        roundtrip(CqlValue::Inet("::1".parse().unwrap()), ColumnType::Inet);
    }

    #[test]
    fn roundtrip_float_within_tolerance() {
        let serialized = ser_cql_value(&CqlValue::Float(0.5), &ColumnType::Float).unwrap();
        let deserialized = deser_cql_value(&ColumnType::Float, &mut &serialized[..]).unwrap();
        match deserialized {
            CqlValue::Float(f) => assert!((f - 0.5).abs() < 1e-6),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn varint_boundary_encodings() {
        /*
            Value | Encoding
            ------|---------
                0 |     0x00
                1 |     0x01
               -1 |     0xFF
              255 |   0x00FF
             -255 |   0xFF01
        */
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (-1, &[0xFF]),
            (255, &[0x00, 0xFF]),
            (-255, &[0xFF, 0x01]),
            (127, &[0x7F]),
            (128, &[0x00, 0x80]),
            (-128, &[0x80]),
            (-129, &[0xFF, 0x7F]),
        ];

        for (value, encoding) in cases {
            let big = BigInt::from(*value);
            let serialized =
                ser_cql_value(&CqlValue::Varint(big.clone()), &ColumnType::Varint).unwrap();
            assert_eq!(&serialized[..], *encoding, "encoding of {}", value);

            let deserialized = deser_cql_value(&ColumnType::Varint, &mut &serialized[..]).unwrap();
            assert_eq!(deserialized, CqlValue::Varint(big));
        }
    }

    #[test]
    fn decimal_encoding() {
        let cases: &[(&str, &[u8])] = &[
            ("-1.28", &[0x00, 0x00, 0x00, 0x02, 0x80]),
            ("1.29", &[0x00, 0x00, 0x00, 0x02, 0x00, 0x81]),
            ("0", &[0x00, 0x00, 0x00, 0x00, 0x00]),
            ("123", &[0x00, 0x00, 0x00, 0x00, 0x7B]),
        ];

        for (text, encoding) in cases {
            let decimal = BigDecimal::from_str(text).unwrap();
            let serialized =
                ser_cql_value(&CqlValue::Decimal(decimal.clone()), &ColumnType::Decimal).unwrap();
            assert_eq!(&serialized[..], *encoding, "encoding of {}", text);

            let deserialized =
                deser_cql_value(&ColumnType::Decimal, &mut &serialized[..]).unwrap();
            assert_eq!(deserialized, CqlValue::Decimal(decimal));
        }
    }

    #[test]
    fn roundtrip_collections() {
        let list_type = ColumnType::List(Box::new(ColumnType::Int));
        roundtrip(
            CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2), CqlValue::Int(3)]),
            list_type,
        );

        let set_type = ColumnType::Set(Box::new(ColumnType::Varchar));
        roundtrip(
            CqlValue::Set(vec![
                CqlValue::Varchar("a".to_string()),
                CqlValue::Varchar("b".to_string()),
            ]),
            set_type,
        );

        let map_type = ColumnType::Map(Box::new(ColumnType::Varchar), Box::new(ColumnType::Int));
        roundtrip(
            CqlValue::Map(vec![
                (CqlValue::Varchar("one".to_string()), CqlValue::Int(1)),
                (CqlValue::Varchar("two".to_string()), CqlValue::Int(2)),
            ]),
            map_type,
        );
    }

    #[test]
    fn ascii_rejects_non_ascii() {
        assert_eq!(
            ser_cql_value(&CqlValue::Ascii("zażółć".to_string()), &ColumnType::Ascii),
            Err(SerializeValueError::NotAscii)
        );
        assert!(matches!(
            deser_cql_value(&ColumnType::Ascii, &mut &[0xC5u8, 0xBC][..]),
            Err(ParseError::BadIncomingData(_))
        ));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        assert!(matches!(
            ser_cql_value(&CqlValue::Int(1), &ColumnType::Boolean),
            Err(SerializeValueError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unknown_type_decodes_to_opaque_and_rejects_encode() {
        let typ = ColumnType::Unknown(0x1234);
        let value = deser_cql_value(&typ, &mut &[0xAAu8, 0xBB][..]).unwrap();
        assert_eq!(
            value,
            CqlValue::Opaque {
                type_id: 0x1234,
                bytes: vec![0xAA, 0xBB],
            }
        );
        assert_eq!(
            ser_cql_value(&value, &typ),
            Err(SerializeValueError::UnknownType(0x1234))
        );
    }

    #[test]
    fn counter_decodes_as_bigint() {
        let bytes = 256i64.to_be_bytes();
        let value = deser_cql_value(&ColumnType::Counter, &mut &bytes[..]).unwrap();
        assert_eq!(value, CqlValue::BigInt(256));
    }
}
