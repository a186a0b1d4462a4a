//! CQL binary protocol in-wire types.

use super::frame_errors::LowLevelDeserializationError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::str;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    #[default]
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,

    // Serial consistencies may be used in SELECT statements to read
    // the outcome of Paxos rounds.
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<u16> for Consistency {
    type Error = LowLevelDeserializationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x000A => Ok(Consistency::LocalOne),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            _ => Err(LowLevelDeserializationError::UnknownConsistency(value)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

#[derive(Debug, Error)]
#[error("Expected Consistency Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    let v = buf.read_i32::<BigEndian>()?;
    Ok(v)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub(crate) fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    let v: usize = v.try_into()?;

    Ok(v)
}

pub(crate) fn write_int_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: i32 = v.try_into()?;

    write_int(v, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    let v = buf.read_i64::<BigEndian>()?;
    Ok(v)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    let v = buf.read_u16::<BigEndian>()?;
    Ok(v)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, std::io::Error> {
    let v = read_short(buf)?;
    let v: usize = v.into();
    Ok(v)
}

pub(crate) fn write_short_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

/// Reads a `[bytes]` field; a negative length decodes as null.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let v = Some(read_raw_bytes(len as usize, buf)?);
    Ok(v)
}

// Same as read_bytes_opt, but the value is known not to be null.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    let v = read_raw_bytes(len, buf)?;
    Ok(v)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let v = read_raw_bytes(len, buf)?;
    Ok(v)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => {
            write_int_length(bytes.as_ref().len(), buf)?;
            buf.put_slice(bytes.as_ref());
        }
        None => write_int(-1, buf),
    }

    Ok(())
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let raw = v.as_bytes();
    write_short_length(raw.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let raw = v.as_bytes();
    write_int_length(raw.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

/// Writes a `[string map]`. Keys are written in lexicographic order so
/// that a given map always serializes to the same bytes; readers accept
/// any order.
pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    let mut entries: Vec<(&str, &str)> = v
        .iter()
        .map(|(key, val)| (key.as_ref(), val.as_ref()))
        .collect();
    entries.sort_unstable_by_key(|(key, _)| *key);
    for (key, val) in entries {
        write_string(key, buf)?;
        write_string(val, buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(
    v: &[String],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for v in v.iter() {
        write_string(v, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;

    // It's safe to unwrap here because the conversion only fails
    // if the argument slice's length does not match, which
    // `read_raw_bytes` prevents.
    let raw_array: &[u8; 16] = raw.try_into().unwrap();

    Ok(Uuid::from_bytes(*raw_array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid.as_bytes()[..]);
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    let raw = read_short(buf)?;
    Consistency::try_from(raw)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// Reads an `[inet]`: one byte of address length, the address, and an
/// int port.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let ip_addr = read_inet_addr(buf)?;
    let port = read_int(buf)?;

    Ok(SocketAddr::new(ip_addr, port as u16))
}

/// Reads the address-only prefix of an `[inet]` (length byte plus 4 or
/// 16 address bytes, no port).
pub fn read_inet_addr(buf: &mut &[u8]) -> Result<IpAddr, LowLevelDeserializationError> {
    let len = buf.read_u8()?;
    let ip_addr = match len {
        4 => {
            let ret = IpAddr::from(<[u8; 4]>::try_from(&buf[0..4])?);
            buf.advance(4);
            ret
        }
        16 => {
            let ret = IpAddr::from(<[u8; 16]>::try_from(&buf[0..16])?);
            buf.advance(16);
            ret
        }
        v => return Err(LowLevelDeserializationError::InvalidInetLength(v)),
    };
    Ok(ip_addr)
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }

    write_int(addr.port() as i32, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn type_int() {
        let vals = [i32::MIN, -1, 0, 1, i32::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_int(*val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long() {
        let vals = [i64::MIN, -1, 0, 1, i64::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long(*val, &mut buf);
            assert_eq!(read_long(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_short() {
        let vals: [u16; 3] = [0, 1, u16::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_short(*val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string() {
        let vals = [String::from(""), String::from("hello, zażółć gęślą jaźń!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_string(val, &mut buf).unwrap();
            assert_eq!(read_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long_string(val, &mut buf).unwrap();
            assert_eq!(read_long_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_bytes_null() {
        let mut buf = Vec::new();
        write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(read_bytes_opt(&mut &buf[..]).unwrap(), None);
    }

    #[test]
    fn type_bytes() {
        let val = vec![1u8, 2, 3, 4, 5];
        let mut buf = Vec::new();
        write_bytes(&val, &mut buf).unwrap();
        assert_eq!(read_bytes(&mut &buf[..]).unwrap(), &val[..]);
    }

    #[test]
    fn type_short_bytes() {
        let val = vec![1u8, 2, 3, 4, 5];
        let mut buf = Vec::new();
        write_short_bytes(&val, &mut buf).unwrap();
        assert_eq!(read_short_bytes(&mut &buf[..]).unwrap(), &val[..]);
    }

    #[test]
    fn type_string_map_sorted_on_write() {
        let mut val = HashMap::new();
        val.insert(String::from("CQL_VERSION"), String::from("3.0.5"));
        val.insert(String::from("COMPRESSION"), String::from("snappy"));
        let mut buf = Vec::new();
        write_string_map(&val, &mut buf).unwrap();

        // COMPRESSION sorts before CQL_VERSION, whatever the map's
        // iteration order happens to be.
        let mut expected = Vec::new();
        write_short(2, &mut expected);
        write_string("COMPRESSION", &mut expected).unwrap();
        write_string("snappy", &mut expected).unwrap();
        write_string("CQL_VERSION", &mut expected).unwrap();
        write_string("3.0.5", &mut expected).unwrap();
        assert_eq!(buf, expected);

        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_string_list() {
        let val = vec![
            "STATUS_CHANGE".to_owned(),
            "TOPOLOGY_CHANGE".to_owned(),
            "SCHEMA_CHANGE".to_owned(),
        ];

        let mut buf = Vec::new();
        write_string_list(&val, &mut buf).unwrap();
        assert_eq!(read_string_list(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_uuid() {
        let u = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let mut buf = Vec::new();
        write_uuid(&u, &mut buf);
        let u2 = read_uuid(&mut &*buf).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn type_consistency() {
        let c = Consistency::Quorum;
        let mut buf = Vec::new();
        write_consistency(c, &mut buf);
        let c2 = read_consistency(&mut &*buf).unwrap();
        assert_eq!(c, c2);

        buf.clear();
        buf.put_u16(0x1234);
        let c_result = read_consistency(&mut &*buf);
        assert!(c_result.is_err());
    }

    #[test]
    fn type_inet() {
        let iv4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1234);
        let iv6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 2345);
        let mut buf = Vec::new();

        write_inet(iv4, &mut buf);
        let read_iv4 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv4, read_iv4);
        buf.clear();

        write_inet(iv6, &mut buf);
        let read_iv6 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv6, read_iv6);
    }

    #[test]
    fn read_past_end_is_an_error() {
        let buf = [0x00u8, 0x05, b'a'];
        assert!(matches!(
            read_string(&mut &buf[..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived { .. })
        ));
    }
}
