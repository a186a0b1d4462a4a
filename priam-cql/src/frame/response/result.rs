use crate::frame::frame_errors::ParseError;
use crate::frame::value::{CqlValue, deser_cql_value};
use crate::frame::{ProtocolVersion, types};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    /// Opaque statement id assigned by the server. Re-preparing the
    /// same CQL text on the same server yields the same id.
    pub id: Bytes,
    pub param_metadata: ResultMetadata,
    /// Only sent by protocol v2 servers.
    pub result_metadata: Option<ResultMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl From<&str> for SchemaChangeType {
    fn from(s: &str) -> Self {
        match s {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        }
    }
}

#[derive(Debug)]
pub struct SchemaChange {
    pub change_type: SchemaChangeType,
    pub keyspace: String,
    /// Empty when the change concerns the keyspace itself.
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    /// A type tag this client does not know. Values of this type
    /// decode to opaque bytes.
    Unknown(u16),
}

impl ColumnType {
    pub fn deserialize(buf: &mut &[u8]) -> Result<ColumnType, ParseError> {
        use ColumnType::*;
        let id = types::read_short(buf)?;
        Ok(match id {
            0x0000 => Custom(types::read_string(buf)?.to_string()),
            0x0001 => Ascii,
            0x0002 => BigInt,
            0x0003 => Blob,
            0x0004 => Boolean,
            0x0005 => Counter,
            0x0006 => Decimal,
            0x0007 => Double,
            0x0008 => Float,
            0x0009 => Int,
            0x000A => Text,
            0x000B => Timestamp,
            0x000C => Uuid,
            0x000D => Varchar,
            0x000E => Varint,
            0x000F => Timeuuid,
            0x0010 => Inet,
            0x0020 => List(Box::new(ColumnType::deserialize(buf)?)),
            0x0021 => Map(
                Box::new(ColumnType::deserialize(buf)?),
                Box::new(ColumnType::deserialize(buf)?),
            ),
            0x0022 => Set(Box::new(ColumnType::deserialize(buf)?)),
            id => {
                warn!("Unknown column type tag {:#06x}, values will decode to opaque bytes", id);
                Unknown(id)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Default)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn deserialize(buf: &mut &[u8]) -> Result<ResultMetadata, ParseError> {
        let flags = types::read_int(buf)?;
        let global_tables_spec = flags & 0x0001 != 0;
        // v2 flags; never set by v1 servers.
        let has_more_pages = flags & 0x0002 != 0;
        let no_metadata = flags & 0x0004 != 0;

        let col_count = types::read_int_length(buf)?;

        let paging_state = if has_more_pages {
            Some(Bytes::from(types::read_bytes(buf)?.to_owned()))
        } else {
            None
        };

        if no_metadata {
            return Ok(ResultMetadata {
                col_count,
                paging_state,
                col_specs: vec![],
            });
        }

        let global_table_spec = if global_tables_spec {
            Some(deser_table_spec(buf)?)
        } else {
            None
        };

        let mut col_specs = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let table_spec = if let Some(spec) = &global_table_spec {
                spec.clone()
            } else {
                deser_table_spec(buf)?
            };
            let name = types::read_string(buf)?.to_owned();
            let typ = ColumnType::deserialize(buf)?;
            col_specs.push(ColumnSpec {
                table_spec,
                name,
                typ,
            });
        }

        Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs,
        })
    }

    /// Finds a column by name. `name` may be the bare column name,
    /// `table.name`, or `keyspace.table.name`.
    pub fn find_column(&self, name: &str) -> Option<usize> {
        let mut parts = name.rsplit('.');
        let col = parts.next().unwrap_or(name);
        let table = parts.next();
        let ks = parts.next();

        self.col_specs.iter().position(|spec| {
            spec.name == col
                && table.map_or(true, |t| t == spec.table_spec.table_name)
                && ks.map_or(true, |k| k == spec.table_spec.ks_name)
        })
    }
}

fn deser_table_spec(buf: &mut &[u8]) -> Result<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

/// The rows of a RESULT. Cells are kept as the raw byte slices that
/// arrived on the wire and decoded on demand.
#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl Rows {
    /// Decodes row `index` into typed values, in column order.
    pub fn row_values(&self, index: usize) -> Result<Vec<Option<CqlValue>>, ParseError> {
        let row = &self.rows[index];
        let mut values = Vec::with_capacity(row.len());
        for (cell, spec) in row.iter().zip(self.metadata.col_specs.iter()) {
            values.push(match cell {
                Some(cell) => Some(deser_cql_value(&spec.typ, &mut &cell[..])?),
                None => None,
            });
        }
        Ok(values)
    }

    /// Decodes row `index` into a map keyed by column name.
    pub fn row_map(&self, index: usize) -> Result<HashMap<String, Option<CqlValue>>, ParseError> {
        let values = self.row_values(index)?;
        Ok(self
            .metadata
            .col_specs
            .iter()
            .map(|spec| spec.name.clone())
            .zip(values)
            .collect())
    }
}

/// The body of a RESULT response.
#[derive(Debug)]
pub enum CqlResult {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

impl CqlResult {
    /// A short human-readable tag naming the result kind, used in
    /// kind-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            CqlResult::Void => "void",
            CqlResult::Rows(_) => "rows",
            CqlResult::SetKeyspace(_) => "set_keyspace",
            CqlResult::Prepared(_) => "prepared",
            CqlResult::SchemaChange(_) => "schema_change",
        }
    }
}

fn deser_rows(buf: &mut &[u8]) -> Result<Rows, ParseError> {
    let metadata = ResultMetadata::deserialize(buf)?;

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for _ in 0..metadata.col_count {
            let v = types::read_bytes_opt(buf)?.map(|cell| Bytes::from(cell.to_owned()));
            columns.push(v);
        }
        rows.push(columns);
    }
    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> Result<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Prepared, ParseError> {
    let id = Bytes::from(types::read_short_bytes(buf)?.to_owned());
    let param_metadata = ResultMetadata::deserialize(buf)?;
    let result_metadata = match version {
        ProtocolVersion::V1 => None,
        ProtocolVersion::V2 => Some(ResultMetadata::deserialize(buf)?),
    };
    Ok(Prepared {
        id,
        param_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> Result<SchemaChange, ParseError> {
    let change_type = types::read_string(buf)?.into();
    let keyspace = types::read_string(buf)?.to_owned();
    let table = types::read_string(buf)?.to_owned();
    Ok(SchemaChange {
        change_type,
        keyspace,
        table,
    })
}

pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<CqlResult, ParseError> {
    use self::CqlResult::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(version, buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        k => return Err(ParseError::UnknownResultKind(k)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // RESULT body of `USE test;`: kind 3 and the keyspace name.
    #[test]
    fn deserialize_set_keyspace() {
        let buf: Vec<u8> = vec![
            0x00, 0x00, 0x00, 0x03, 0x00, 0x04, b't', b'e', b's', b't',
        ];
        let result = deserialize(ProtocolVersion::V1, &mut &buf[..]).unwrap();
        match result {
            CqlResult::SetKeyspace(ks) => assert_eq!(ks.keyspace_name, "test"),
            other => panic!("unexpected result kind: {}", other.kind()),
        }
    }

    // RESULT body of `SELECT a, b FROM c;` with one row:
    // a = "hello" (varchar), b = 100 (int).
    #[test]
    fn deserialize_rows() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]); // kind: rows
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // flags: global spec
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]); // two columns
        buf.extend_from_slice(&[0x00, 0x04]);
        buf.extend_from_slice(b"test");
        buf.extend_from_slice(&[0x00, 0x01, b'c']);
        buf.extend_from_slice(&[0x00, 0x01, b'a', 0x00, 0x0D]); // a: varchar
        buf.extend_from_slice(&[0x00, 0x01, b'b', 0x00, 0x09]); // b: int
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // one row
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x05]);
        buf.extend_from_slice(b"hello");
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x64]);

        let result = deserialize(ProtocolVersion::V1, &mut &buf[..]).unwrap();
        let rows = match result {
            CqlResult::Rows(rows) => rows,
            other => panic!("unexpected result kind: {}", other.kind()),
        };

        assert_eq!(rows.rows_count, 1);
        assert_eq!(rows.metadata.col_specs[0].name, "a");
        assert_eq!(rows.metadata.col_specs[0].table_spec.ks_name, "test");
        assert_eq!(rows.metadata.col_specs[1].typ, ColumnType::Int);

        let values = rows.row_values(0).unwrap();
        assert_eq!(values[0], Some(CqlValue::Varchar("hello".to_string())));
        assert_eq!(values[1], Some(CqlValue::Int(100)));

        let map = rows.row_map(0).unwrap();
        assert_eq!(map["a"], Some(CqlValue::Varchar("hello".to_string())));
        assert_eq!(map["b"], Some(CqlValue::Int(100)));
    }

    #[test]
    fn deserialize_prepared_v1() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x04]); // kind: prepared
        buf.extend_from_slice(&[0x00, 0x10]);
        buf.extend_from_slice(b"0123456789ABCDEF");
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // flags: global spec
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // one param column
        buf.extend_from_slice(&[0x00, 0x04]);
        buf.extend_from_slice(b"test");
        buf.extend_from_slice(&[0x00, 0x01, b't']);
        buf.extend_from_slice(&[0x00, 0x01, b'f', 0x00, 0x0D]); // f: varchar

        let result = deserialize(ProtocolVersion::V1, &mut &buf[..]).unwrap();
        let prepared = match result {
            CqlResult::Prepared(p) => p,
            other => panic!("unexpected result kind: {}", other.kind()),
        };
        assert_eq!(&prepared.id[..], b"0123456789ABCDEF");
        assert_eq!(prepared.param_metadata.col_specs.len(), 1);
        assert_eq!(prepared.param_metadata.col_specs[0].name, "f");
        assert!(prepared.result_metadata.is_none());
    }

    #[test]
    fn deserialize_schema_change() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x05]);
        for s in ["DROPPED", "test", "users"] {
            types::write_string(s, &mut buf).unwrap();
        }

        let result = deserialize(ProtocolVersion::V1, &mut &buf[..]).unwrap();
        match result {
            CqlResult::SchemaChange(change) => {
                assert_eq!(change.change_type, SchemaChangeType::Dropped);
                assert_eq!(change.keyspace, "test");
                assert_eq!(change.table, "users");
            }
            other => panic!("unexpected result kind: {}", other.kind()),
        }
    }

    #[test]
    fn deserialize_void() {
        let buf: Vec<u8> = vec![0x00, 0x00, 0x00, 0x01];
        let result = deserialize(ProtocolVersion::V1, &mut &buf[..]).unwrap();
        assert!(matches!(result, CqlResult::Void));
    }

    #[test]
    fn unknown_result_kind_is_an_error() {
        let buf: Vec<u8> = vec![0x00, 0x00, 0x00, 0x2A];
        assert!(matches!(
            deserialize(ProtocolVersion::V1, &mut &buf[..]),
            Err(ParseError::UnknownResultKind(0x2A))
        ));
    }

    #[test]
    fn paging_state_precedes_col_specs() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x03]); // flags: global spec | more pages
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // one column
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC]); // paging state
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tbl", &mut buf).unwrap();
        types::write_string("x", &mut buf).unwrap();
        buf.extend_from_slice(&[0x00, 0x09]);

        let metadata = ResultMetadata::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(metadata.paging_state.as_deref(), Some(&[0xAA, 0xBB, 0xCC][..]));
        assert_eq!(metadata.col_specs[0].name, "x");
    }

    #[test]
    fn find_column_matches_qualified_names() {
        let spec = |name: &str| ColumnSpec {
            table_spec: TableSpec {
                ks_name: "ks".to_string(),
                table_name: "tbl".to_string(),
            },
            name: name.to_string(),
            typ: ColumnType::Int,
        };
        let metadata = ResultMetadata {
            col_count: 2,
            paging_state: None,
            col_specs: vec![spec("a"), spec("b")],
        };

        assert_eq!(metadata.find_column("b"), Some(1));
        assert_eq!(metadata.find_column("tbl.b"), Some(1));
        assert_eq!(metadata.find_column("ks.tbl.b"), Some(1));
        assert_eq!(metadata.find_column("other.b"), None);
        assert_eq!(metadata.find_column("missing"), None);
    }
}
