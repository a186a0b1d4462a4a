//! Frame types and codecs for the Cassandra native CQL binary
//! protocol, versions 1 and 2. This crate has no networking of its own
//! beyond async frame reading; the `priam` crate builds the actual
//! driver on top of it.

pub mod frame;

pub use crate::frame::response::error::DbError;
pub use crate::frame::response::result::{ColumnType, CqlResult, Rows};
pub use crate::frame::types::Consistency;
pub use crate::frame::value::CqlValue;
pub use crate::frame::{Compression, ProtocolVersion};
