//! Async Cassandra driver speaking the native CQL binary protocol,
//! versions 1 and 2.
//!
//! A [Session] connects to a seed node, discovers the cluster through
//! `system.local` and `system.peers`, and keeps a configurable number
//! of primary connections open with datacenter preference. Statements
//! are dispatched round-robin over the primaries; prepared statements
//! are cached by their text and re-prepared on every new connection.
//!
//! ```no_run
//! use priam::{Consistency, QueryOptions, SessionBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionBuilder::new()
//!     .host("127.0.0.1")
//!     .keyspace("test")
//!     .default_consistency(Consistency::One)
//!     .build()
//!     .await?;
//!
//! let rows = session
//!     .query_rows("SELECT a, b FROM c", None, QueryOptions::default())
//!     .await?;
//! for index in 0..rows.rows_count {
//!     println!("{:?}", rows.row_map(index)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
mod cluster;
pub mod errors;
mod network;
pub mod statement;

pub use client::{QueryOptions, Session, SessionBuilder, SessionConfig};
pub use statement::{PreparedQuery, QueryValues};

pub use priam_cql::frame::response::event::{
    Event, SchemaChangeEvent, StatusChangeEvent, TopologyChangeEvent,
};
pub use priam_cql::frame::response::result::{
    ColumnSpec, ColumnType, CqlResult, ResultMetadata, Rows, SchemaChangeType,
};
pub use priam_cql::frame::server_event_type::EventType;
pub use priam_cql::frame::types::SerialConsistency;
pub use priam_cql::{Compression, Consistency, CqlValue, DbError, ProtocolVersion};
