mod connection;

pub(crate) use connection::{Connection, ConnectionConfig, ErrorReceiver, open_connection};
