//! Topology discovery through the `system` tables of a freshly
//! connected node.

use crate::errors::{NewSessionError, RequestError};
use crate::network::Connection;
use priam_cql::frame::request::query::QueryParameters;
use priam_cql::frame::response::result::Rows;
use priam_cql::frame::types::Consistency;
use priam_cql::frame::value::CqlValue;
use std::collections::HashMap;
use std::net::IpAddr;

const LOCAL_QUERY: &str = "SELECT data_center, rack FROM system.local";
const PEERS_QUERY: &str = "SELECT peer, data_center, rack FROM system.peers";

pub(crate) struct LocalInfo {
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
}

pub(crate) struct Peer {
    pub(crate) addr: IpAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
}

fn text_column(row: &HashMap<String, Option<CqlValue>>, name: &str) -> Option<String> {
    row.get(name).cloned().flatten().and_then(CqlValue::into_string)
}

/// Queries `system.local` and `system.peers` on the given connection.
/// The connection's own identity is its peer address; `system.peers`
/// yields everyone else.
pub(crate) async fn query_topology(
    conn: &Connection,
) -> Result<(LocalInfo, Vec<Peer>), NewSessionError> {
    let parameters = || QueryParameters {
        consistency: Consistency::One,
        ..Default::default()
    };

    let local_rows: Rows = conn.query_rows(LOCAL_QUERY, parameters()).await?;
    if local_rows.rows_count == 0 {
        return Err(NewSessionError::Metadata(
            "system.local returned no rows".to_string(),
        ));
    }
    let local_row = local_rows.row_map(0).map_err(RequestError::from)?;
    let local = LocalInfo {
        datacenter: text_column(&local_row, "data_center"),
        rack: text_column(&local_row, "rack"),
    };

    let peers_rows: Rows = conn.query_rows(PEERS_QUERY, parameters()).await?;
    let mut peers = Vec::with_capacity(peers_rows.rows_count);
    for index in 0..peers_rows.rows_count {
        let row = peers_rows.row_map(index).map_err(RequestError::from)?;
        let addr = match row.get("peer").cloned().flatten() {
            Some(CqlValue::Inet(addr)) => addr,
            other => {
                return Err(NewSessionError::Metadata(format!(
                    "system.peers returned a non-inet peer column: {:?}",
                    other
                )));
            }
        };
        peers.push(Peer {
            addr,
            datacenter: text_column(&row, "data_center"),
            rack: text_column(&row, "rack"),
        });
    }

    Ok((local, peers))
}
