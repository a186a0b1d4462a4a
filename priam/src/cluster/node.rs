use crate::network::Connection;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// A cluster node as tracked by the coordinator.
///
/// State moves through `Unknown -> Up -> Down` driven by connect and
/// disconnect callbacks and by STATUS_CHANGE events; duplicated events
/// are deduplicated by only acting when a field would actually change.
pub(crate) struct Node {
    pub(crate) addr: SocketAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,

    /// The open connection, if this node is (becoming) a primary.
    pub(crate) conn: Option<Arc<Connection>>,
    /// Startup, the optional USE, and re-preparation of cached
    /// statements have all completed on `conn`.
    pub(crate) ready: bool,
    /// When the node was last seen going down; expires after a grace
    /// period when replacement primaries are picked.
    pub(crate) down_since: Option<Instant>,
}

impl Node {
    pub(crate) fn new(
        addr: SocketAddr,
        datacenter: Option<String>,
        rack: Option<String>,
    ) -> Self {
        Node {
            addr,
            datacenter,
            rack,
            conn: None,
            ready: false,
            down_since: None,
        }
    }
}
