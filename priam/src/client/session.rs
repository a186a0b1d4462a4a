use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cluster::{Cluster, ClusterConfig};
use crate::errors::{NewSessionError, RequestError};
use crate::network::ConnectionConfig;
use crate::statement::{PreparedQuery, QueryValues};
use priam_cql::frame::request::query::QueryParameters;
use priam_cql::frame::response::event::Event;
use priam_cql::frame::response::result::{CqlResult, Rows};
use priam_cql::frame::server_event_type::EventType;
use priam_cql::frame::types::{Consistency, SerialConsistency};
use priam_cql::frame::{Compression, ProtocolVersion};

/// Configuration of a [Session].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Seed hostnames, tried in order on the initial connect.
    pub hosts: Vec<String>,
    /// TCP port of every node.
    pub port: u16,
    /// Credentials for the PasswordAuthenticator.
    pub username: Option<String>,
    pub password: Option<String>,
    /// If set, `USE <keyspace>` runs on every new connection.
    pub keyspace: Option<String>,
    /// Used when a query or execute call passes no consistency.
    pub default_consistency: Option<Consistency>,
    /// Number of primary connections to maintain.
    pub primaries: usize,
    /// Prefer nodes of this datacenter when choosing primaries.
    pub prefer_dc: Option<String>,
    /// Wire protocol version to speak.
    pub protocol_version: ProtocolVersion,
    /// Whether to negotiate body compression (Snappy on v1, LZ4 on
    /// v2), when the codec is compiled in.
    pub compression: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            hosts: Vec::new(),
            port: 9042,
            username: None,
            password: None,
            keyspace: None,
            default_consistency: None,
            primaries: 1,
            prefer_dc: None,
            protocol_version: ProtocolVersion::V1,
            compression: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-call options of a query or execute. All of them are protocol v2
/// extensions and are ignored on a v1 connection.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<SerialConsistency>,
}

/// The driver's entry point: connects to the cluster, discovers its
/// topology and routes statements over the primary connections.
pub struct Session {
    cluster: Cluster,
    config: SessionConfig,
    closed: AtomicBool,
}

impl Session {
    /// Connects to the first reachable seed, discovers peers through
    /// `system.local`/`system.peers` and establishes the configured
    /// number of primary connections.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.hosts.is_empty() {
            return Err(NewSessionError::NoHostsProvided);
        }

        let mut contact_points: Vec<SocketAddr> = Vec::new();
        for host in &config.hosts {
            match lookup_host((host.as_str(), config.port)).await {
                Ok(addrs) => contact_points.extend(addrs),
                Err(err) => warn!("Failed to resolve seed host {}: {}", host, err),
            }
        }
        if contact_points.is_empty() {
            return Err(NewSessionError::HostResolution);
        }

        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        };
        let connection = ConnectionConfig {
            version: config.protocol_version,
            compression: config
                .compression
                .then(|| Compression::negotiated(config.protocol_version))
                .flatten(),
            credentials,
            keyspace: config.keyspace.clone(),
            event_sender: None,
        };

        let cluster = Cluster::new(ClusterConfig {
            contact_points,
            port: config.port,
            primaries: config.primaries,
            prefer_dc: config.prefer_dc.clone(),
            connection,
        })
        .await?;

        Ok(Session {
            cluster,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn builder() -> crate::client::SessionBuilder {
        crate::client::SessionBuilder::new()
    }

    /// Runs a CQL statement on the next primary and returns the
    /// decoded RESULT.
    pub async fn query(
        &self,
        cql: &str,
        consistency: Option<Consistency>,
        options: QueryOptions,
    ) -> Result<CqlResult, RequestError> {
        self.check_open()?;
        let parameters = self.parameters(consistency, &options)?;
        let conn = self.cluster.get_a_node()?;
        conn.query(cql, parameters).await
    }

    /// Like [Session::query], but insists the result is rows.
    pub async fn query_rows(
        &self,
        cql: &str,
        consistency: Option<Consistency>,
        options: QueryOptions,
    ) -> Result<Rows, RequestError> {
        self.check_open()?;
        let parameters = self.parameters(consistency, &options)?;
        let conn = self.cluster.get_a_node()?;
        conn.query_rows(cql, parameters).await
    }

    /// Prepares a statement on every primary and caches the handle by
    /// its CQL text. A second call with the same text returns the same
    /// handle without another round-trip while the first one is alive.
    pub async fn prepare(&self, cql: &str) -> Result<Arc<PreparedQuery>, RequestError> {
        self.check_open()?;
        self.cluster.prepare(cql.to_string()).await
    }

    /// Executes a prepared statement with the given values.
    pub async fn execute(
        &self,
        prepared: &PreparedQuery,
        values: &QueryValues,
        consistency: Option<Consistency>,
        options: QueryOptions,
    ) -> Result<CqlResult, RequestError> {
        self.check_open()?;
        let encoded = prepared.bind(values)?;
        let parameters = self.parameters(consistency, &options)?;
        let conn = self.cluster.get_a_node()?;
        conn.execute(prepared.id(), encoded, parameters).await
    }

    /// Subscribes to server events of the given types, as observed by
    /// the coordinator's event watchers.
    pub async fn register(
        &self,
        event_types: &[EventType],
    ) -> Result<mpsc::Receiver<Event>, RequestError> {
        self.check_open()?;
        self.cluster.add_listener(event_types.to_vec()).await
    }

    /// Lists the cluster's keyspaces.
    pub async fn keyspaces(&self) -> Result<Rows, RequestError> {
        self.schema_query("SELECT * FROM system.schema_keyspaces".to_string())
            .await
    }

    /// Lists the tables of a keyspace.
    pub async fn tables(&self, keyspace: &str) -> Result<Rows, RequestError> {
        self.schema_query(format!(
            "SELECT * FROM system.schema_columnfamilies WHERE keyspace_name = '{}'",
            escape(keyspace)
        ))
        .await
    }

    /// Lists the columns of a table.
    pub async fn columns(&self, keyspace: &str, table: &str) -> Result<Rows, RequestError> {
        self.schema_query(format!(
            "SELECT * FROM system.schema_columns \
             WHERE keyspace_name = '{}' AND columnfamily_name = '{}'",
            escape(keyspace),
            escape(table)
        ))
        .await
    }

    /// Fetches the `system.local` row of one node.
    pub async fn local_info(&self) -> Result<Rows, RequestError> {
        self.schema_query("SELECT * FROM system.local".to_string())
            .await
    }

    /// Refuses new requests and resolves once every connection has
    /// finished its outstanding work and closed.
    pub async fn close_when_idle(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.cluster.close_when_idle().await;
        }
    }

    /// Fails all in-flight requests and tears down every connection.
    pub async fn close_now(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.cluster.close_now().await;
    }

    async fn schema_query(&self, cql: String) -> Result<Rows, RequestError> {
        self.check_open()?;
        let parameters = QueryParameters {
            consistency: Consistency::One,
            ..Default::default()
        };
        let conn = self.cluster.get_a_node()?;
        conn.query_rows(&cql, parameters).await
    }

    fn check_open(&self) -> Result<(), RequestError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RequestError::SessionClosed);
        }
        Ok(())
    }

    fn parameters(
        &self,
        consistency: Option<Consistency>,
        options: &QueryOptions,
    ) -> Result<QueryParameters, RequestError> {
        let consistency = consistency
            .or(self.config.default_consistency)
            .ok_or(RequestError::MissingConsistency)?;
        Ok(QueryParameters {
            consistency,
            skip_metadata: options.skip_metadata,
            page_size: options.page_size,
            paging_state: options.paging_state.clone(),
            serial_consistency: options.serial_consistency,
        })
    }
}

fn escape(identifier: &str) -> String {
    identifier.replace('\'', "''")
}
