//! The cluster coordinator: node discovery and tracking, primary
//! maintenance with datacenter preference, event watching, and the
//! prepared-statement cache.

use arc_swap::ArcSwap;
use futures::FutureExt;
use futures::future::RemoteHandle;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, warn};

use crate::cluster::metadata;
use crate::cluster::node::Node;
use crate::errors::{NewSessionError, RequestError};
use crate::network::{Connection, ConnectionConfig, ErrorReceiver, open_connection};
use crate::statement::PreparedQuery;
use priam_cql::frame::response::event::{Event, StatusChangeEvent, TopologyChangeEvent};
use priam_cql::frame::server_event_type::EventType;

// A node seen going down is not considered a primary candidate until
// this much time has passed.
const DOWN_EXPIRY: Duration = Duration::from_secs(60);

// How long an unreferenced prepared statement stays cached.
const PREPARED_CACHE_GRACE: Duration = Duration::from_secs(300);

const CHANNEL_SIZE: usize = 32;

pub(crate) struct ClusterConfig {
    /// Resolved seed addresses, tried in order on the initial connect.
    pub(crate) contact_points: Vec<SocketAddr>,
    /// Port used for discovered peers.
    pub(crate) port: u16,
    /// Number of primary connections to maintain.
    pub(crate) primaries: usize,
    /// Prefer nodes of this datacenter when choosing primaries.
    pub(crate) prefer_dc: Option<String>,
    pub(crate) connection: ConnectionConfig,
}

type PrepareResult = Result<Arc<PreparedQuery>, Arc<RequestError>>;

enum Command {
    Prepare {
        cql: String,
        response: oneshot::Sender<PrepareResult>,
    },
    AddListener {
        types: Vec<EventType>,
        sender: mpsc::Sender<Event>,
    },
    CloseWhenIdle {
        done: oneshot::Sender<()>,
    },
    CloseNow {
        done: oneshot::Sender<()>,
    },
}

enum WorkerEvent {
    NodeConnected {
        ip: IpAddr,
        conn: Arc<Connection>,
    },
    /// A connect task finished a re-prepare pass over `prepared` on
    /// `conn`. The worker grants readiness only once that set covers
    /// every live cached statement and no prepare flight that missed
    /// the connection is still pending.
    NodeReady {
        ip: IpAddr,
        conn: Weak<Connection>,
        prepared: HashSet<String>,
    },
    NodeConnectFailed {
        ip: IpAddr,
    },
    ConnectionBroken {
        ip: IpAddr,
    },
    Prepared {
        cql: String,
        result: PrepareResult,
    },
    EvictPrepared {
        cql: String,
    },
}

enum CacheEntry {
    /// A PREPARE is in flight; new callers for the same text coalesce
    /// onto it. `targets` are the connections the flight was sent to.
    Pending {
        waiters: Vec<oneshot::Sender<PrepareResult>>,
        targets: Vec<Weak<Connection>>,
    },
    /// A prepared handle. `weak` tracks caller-held references; `pin`
    /// keeps the handle alive for the grace period after the last
    /// caller could have released it; `expiry` drops the pin.
    Live {
        weak: Weak<PreparedQuery>,
        pin: Option<Arc<PreparedQuery>>,
        expiry: Option<JoinHandle<()>>,
    },
}

struct PrimaryEntry {
    conn: Option<Arc<Connection>>,
    ready: bool,
}

struct RoutingSnapshot {
    primaries: Vec<PrimaryEntry>,
}

/// Handle to the coordinator. Queries pick their connection straight
/// from a lock-free snapshot; cache and topology mutations go through
/// the worker task.
pub(crate) struct Cluster {
    routing: Arc<ArcSwap<RoutingSnapshot>>,
    cursor: AtomicUsize,
    command_sender: mpsc::Sender<Command>,
    _worker_handle: RemoteHandle<()>,
}

impl Cluster {
    pub(crate) async fn new(config: ClusterConfig) -> Result<Cluster, NewSessionError> {
        let (event_sender, server_events) = mpsc::channel(CHANNEL_SIZE);
        let mut config = config;
        config.connection.event_sender = Some(event_sender);

        if config.contact_points.is_empty() {
            return Err(NewSessionError::NoHostsProvided);
        }

        // Try the seeds in order until one of them lets us in.
        let mut last_error = None;
        let mut seed = None;
        for addr in &config.contact_points {
            match open_connection(*addr, config.connection.clone()).await {
                Ok((conn, error_receiver)) => {
                    seed = Some((Arc::new(conn), error_receiver));
                    break;
                }
                Err(err) => {
                    warn!("Failed to connect to seed {}: {}", addr, err);
                    last_error = Some(err);
                }
            }
        }
        let (seed_conn, seed_error_receiver) = match seed {
            Some(seed) => seed,
            None => {
                let last_error = last_error.expect("at least one seed was attempted");
                return Err(NewSessionError::SeedsExhausted(Box::new(last_error)));
            }
        };

        let (local, peers) = metadata::query_topology(&seed_conn).await?;
        let seed_ip = seed_conn.connect_address().ip();

        let mut nodes: HashMap<IpAddr, Node> = HashMap::new();
        nodes.insert(
            seed_ip,
            Node {
                addr: seed_conn.connect_address(),
                datacenter: local.datacenter,
                rack: local.rack,
                conn: Some(seed_conn),
                ready: true,
                down_since: None,
            },
        );
        for peer in peers {
            if peer.addr == seed_ip {
                continue;
            }
            nodes.entry(peer.addr).or_insert_with(|| {
                Node::new(
                    SocketAddr::new(peer.addr, config.port),
                    peer.datacenter,
                    peer.rack,
                )
            });
        }

        // The seed connection stays on as the first primary; further
        // primaries come from the shuffled, DC-partitioned candidates.
        let desired = config.primaries.max(1);
        let mut primaries = vec![seed_ip];
        let mut candidates: Vec<IpAddr> =
            nodes.keys().copied().filter(|ip| *ip != seed_ip).collect();
        order_candidates(
            &mut candidates,
            &nodes,
            config.prefer_dc.as_deref(),
            &mut rand::thread_rng(),
        );
        primaries.extend(candidates.into_iter().take(desired - 1));

        let routing = Arc::new(ArcSwap::from_pointee(RoutingSnapshot { primaries: vec![] }));
        let (command_sender, command_receiver) = mpsc::channel(CHANNEL_SIZE);
        let (internal_sender, internal_receiver) = mpsc::channel(CHANNEL_SIZE);

        let mut worker = ClusterWorker {
            config,
            nodes,
            primaries,
            watchers: HashSet::new(),
            awaiting_ready: HashMap::new(),
            prepared_cache: HashMap::new(),
            listeners: Vec::new(),
            routing: routing.clone(),
            command_receiver,
            internal_sender,
            internal_receiver,
            server_events,
            closing: false,
        };

        worker.spawn_monitor(seed_ip, seed_error_receiver);
        worker.ensure_watchers();
        for ip in worker.primaries.clone().into_iter().skip(1) {
            worker.spawn_connect(ip);
        }
        worker.publish();

        let (fut, _worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(Cluster {
            routing,
            cursor: AtomicUsize::new(0),
            command_sender,
            _worker_handle,
        })
    }

    /// Returns the next ready primary, rotating a cursor over the
    /// primary set; when none is ready, falls back to the next primary
    /// that at least has a connection.
    pub(crate) fn get_a_node(&self) -> Result<Arc<Connection>, RequestError> {
        let snapshot = self.routing.load();
        let flags: Vec<(bool, bool)> = snapshot
            .primaries
            .iter()
            .map(|entry| (entry.ready, entry.conn.is_some()))
            .collect();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        match choose_primary(&flags, start) {
            Some(index) => Ok(snapshot.primaries[index]
                .conn
                .clone()
                .expect("choose_primary only picks connected entries")),
            None => Err(RequestError::NoPrimaryAvailable),
        }
    }

    pub(crate) async fn prepare(&self, cql: String) -> Result<Arc<PreparedQuery>, RequestError> {
        let (response, receiver) = oneshot::channel();
        self.command_sender
            .send(Command::Prepare { cql, response })
            .await
            .map_err(|_| RequestError::SessionClosed)?;
        receiver
            .await
            .map_err(|_| RequestError::SessionClosed)?
            .map_err(RequestError::from)
    }

    pub(crate) async fn add_listener(
        &self,
        types: Vec<EventType>,
    ) -> Result<mpsc::Receiver<Event>, RequestError> {
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        self.command_sender
            .send(Command::AddListener { types, sender })
            .await
            .map_err(|_| RequestError::SessionClosed)?;
        Ok(receiver)
    }

    pub(crate) async fn close_when_idle(&self) {
        self.close(true).await
    }

    pub(crate) async fn close_now(&self) {
        self.close(false).await
    }

    async fn close(&self, when_idle: bool) {
        let (done, ack) = oneshot::channel();
        let command = if when_idle {
            Command::CloseWhenIdle { done }
        } else {
            Command::CloseNow { done }
        };
        if self.command_sender.send(command).await.is_err() {
            return;
        }
        let _ = ack.await;
    }
}

struct ClusterWorker {
    config: ClusterConfig,
    nodes: HashMap<IpAddr, Node>,
    primaries: Vec<IpAddr>,
    watchers: HashSet<IpAddr>,
    // Connecting primaries whose readiness proposal is parked on the
    // prepared cache: the connection they ran on, and the statements
    // already re-prepared there.
    awaiting_ready: HashMap<IpAddr, (Weak<Connection>, HashSet<String>)>,
    prepared_cache: HashMap<String, CacheEntry>,
    listeners: Vec<(Vec<EventType>, mpsc::Sender<Event>)>,
    routing: Arc<ArcSwap<RoutingSnapshot>>,
    command_receiver: mpsc::Receiver<Command>,
    internal_sender: mpsc::Sender<WorkerEvent>,
    internal_receiver: mpsc::Receiver<WorkerEvent>,
    server_events: mpsc::Receiver<Event>,
    closing: bool,
}

impl ClusterWorker {
    async fn work(mut self) {
        loop {
            tokio::select! {
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // The Cluster handle is gone; stop working.
                    None => return,
                },
                event = self.internal_receiver.recv() => {
                    if let Some(event) = event {
                        self.handle_worker_event(event);
                    }
                },
                event = self.server_events.recv() => {
                    if let Some(event) = event {
                        self.handle_server_event(event);
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Prepare { cql, response } => self.handle_prepare(cql, response),
            Command::AddListener { types, sender } => {
                self.listeners.push((types, sender));
            }
            Command::CloseWhenIdle { done } => self.shutdown(true, done),
            Command::CloseNow { done } => self.shutdown(false, done),
        }
    }

    fn handle_prepare(&mut self, cql: String, response: oneshot::Sender<PrepareResult>) {
        if self.closing {
            let _ = response.send(Err(Arc::new(RequestError::SessionClosed)));
            return;
        }

        // A live handle is returned as-is; this is what makes two
        // prepare() calls for the same text reference-equal.
        let hit = match self.prepared_cache.get(&cql) {
            Some(CacheEntry::Live { weak, .. }) => weak.upgrade(),
            _ => None,
        };
        if let Some(handle) = hit {
            let new_expiry = self.spawn_expiry(cql.clone());
            if let Some(CacheEntry::Live { pin, expiry, .. }) = self.prepared_cache.get_mut(&cql)
            {
                if let Some(old) = expiry.replace(new_expiry) {
                    old.abort();
                }
                *pin = Some(handle.clone());
            }
            let _ = response.send(Ok(handle));
            return;
        }

        if let Some(CacheEntry::Pending { waiters, .. }) = self.prepared_cache.get_mut(&cql) {
            waiters.push(response);
            return;
        }

        let conns: Vec<Arc<Connection>> = self
            .primaries
            .iter()
            .filter_map(|ip| self.nodes.get(ip).and_then(|node| node.conn.clone()))
            .collect();
        if conns.is_empty() {
            let _ = response.send(Err(Arc::new(RequestError::NoPrimaryAvailable)));
            return;
        }

        self.prepared_cache.insert(
            cql.clone(),
            CacheEntry::Pending {
                waiters: vec![response],
                targets: conns.iter().map(Arc::downgrade).collect(),
            },
        );
        let sender = self.internal_sender.clone();
        tokio::spawn(async move {
            let result = prepare_on_all(conns, cql.clone()).await;
            let _ = sender.send(WorkerEvent::Prepared { cql, result }).await;
        });
    }

    fn shutdown(&mut self, when_idle: bool, done: oneshot::Sender<()>) {
        self.closing = true;
        self.awaiting_ready.clear();
        self.routing
            .store(Arc::new(RoutingSnapshot { primaries: vec![] }));

        let conns: Vec<Arc<Connection>> = self
            .nodes
            .values_mut()
            .filter_map(|node| {
                node.ready = false;
                node.conn.take()
            })
            .collect();
        tokio::spawn(async move {
            let closes = conns.into_iter().map(|conn| async move {
                if when_idle {
                    conn.close_when_idle().await;
                } else {
                    conn.close_now().await;
                }
            });
            futures::future::join_all(closes).await;
            let _ = done.send(());
        });
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::NodeConnected { ip, conn } => {
                if self.closing {
                    tokio::spawn(async move { conn.close_now().await });
                    return;
                }
                if let Some(node) = self.nodes.get_mut(&ip) {
                    node.conn = Some(conn.clone());
                    if self.watchers.contains(&ip) {
                        spawn_register(ip, conn);
                    }
                    self.publish();
                }
            }
            WorkerEvent::NodeReady { ip, conn, prepared } => {
                if self.closing {
                    return;
                }
                self.awaiting_ready.insert(ip, (conn, prepared));
                self.try_finish_ready(ip);
            }
            WorkerEvent::NodeConnectFailed { ip } => {
                if self.closing {
                    return;
                }
                self.awaiting_ready.remove(&ip);
                if let Some(node) = self.nodes.get_mut(&ip) {
                    node.down_since = Some(Instant::now());
                }
                if self.primaries.contains(&ip) {
                    self.primaries.retain(|primary| *primary != ip);
                    self.fill_primaries();
                }
            }
            WorkerEvent::ConnectionBroken { ip } => {
                if self.closing {
                    return;
                }
                self.awaiting_ready.remove(&ip);
                if let Some(node) = self.nodes.get_mut(&ip) {
                    node.conn = None;
                    node.ready = false;
                    node.down_since = Some(Instant::now());
                    if self.primaries.contains(&ip) {
                        self.primaries.retain(|primary| *primary != ip);
                        self.fill_primaries();
                    } else {
                        self.publish();
                    }
                }
            }
            WorkerEvent::Prepared { cql, result } => {
                match self.prepared_cache.remove(&cql) {
                    Some(CacheEntry::Pending { waiters, .. }) => {
                        if let Ok(handle) = &result {
                            let expiry = self.spawn_expiry(cql.clone());
                            self.prepared_cache.insert(
                                cql,
                                CacheEntry::Live {
                                    weak: Arc::downgrade(handle),
                                    pin: Some(handle.clone()),
                                    expiry: Some(expiry),
                                },
                            );
                        }
                        for waiter in waiters {
                            let _ = waiter.send(result.clone());
                        }
                    }
                    // Cache raced (e.g. shutdown); put whatever was
                    // there back.
                    Some(entry) => {
                        self.prepared_cache.insert(cql, entry);
                    }
                    None => {}
                }
                // The finished flight may be the last thing a
                // connecting primary was parked on.
                self.retry_awaiting_ready();
            }
            WorkerEvent::EvictPrepared { cql } => {
                if let Some(CacheEntry::Live { weak, pin, expiry }) =
                    self.prepared_cache.get_mut(&cql)
                {
                    *pin = None;
                    *expiry = None;
                    if weak.upgrade().is_none() {
                        self.prepared_cache.remove(&cql);
                    }
                }
            }
        }
    }

    fn handle_server_event(&mut self, event: Event) {
        if self.closing {
            return;
        }
        match &event {
            Event::StatusChange(StatusChangeEvent::Down(addr)) => self.node_down(addr.ip()),
            Event::StatusChange(StatusChangeEvent::Up(addr)) => self.node_up(addr.ip()),
            Event::TopologyChange(TopologyChangeEvent::NewNode(addr)) => {
                self.node_added(addr.ip())
            }
            Event::TopologyChange(TopologyChangeEvent::RemovedNode(addr)) => {
                self.node_removed(addr.ip())
            }
            Event::SchemaChange(_) => {}
        }
        self.forward_event(event);
    }

    fn forward_event(&mut self, event: Event) {
        let event_type = match &event {
            Event::TopologyChange(_) => EventType::TopologyChange,
            Event::StatusChange(_) => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        };
        self.listeners.retain(|(types, sender)| {
            if !types.contains(&event_type) {
                return !sender.is_closed();
            }
            match sender.try_send(event.clone()) {
                Ok(()) => true,
                // A slow listener loses the event rather than stalling
                // the coordinator.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn node_down(&mut self, ip: IpAddr) {
        if let Some(node) = self.nodes.get_mut(&ip) {
            if node.down_since.is_none() {
                debug!("Node {} reported DOWN", ip);
                node.down_since = Some(Instant::now());
            }
        }
    }

    fn node_up(&mut self, ip: IpAddr) {
        let Some(node) = self.nodes.get_mut(&ip) else {
            return;
        };
        if node.down_since.take().is_some() {
            debug!("Node {} reported UP", ip);
        }

        if let Some(prefer) = self.config.prefer_dc.clone() {
            let in_preferred = self
                .nodes
                .get(&ip)
                .is_some_and(|node| node.datacenter.as_deref() == Some(prefer.as_str()));
            if in_preferred && !self.primaries.contains(&ip) {
                // A preferred-DC node came back while some primary
                // lives outside the preferred DC: promote the newcomer
                // and drain the stranger.
                let displaced = self.primaries.iter().copied().find(|primary| {
                    self.nodes
                        .get(primary)
                        .map_or(true, |node| node.datacenter.as_deref() != Some(prefer.as_str()))
                });
                if let Some(displaced_ip) = displaced {
                    debug!(
                        "Promoting {} to primary, draining {} outside preferred datacenter",
                        ip, displaced_ip
                    );
                    self.primaries.retain(|primary| *primary != displaced_ip);
                    self.primaries.push(ip);
                    self.spawn_connect(ip);
                    self.awaiting_ready.remove(&displaced_ip);
                    if let Some(displaced_node) = self.nodes.get_mut(&displaced_ip) {
                        displaced_node.ready = false;
                        if let Some(conn) = displaced_node.conn.take() {
                            tokio::spawn(async move { conn.close_when_idle().await });
                        }
                    }
                    self.ensure_watchers();
                    self.publish();
                }
            }
        }

        // A recovered node may also let a degraded primary set refill.
        if self.primaries.len() < self.config.primaries.max(1) {
            self.fill_primaries();
        }
    }

    fn node_added(&mut self, ip: IpAddr) {
        if self.nodes.contains_key(&ip) {
            return;
        }
        debug!("New node {} joined the cluster", ip);
        self.nodes
            .insert(ip, Node::new(SocketAddr::new(ip, self.config.port), None, None));
        if self.primaries.len() < self.config.primaries.max(1) {
            self.fill_primaries();
        }
    }

    fn node_removed(&mut self, ip: IpAddr) {
        let Some(node) = self.nodes.remove(&ip) else {
            return;
        };
        debug!("Node {} left the cluster", ip);
        if let Some(conn) = node.conn {
            tokio::spawn(async move { conn.close_now().await });
        }
        self.awaiting_ready.remove(&ip);
        let was_primary = self.primaries.contains(&ip);
        self.primaries.retain(|primary| *primary != ip);
        self.watchers.remove(&ip);
        if was_primary {
            self.fill_primaries();
        }
    }

    /// Tops the primary set back up to the configured size, expiring
    /// stale down markers first. Candidates are shuffled and stable
    /// partitioned so preferred-DC nodes come first.
    fn fill_primaries(&mut self) {
        let desired = self.config.primaries.max(1);
        let now = Instant::now();
        for node in self.nodes.values_mut() {
            if let Some(down_since) = node.down_since {
                if now.duration_since(down_since) > DOWN_EXPIRY {
                    node.down_since = None;
                }
            }
        }

        while self.primaries.len() < desired {
            let mut candidates: Vec<IpAddr> = self
                .nodes
                .iter()
                .filter(|(ip, node)| {
                    !self.primaries.contains(ip) && node.down_since.is_none()
                })
                .map(|(ip, _)| *ip)
                .collect();
            if candidates.is_empty() {
                // Degraded: keep the coordinator alive and wait for an
                // UP or NEW_NODE event to refill.
                warn!("No candidate node is available to become a primary");
                break;
            }
            order_candidates(
                &mut candidates,
                &self.nodes,
                self.config.prefer_dc.as_deref(),
                &mut rand::thread_rng(),
            );
            let ip = candidates[0];
            debug!("Selecting {} as a new primary", ip);
            self.primaries.push(ip);
            self.spawn_connect(ip);
        }

        self.ensure_watchers();
        self.publish();
    }

    /// Decides whether a connecting primary may start taking traffic.
    ///
    /// The invariant: every statement that is live in the cache must
    /// have been prepared on the connection before it is marked ready,
    /// so that an EXECUTE routed there always finds its id. The
    /// connect task's re-prepare pass races with new flights going
    /// live, so its NodeReady message is a proposal, not a decision:
    /// anything that went live since the pass gets another pass, and a
    /// flight that was dispatched before this connection existed (and
    /// so never targeted it) parks readiness until it lands.
    fn try_finish_ready(&mut self, ip: IpAddr) {
        let Some((conn_weak, prepared)) = self.awaiting_ready.get(&ip).cloned() else {
            return;
        };
        let conn = match self.nodes.get(&ip).and_then(|node| node.conn.clone()) {
            Some(conn) if Weak::ptr_eq(&conn_weak, &Arc::downgrade(&conn)) => conn,
            // The connection the pass ran on is gone; a newer connect
            // task will file its own proposal.
            _ => {
                self.awaiting_ready.remove(&ip);
                return;
            }
        };

        let missing: Vec<String> = self
            .live_cached_statements()
            .into_iter()
            .filter(|cql| !prepared.contains(cql))
            .collect();
        if !missing.is_empty() {
            self.awaiting_ready.remove(&ip);
            let sender = self.internal_sender.clone();
            tokio::spawn(async move {
                let mut prepared = prepared;
                for cql in missing {
                    if let Err(err) = conn.prepare(&cql).await {
                        warn!("Failed to re-prepare statement on {}: {}", ip, err);
                    }
                    prepared.insert(cql);
                }
                let _ = sender
                    .send(WorkerEvent::NodeReady {
                        ip,
                        conn: Arc::downgrade(&conn),
                        prepared,
                    })
                    .await;
            });
            return;
        }

        let parked_on_flight = self.prepared_cache.values().any(|entry| match entry {
            CacheEntry::Pending { targets, .. } => {
                !targets.iter().any(|target| Weak::ptr_eq(target, &conn_weak))
            }
            CacheEntry::Live { .. } => false,
        });
        if parked_on_flight {
            // Re-checked from retry_awaiting_ready when the flight
            // lands; its statement then shows up as missing above.
            return;
        }

        self.awaiting_ready.remove(&ip);
        if let Some(node) = self.nodes.get_mut(&ip) {
            node.ready = true;
            self.publish();
        }
    }

    fn retry_awaiting_ready(&mut self) {
        let parked: Vec<IpAddr> = self.awaiting_ready.keys().copied().collect();
        for ip in parked {
            self.try_finish_ready(ip);
        }
    }

    /// Keeps one event watcher (two when more than one primary is
    /// configured) REGISTERed among the current primaries.
    fn ensure_watchers(&mut self) {
        let desired = if self.config.primaries.max(1) > 1 { 2 } else { 1 };
        self.watchers.retain(|ip| self.primaries.contains(ip));
        for ip in self.primaries.clone() {
            if self.watchers.len() >= desired {
                break;
            }
            if self.watchers.insert(ip) {
                // Watchers without a connection yet register once the
                // connection comes up.
                if let Some(conn) = self.nodes.get(&ip).and_then(|node| node.conn.clone()) {
                    spawn_register(ip, conn);
                }
            }
        }
    }

    fn spawn_connect(&mut self, ip: IpAddr) {
        let addr = {
            let Some(node) = self.nodes.get_mut(&ip) else {
                return;
            };
            node.conn = None;
            node.ready = false;
            node.addr
        };
        self.awaiting_ready.remove(&ip);
        let config = self.config.connection.clone();
        let cached = self.live_cached_statements();
        let sender = self.internal_sender.clone();

        tokio::spawn(async move {
            match open_connection(addr, config).await {
                Ok((conn, error_receiver)) => {
                    let conn = Arc::new(conn);
                    let _ = sender
                        .send(WorkerEvent::NodeConnected {
                            ip,
                            conn: conn.clone(),
                        })
                        .await;

                    // Every live cached statement gets re-prepared
                    // before the node starts taking traffic, so its id
                    // is valid for any future EXECUTE here. Statements
                    // going live concurrently are the worker's problem:
                    // it diffs this set before granting readiness.
                    let mut prepared: HashSet<String> = HashSet::new();
                    for cql in cached {
                        if let Err(err) = conn.prepare(&cql).await {
                            warn!("Failed to re-prepare statement on {}: {}", ip, err);
                        }
                        prepared.insert(cql);
                    }
                    let _ = sender
                        .send(WorkerEvent::NodeReady {
                            ip,
                            conn: Arc::downgrade(&conn),
                            prepared,
                        })
                        .await;

                    match error_receiver.await {
                        Ok(err) => warn!("Connection to {} broke: {}", ip, err),
                        Err(_) => debug!("Connection to {} closed", ip),
                    }
                    let _ = sender.send(WorkerEvent::ConnectionBroken { ip }).await;
                }
                Err(err) => {
                    warn!("Failed to connect to {}: {}", addr, err);
                    let _ = sender.send(WorkerEvent::NodeConnectFailed { ip }).await;
                }
            }
        });
    }

    fn spawn_monitor(&self, ip: IpAddr, error_receiver: ErrorReceiver) {
        let sender = self.internal_sender.clone();
        tokio::spawn(async move {
            match error_receiver.await {
                Ok(err) => warn!("Connection to {} broke: {}", ip, err),
                Err(_) => debug!("Connection to {} closed", ip),
            }
            let _ = sender.send(WorkerEvent::ConnectionBroken { ip }).await;
        });
    }

    fn spawn_expiry(&self, cql: String) -> JoinHandle<()> {
        let sender = self.internal_sender.clone();
        tokio::spawn(async move {
            sleep(PREPARED_CACHE_GRACE).await;
            let _ = sender.send(WorkerEvent::EvictPrepared { cql }).await;
        })
    }

    fn live_cached_statements(&self) -> Vec<String> {
        self.prepared_cache
            .iter()
            .filter_map(|(cql, entry)| match entry {
                CacheEntry::Live { weak, pin, .. } => {
                    (pin.is_some() || weak.upgrade().is_some()).then(|| cql.clone())
                }
                CacheEntry::Pending { .. } => None,
            })
            .collect()
    }

    fn publish(&self) {
        let primaries = self
            .primaries
            .iter()
            .filter_map(|ip| self.nodes.get(ip))
            .map(|node| PrimaryEntry {
                conn: node.conn.clone(),
                ready: node.ready,
            })
            .collect();
        self.routing.store(Arc::new(RoutingSnapshot { primaries }));
    }
}

fn spawn_register(ip: IpAddr, conn: Arc<Connection>) {
    tokio::spawn(async move {
        if let Err(err) = conn.register(EventType::all()).await {
            warn!("Failed to register for events on {}: {}", ip, err);
        }
    });
}

/// Sends PREPARE to every given connection in parallel. All servers
/// return the same id for a given text; the first success becomes the
/// handle and the remaining completions are ignored.
async fn prepare_on_all(conns: Vec<Arc<Connection>>, cql: String) -> PrepareResult {
    let mut pending: FuturesUnordered<_> = conns
        .into_iter()
        .map(|conn| {
            let cql = cql.clone();
            tokio::spawn(async move { conn.prepare(&cql).await })
        })
        .collect();

    let mut last_error: Option<RequestError> = None;
    while let Some(joined) = pending.next().await {
        match joined {
            Ok(Ok(prepared)) => {
                return Ok(Arc::new(PreparedQuery::new(cql, prepared)));
            }
            Ok(Err(err)) => last_error = Some(err),
            Err(_) => {}
        }
    }
    Err(Arc::new(
        last_error.unwrap_or(RequestError::NoPrimaryAvailable),
    ))
}

/// Shuffles the candidates, then stable-partitions them so that nodes
/// in the preferred datacenter come first.
fn order_candidates<R: rand::Rng>(
    candidates: &mut [IpAddr],
    nodes: &HashMap<IpAddr, Node>,
    prefer_dc: Option<&str>,
    rng: &mut R,
) {
    candidates.shuffle(rng);
    if let Some(prefer) = prefer_dc {
        candidates.sort_by_key(|ip| {
            nodes
                .get(ip)
                .map_or(true, |node| node.datacenter.as_deref() != Some(prefer))
        });
    }
}

/// Rotating-cursor primary choice: the first ready entry starting at
/// `start`, else the first connected one, else nothing.
fn choose_primary(flags: &[(bool, bool)], start: usize) -> Option<usize> {
    let count = flags.len();
    if count == 0 {
        return None;
    }
    for offset in 0..count {
        let index = (start + offset) % count;
        let (ready, connected) = flags[index];
        if ready && connected {
            return Some(index);
        }
    }
    for offset in 0..count {
        let index = (start + offset) % count;
        if flags[index].1 {
            return Some(index);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn node(ip: &str, dc: Option<&str>) -> (IpAddr, Node) {
        let ip: IpAddr = ip.parse().unwrap();
        let node = Node::new(SocketAddr::new(ip, 9042), dc.map(str::to_string), None);
        (ip, node)
    }

    fn nodes(entries: &[(&str, Option<&str>)]) -> HashMap<IpAddr, Node> {
        entries.iter().map(|(ip, dc)| node(ip, *dc)).collect()
    }

    #[test]
    fn preferred_dc_nodes_come_first() {
        let nodes = nodes(&[
            ("10.0.0.1", Some("DC1")),
            ("10.0.0.2", Some("DC2")),
            ("10.0.0.3", Some("DC1")),
            ("10.0.0.4", Some("DC2")),
            ("10.0.0.5", Some("DC1")),
        ]);
        let mut candidates: Vec<IpAddr> = nodes.keys().copied().collect();

        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            order_candidates(&mut candidates, &nodes, Some("DC1"), &mut rng);

            let datacenters: Vec<&str> = candidates
                .iter()
                .map(|ip| nodes[ip].datacenter.as_deref().unwrap())
                .collect();
            assert_eq!(&datacenters[..3], &["DC1", "DC1", "DC1"]);
            assert_eq!(&datacenters[3..], &["DC2", "DC2"]);
        }
    }

    #[test]
    fn unknown_dc_sorts_as_not_preferred() {
        let nodes = nodes(&[("10.0.0.1", None), ("10.0.0.2", Some("DC1"))]);
        let mut candidates: Vec<IpAddr> = nodes.keys().copied().collect();
        let mut rng = StdRng::seed_from_u64(7);
        order_candidates(&mut candidates, &nodes, Some("DC1"), &mut rng);
        assert_eq!(
            nodes[&candidates[0]].datacenter.as_deref(),
            Some("DC1")
        );
    }

    #[test]
    fn no_preference_keeps_shuffle_only() {
        let nodes = nodes(&[("10.0.0.1", Some("DC1")), ("10.0.0.2", Some("DC2"))]);
        let mut candidates: Vec<IpAddr> = nodes.keys().copied().collect();
        let mut rng = StdRng::seed_from_u64(0);
        // Must not panic nor drop entries.
        order_candidates(&mut candidates, &nodes, None, &mut rng);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn choose_primary_rotates_over_ready_entries() {
        // (ready, connected)
        let flags = [(true, true), (true, true), (true, true)];
        assert_eq!(choose_primary(&flags, 0), Some(0));
        assert_eq!(choose_primary(&flags, 1), Some(1));
        assert_eq!(choose_primary(&flags, 5), Some(2));
    }

    #[test]
    fn choose_primary_skips_not_ready() {
        let flags = [(false, true), (true, true), (false, false)];
        assert_eq!(choose_primary(&flags, 0), Some(1));
        assert_eq!(choose_primary(&flags, 2), Some(1));
    }

    #[test]
    fn choose_primary_falls_back_to_connected() {
        let flags = [(false, false), (false, true)];
        assert_eq!(choose_primary(&flags, 0), Some(1));
    }

    #[test]
    fn choose_primary_empty_or_disconnected() {
        assert_eq!(choose_primary(&[], 3), None);
        assert_eq!(choose_primary(&[(false, false)], 0), None);
    }
}
