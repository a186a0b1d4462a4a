use crate::errors::{
    AuthenticationError, BrokenConnectionError, ConnectionError, RequestError,
};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::RemoteHandle;
use priam_cql::frame::request::query::QueryParameters;
use priam_cql::frame::request::{self, SerializableRequest};
use priam_cql::frame::response::error::Error;
use priam_cql::frame::response::event::Event;
use priam_cql::frame::response::result::{CqlResult, Prepared, Rows};
use priam_cql::frame::response::{Response, ResponseOpcode, Supported};
use priam_cql::frame::server_event_type::EventType;
use priam_cql::frame::types::Consistency;
use priam_cql::frame::{self, Compression, ProtocolVersion, SerializedRequest};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, split};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";
const DEFAULT_CQL_VERSION: &str = "3.0.5";

// User traffic runs on stream ids 1..=127. Id 0 belongs to the server
// and -1 (0xFF) is the event stream.
const STREAM_ID_COUNT: usize = 127;

/// Configuration a single connection is opened with.
#[derive(Clone, Default)]
pub(crate) struct ConnectionConfig {
    pub(crate) version: ProtocolVersion,
    pub(crate) compression: Option<Compression>,
    pub(crate) credentials: Option<(String, String)>,
    pub(crate) keyspace: Option<String>,
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
}

// Used to listen for a fatal error on a connection.
pub(crate) type ErrorReceiver = oneshot::Receiver<BrokenConnectionError>;

type ResponseHandler = oneshot::Sender<Result<TaskResponse, RequestError>>;

enum Task {
    Request {
        serialized: SerializedRequest,
        response_sender: ResponseHandler,
    },
    Close {
        when_idle: bool,
        done: oneshot::Sender<()>,
    },
}

struct TaskResponse {
    flags: u8,
    opcode: ResponseOpcode,
    body: Bytes,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum CloseMode {
    WhenIdle,
    Now,
}

enum WriterEnd {
    CloseRequested,
    CloseNow,
    ChannelClosed,
}

/// One TCP connection to one node, multiplexing up to 127 in-flight
/// requests over stream ids.
///
/// A router task owns the socket; it is split into a reader and a
/// writer future sharing the in-flight table. The `Connection` object
/// itself only holds a submit channel, so it is cheap to share.
pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    submit: mpsc::Sender<Task>,
    // Counts free stream ids; the writer parks on it when all 127 are
    // busy. Closing it aborts parked requests on close_now.
    stream_permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl Connection {
    /// Opens the TCP stream and spawns the router. No frames are
    /// exchanged yet; [Connection::startup] drives the handshake.
    pub(crate) async fn new(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let (submit, receiver) = mpsc::channel(128);
        let (error_sender, error_receiver) = oneshot::channel();
        let stream_permits = Arc::new(Semaphore::new(STREAM_ID_COUNT));

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            stream_permits.clone(),
        )
        .remote_handle();
        tokio::spawn(task);

        let connection = Connection {
            _worker_handle,
            connect_address: addr,
            config,
            submit,
            stream_permits,
            closed: AtomicBool::new(false),
        };

        Ok((connection, error_receiver))
    }

    pub(crate) fn connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Sends STARTUP and walks the connection through the negotiation:
    /// READY, or AUTHENTICATE followed by the credentials exchange.
    pub(crate) async fn startup(&self) -> Result<(), ConnectionError> {
        let mut options = HashMap::from([(
            String::from("CQL_VERSION"),
            String::from(DEFAULT_CQL_VERSION),
        )]);
        if let Some(compression) = self.config.compression {
            options.insert(String::from("COMPRESSION"), compression.as_str().to_string());
        }

        // The STARTUP frame itself is never compressed.
        let response = self.send_request(&request::Startup { options }, false).await?;
        match response {
            Response::Ready => Ok(()),
            Response::Authenticate(authenticate) => {
                self.authenticate(&authenticate.authenticator_name).await
            }
            Response::Error(Error { error, reason }) => {
                Err(RequestError::DbError(error, reason).into())
            }
            other => Err(RequestError::UnexpectedResponse(other.kind()).into()),
        }
    }

    async fn authenticate(&self, authenticator: &str) -> Result<(), ConnectionError> {
        if authenticator != PASSWORD_AUTHENTICATOR {
            return Err(
                AuthenticationError::UnsupportedAuthenticator(authenticator.to_string()).into(),
            );
        }
        let (username, password) = self
            .config
            .credentials
            .clone()
            .ok_or(AuthenticationError::MissingCredentials)?;

        // v1 sends plaintext CREDENTIALS; v2 replaced them with a SASL
        // PLAIN exchange.
        let response = match self.config.version {
            ProtocolVersion::V1 => {
                self.send_request(&request::Credentials { username, password }, false)
                    .await?
            }
            ProtocolVersion::V2 => {
                self.send_request(&request::AuthResponse::plain(&username, &password), false)
                    .await?
            }
        };
        match response {
            Response::Ready | Response::AuthSuccess(_) => Ok(()),
            Response::Error(Error { error, reason }) => {
                Err(RequestError::DbError(error, reason).into())
            }
            other => Err(RequestError::UnexpectedResponse(other.kind()).into()),
        }
    }

    pub(crate) async fn use_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError> {
        let parameters = QueryParameters {
            consistency: Consistency::One,
            ..Default::default()
        };
        match self.query(&format!("USE {}", keyspace), parameters).await? {
            CqlResult::SetKeyspace(set_keyspace) => {
                if !set_keyspace.keyspace_name.eq_ignore_ascii_case(keyspace) {
                    return Err(ConnectionError::KeyspaceMismatch {
                        expected: keyspace.to_string(),
                        got: set_keyspace.keyspace_name,
                    });
                }
                Ok(())
            }
            other => Err(RequestError::ResultKindMismatch {
                expected: "set_keyspace",
                got: other.kind(),
            }
            .into()),
        }
    }

    pub(crate) async fn query(
        &self,
        contents: &str,
        parameters: QueryParameters,
    ) -> Result<CqlResult, RequestError> {
        let response = self
            .send_request(&request::Query { contents, parameters }, true)
            .await?;
        Self::expect_result(response)
    }

    pub(crate) async fn query_rows(
        &self,
        contents: &str,
        parameters: QueryParameters,
    ) -> Result<Rows, RequestError> {
        match self.query(contents, parameters).await? {
            CqlResult::Rows(rows) => Ok(rows),
            other => Err(RequestError::ResultKindMismatch {
                expected: "rows",
                got: other.kind(),
            }),
        }
    }

    pub(crate) async fn prepare(&self, query: &str) -> Result<Prepared, RequestError> {
        let response = self.send_request(&request::Prepare { query }, true).await?;
        match Self::expect_result(response)? {
            CqlResult::Prepared(prepared) => Ok(prepared),
            other => Err(RequestError::ResultKindMismatch {
                expected: "prepared",
                got: other.kind(),
            }),
        }
    }

    pub(crate) async fn execute(
        &self,
        id: &[u8],
        values: Vec<Option<Vec<u8>>>,
        parameters: QueryParameters,
    ) -> Result<CqlResult, RequestError> {
        let response = self
            .send_request(
                &request::Execute {
                    id,
                    values,
                    parameters,
                },
                true,
            )
            .await?;
        Self::expect_result(response)
    }

    pub(crate) async fn register(
        &self,
        event_types: Vec<EventType>,
    ) -> Result<(), RequestError> {
        let response = self
            .send_request(
                &request::Register {
                    event_types_to_register_for: event_types,
                },
                true,
            )
            .await?;
        match response {
            Response::Ready => Ok(()),
            Response::Error(Error { error, reason }) => Err(RequestError::DbError(error, reason)),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    pub(crate) async fn options(&self) -> Result<Supported, RequestError> {
        let response = self.send_request(&request::Options, true).await?;
        match response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(Error { error, reason }) => Err(RequestError::DbError(error, reason)),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    /// Refuses new requests and resolves once every in-flight request
    /// has received its response.
    pub(crate) async fn close_when_idle(&self) {
        self.close(true).await
    }

    /// Fails all in-flight and parked requests immediately.
    pub(crate) async fn close_now(&self) {
        self.close(false).await
    }

    async fn close(&self, when_idle: bool) {
        self.closed.store(true, Ordering::Relaxed);
        if !when_idle {
            // Abort requests parked on stream-id exhaustion; the writer
            // fails them and moves on to the Close task below.
            self.stream_permits.close();
        }
        let (done, ack) = oneshot::channel();
        if self
            .submit
            .send(Task::Close { when_idle, done })
            .await
            .is_err()
        {
            // Router already gone; nothing left to drain.
            return;
        }
        let _ = ack.await;
    }

    fn expect_result(response: Response) -> Result<CqlResult, RequestError> {
        match response {
            Response::Result(result) => Ok(result),
            Response::Error(Error { error, reason }) => Err(RequestError::DbError(error, reason)),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
    ) -> Result<Response, RequestError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RequestError::ConnectionClosed);
        }
        let compression = if compress { self.config.compression } else { None };
        let serialized = SerializedRequest::make(request, self.config.version, compression)?;

        let (response_sender, receiver) = oneshot::channel();
        self.submit
            .send(Task::Request {
                serialized,
                response_sender,
            })
            .await
            .map_err(|_| RequestError::ConnectionClosed)?;

        let task_response = receiver.await.map_err(|_| RequestError::ConnectionClosed)??;

        let body = frame::parse_response_body(
            task_response.flags,
            self.config.compression,
            task_response.body,
        )?;
        let response = Response::deserialize(self.config.version, task_response.opcode, &mut &*body)?;
        Ok(response)
    }

    async fn router(
        config: ConnectionConfig,
        stream: TcpStream,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<BrokenConnectionError>,
        stream_permits: Arc<Semaphore>,
    ) {
        let (read_half, write_half) = split(stream);

        // Reader and writer run within the same task and never hold
        // the lock across an await point, so this mutex sees no
        // contention; it only satisfies the borrow checker.
        let in_flight = StdMutex::new(InFlight::new());

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &in_flight,
            &stream_permits,
            &config,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &in_flight,
            &stream_permits,
            receiver,
        );

        tokio::pin!(r);

        let broken: Option<BrokenConnectionError> = tokio::select! {
            res = &mut r => res.err(),
            res = w => match res {
                Err(err) => Some(err),
                Ok(WriterEnd::CloseNow) => None,
                Ok(WriterEnd::CloseRequested) => {
                    let drained = in_flight.lock().unwrap().handlers.is_empty();
                    if drained {
                        None
                    } else {
                        (&mut r).await.err()
                    }
                }
                Ok(WriterEnd::ChannelClosed) => {
                    // The owning handle is gone, so this future is
                    // about to be dropped along with it.
                    std::future::pending::<Option<BrokenConnectionError>>().await
                }
            },
        };

        // Respond to all pending requests with a uniform error.
        let (handlers, close_ack) = {
            let mut state = in_flight.lock().unwrap();
            (std::mem::take(&mut state.handlers), state.close_ack.take())
        };
        for (_, handler) in handlers {
            let _ = handler.send(Err(RequestError::ConnectionClosed));
        }
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
        if let Some(err) = broken {
            debug!("Connection broken: {}", err);
            // If someone is listening for connection errors, notify them.
            let _ = error_sender.send(err);
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        in_flight: &StdMutex<InFlight>,
        stream_permits: &Semaphore,
        config: &ConnectionConfig,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) =
                frame::read_response_frame(&mut read_half, config.version).await?;

            match params.stream {
                -1 => {
                    Self::handle_event(params.flags, opcode, body, config).await?;
                    continue;
                }
                stream if stream < 0 => {
                    // Negative streams other than the event stream are
                    // reserved; nothing to correlate them with.
                    continue;
                }
                0 => {
                    return Err(Self::server_initiated_error(
                        params.flags,
                        opcode,
                        body,
                        config,
                    ));
                }
                _ => {}
            }

            let handler = {
                let mut state = in_flight.lock().unwrap();
                state.streams.free(params.stream);
                state.handlers.remove(&params.stream)
            };
            stream_permits.add_permits(1);

            match handler {
                Some(handler) => {
                    // The caller may have been cancelled meanwhile; its
                    // stream id was still occupied until this response
                    // arrived, and the result is simply discarded.
                    let _ = handler.send(Ok(TaskResponse {
                        flags: params.flags,
                        opcode,
                        body,
                    }));
                }
                None => {
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
            }

            let state = in_flight.lock().unwrap();
            if state.closing == Some(CloseMode::WhenIdle) && state.handlers.is_empty() {
                return Ok(());
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        in_flight: &StdMutex<InFlight>,
        stream_permits: &Semaphore,
        mut receiver: mpsc::Receiver<Task>,
    ) -> Result<WriterEnd, BrokenConnectionError> {
        while let Some(task) = receiver.recv().await {
            match task {
                Task::Request {
                    mut serialized,
                    response_sender,
                } => {
                    // Parks here when all 127 stream ids are in use.
                    // The semaphore is fair, so parked requests resume
                    // in submission order, one per released id.
                    let permit = match stream_permits.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            // close_now aborted this parked request.
                            let _ = response_sender.send(Err(RequestError::ConnectionClosed));
                            continue;
                        }
                    };
                    permit.forget();

                    let stream_id = {
                        let mut state = in_flight.lock().unwrap();
                        let id = state
                            .streams
                            .allocate()
                            .expect("a permit guarantees a free stream id");
                        let prev = state.handlers.insert(id, response_sender);
                        assert!(prev.is_none());
                        id
                    };

                    serialized.set_stream(stream_id);
                    write_half
                        .write_all(serialized.get_data())
                        .await
                        .map_err(BrokenConnectionError::Write)?;
                    write_half
                        .flush()
                        .await
                        .map_err(BrokenConnectionError::Write)?;
                }
                Task::Close { when_idle, done } => {
                    let mut state = in_flight.lock().unwrap();
                    state.close_ack = Some(done);
                    if when_idle {
                        state.closing = Some(CloseMode::WhenIdle);
                        return Ok(WriterEnd::CloseRequested);
                    } else {
                        state.closing = Some(CloseMode::Now);
                        return Ok(WriterEnd::CloseNow);
                    }
                }
            }
        }

        Ok(WriterEnd::ChannelClosed)
    }

    async fn handle_event(
        flags: u8,
        opcode: ResponseOpcode,
        body: Bytes,
        config: &ConnectionConfig,
    ) -> Result<(), BrokenConnectionError> {
        if opcode != ResponseOpcode::Event {
            warn!(
                "Received a non-EVENT frame on the event stream (opcode {:?}), ignoring",
                opcode
            );
            return Ok(());
        }
        let body = frame::parse_response_body(flags, config.compression, body)?;
        let event = Event::deserialize(&mut &*body).map_err(BrokenConnectionError::Event)?;
        if let Some(event_sender) = &config.event_sender {
            let _ = event_sender.send(event).await;
        }
        Ok(())
    }

    // Stream 0 is reserved for errors the server raises on its own
    // behalf; one of those means the connection is beyond saving.
    fn server_initiated_error(
        flags: u8,
        opcode: ResponseOpcode,
        body: Bytes,
        config: &ConnectionConfig,
    ) -> BrokenConnectionError {
        if opcode == ResponseOpcode::Error {
            if let Ok(body) = frame::parse_response_body(flags, config.compression, body) {
                if let Ok(error) = Error::deserialize(&mut &*body) {
                    return BrokenConnectionError::ServerError {
                        error: error.error,
                        reason: error.reason,
                    };
                }
            }
        }
        BrokenConnectionError::UnexpectedStreamId(0)
    }
}

struct InFlight {
    streams: StreamIdSet,
    handlers: HashMap<i8, ResponseHandler>,
    closing: Option<CloseMode>,
    close_ack: Option<oneshot::Sender<()>>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            streams: StreamIdSet::new(),
            handlers: HashMap::new(),
            closing: None,
            close_ack: None,
        }
    }
}

// The 128-bit occupancy map of stream ids 0..=127. Id 0 is permanently
// reserved for the server, so user traffic gets 1..=127.
struct StreamIdSet {
    used: [u64; 2],
}

impl StreamIdSet {
    fn new() -> Self {
        Self { used: [1, 0] }
    }

    fn allocate(&mut self) -> Option<i8> {
        for (block_id, block) in self.used.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                return Some((block_id * 64 + off as usize) as i8);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i8) {
        let id = stream_id as usize;
        self.used[id / 64] &= !(1 << (id % 64));
    }
}

/// Opens a connection and performs its setup on the CQL level: the
/// STARTUP handshake, authentication if demanded, and the configured
/// `USE` keyspace.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (connection, error_receiver) = Connection::new(addr, config).await?;

    connection.startup().await?;

    if let Some(keyspace) = connection.config.keyspace.clone() {
        connection.use_keyspace(&keyspace).await?;
    }

    Ok((connection, error_receiver))
}
