use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::{Buf, Bytes, BytesMut};
use futures::{future::RemoteHandle, FutureExt};
use kestrel_cql::frame::request::batch::BatchStatement;
use kestrel_cql::frame::request::options::{self, Options};
use kestrel_cql::frame::request::query::QueryParameters;
use kestrel_cql::frame::request::{self, SerializableRequest};
use kestrel_cql::frame::response::{result, Response, ResponseOpcode};
use kestrel_cql::frame::{
    self, Compression, FrameParams, ProtocolVersion, SerializedRequest, HEADER_SIZE,
};
use kestrel_cql::Consistency;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::statement_cache::{PreparedInfo, StatementCache, StatementKey};
use crate::authentication::{AuthenticatorProvider, AuthenticatorSession};
use crate::client::pager::Iter;
use crate::errors::QueryError;
use crate::observability::tracing::Tracer;
use crate::statement::batch::Batch;
use crate::statement::marshal_values;
use crate::statement::query::Query;

/// Upper bound of concurrent requests on one connection. Stream ids are a
/// signed byte and negative ids belong to the server.
pub const MAX_STREAMS: usize = 128;

/// Options of a single connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Protocol version spoken for the whole life of the connection.
    pub protocol_version: ProtocolVersion,
    /// Announced in STARTUP.
    pub cql_version: String,
    /// Bounds connecting and stalled reads. Zero disables both bounds.
    pub timeout: Duration,
    /// Compression negotiated in STARTUP.
    pub compression: Option<Compression>,
    /// Used when the node asks for authentication.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Idle time after which TCP keepalive probes are sent.
    pub tcp_keepalive_interval: Option<Duration>,
    /// Number of stream ids. Values outside `1..=128` mean 128.
    pub num_streams: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V2,
            cql_version: options::DEFAULT_CQL_VERSION.to_owned(),
            timeout: Duration::from_millis(600),
            compression: None,
            authenticator: None,
            tcp_keepalive_interval: None,
            num_streams: MAX_STREAMS,
        }
    }
}

impl ConnectionConfig {
    fn stream_count(&self) -> usize {
        if (1..=MAX_STREAMS).contains(&self.num_streams) {
            self.num_streams
        } else {
            MAX_STREAMS
        }
    }
}

// Used to listen for fatal error in connection
pub type ErrorReceiver = oneshot::Receiver<QueryError>;

/// A single multiplexed connection to a node.
///
/// Any number of tasks may send requests concurrently; each receives the
/// response carrying the stream id its request was sent with. At most
/// `num_streams` requests are in flight, further callers wait for a stream
/// id to be released.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    address: String,
    peer_addr: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
    cache: Arc<StatementCache>,
    keyspace: ArcSwap<String>,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    streams: Arc<StreamIdArena>,
    close_notify: Notify,
}

impl RouterHandle {
    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, QueryError> {
        let serialized_request = SerializedRequest::make(request, version, compression, tracing)?;

        let permit = self.streams.acquire().await?;
        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            _permit: permit,
        };

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| broken_connection("request channel closed"))?;

        receiver
            .await
            .map_err(|_| broken_connection("connection closed before the response arrived"))?
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, QueryError>>,
    // Released with the handler, after its stream id went back to the free list.
    _permit: OwnedSemaphorePermit,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// A decoded response and the id of its tracing session, if it was traced.
pub struct QueryResponse {
    /// Decoded body.
    pub response: Response,
    /// Set when the request asked for tracing.
    pub tracing_id: Option<Uuid>,
}

impl QueryResponse {
    /// Turns an ERROR response into an error.
    pub fn into_non_error_response(self) -> Result<Response, QueryError> {
        match self.response {
            Response::Error(err) => Err(err.into()),
            response => Ok(response),
        }
    }
}

fn broken_connection(reason: &str) -> QueryError {
    QueryError::BrokenConnection(reason.to_owned())
}

/// Fixed set of stream ids and the calls waiting on them.
///
/// A caller first takes a permit from `permits`, which guarantees a free id
/// exists by the time the writer assigns one. The permit stays attached to
/// the call until the response is delivered or the connection dies.
struct StreamIdArena {
    permits: Arc<Semaphore>,
    slots: StdMutex<Slots>,
}

struct Slots {
    free: Vec<i8>,
    calls: Vec<Option<ResponseHandler>>,
}

impl StreamIdArena {
    fn new(count: usize) -> Self {
        // Popping from the back hands out the lowest ids first.
        let free = (0..count).rev().map(|id| id as i8).collect();
        let calls = (0..count).map(|_| None).collect();
        StreamIdArena {
            permits: Arc::new(Semaphore::new(count)),
            slots: StdMutex::new(Slots { free, calls }),
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, QueryError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| broken_connection("connection is closed"))
    }

    fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    fn allocate(&self, handler: ResponseHandler) -> Result<i8, ResponseHandler> {
        let mut slots = self.slots.lock().unwrap();
        match slots.free.pop() {
            Some(stream) => {
                slots.calls[stream as usize] = Some(handler);
                Ok(stream)
            }
            None => Err(handler),
        }
    }

    // Compare-and-clear: a second response on the same id finds nothing.
    fn take(&self, stream: i8) -> Option<ResponseHandler> {
        let mut slots = self.slots.lock().unwrap();
        let handler = slots.calls.get_mut(stream as usize)?.take()?;
        slots.free.push(stream);
        Some(handler)
    }

    fn in_flight(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.calls.len() - slots.free.len()
    }

    fn drain(&self) -> Vec<ResponseHandler> {
        self.permits.close();
        let mut slots = self.slots.lock().unwrap();
        let Slots { free, calls } = &mut *slots;
        calls
            .iter_mut()
            .enumerate()
            .filter_map(|(stream, call)| {
                let handler = call.take()?;
                free.push(stream as i8);
                Some(handler)
            })
            .collect()
    }
}

impl Connection {
    /// Connects to `address` (`host:port`) and completes the STARTUP handshake.
    ///
    /// The returned [`ErrorReceiver`] yields the error that broke the
    /// connection, once it breaks.
    pub async fn open(
        address: &str,
        config: ConnectionConfig,
        cache: Arc<StatementCache>,
    ) -> Result<(Self, ErrorReceiver), QueryError> {
        let stream = match with_timeout(config.timeout, TcpStream::connect(address)).await {
            Some(stream) => stream?,
            None => return Err(QueryError::TimeoutError),
        };
        stream.set_nodelay(true)?;
        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }
        let peer_addr = stream.peer_addr()?;

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            streams: Arc::new(StreamIdArena::new(config.stream_count())),
            close_notify: Notify::new(),
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            router_handle.clone(),
            address.to_owned(),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            address: address.to_owned(),
            peer_addr,
            config,
            router_handle,
            cache,
            keyspace: ArcSwap::from_pointee(String::new()),
        };

        connection.startup().await?;
        debug!("[{}] Connection ready", connection.address);

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time after which probes begin ("time" for
        // socket2); the time between probes is fixed below.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 library, which uses the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    async fn startup(&self) -> Result<(), QueryError> {
        let mut startup_options = HashMap::new();
        startup_options.insert(
            Cow::Borrowed(options::CQL_VERSION),
            Cow::Borrowed(self.config.cql_version.as_str()),
        );
        if let Some(compression) = self.config.compression {
            startup_options.insert(
                Cow::Borrowed(options::COMPRESSION),
                Cow::Owned(compression.to_string()),
            );
        }

        let mut response = self
            .send_request(
                &request::Startup {
                    options: startup_options,
                },
                false,
                None,
            )
            .await?
            .response;

        let mut auth_session: Option<Box<dyn AuthenticatorSession>> = None;
        loop {
            let reply = match response {
                Response::Ready => return Ok(()),
                Response::Error(err) => return Err(err.into()),
                Response::Authenticate(authenticate) => {
                    let name = authenticate.authenticator_name;
                    let Some(provider) = self.config.authenticator.as_ref() else {
                        return Err(QueryError::AuthenticationError(format!(
                            "authentication required (using {:?})",
                            name
                        )));
                    };
                    debug!("[{}] Authenticating with {}", self.address, name);
                    let (initial_response, session) = provider
                        .start_authentication_session(&name)
                        .await
                        .map_err(QueryError::AuthenticationError)?;
                    auth_session = Some(session);
                    initial_response
                }
                Response::AuthChallenge(challenge) => {
                    let Some(session) = auth_session.as_mut() else {
                        return Err(QueryError::ProtocolError(
                            "Received AUTH_CHALLENGE before AUTHENTICATE",
                        ));
                    };
                    session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(QueryError::AuthenticationError)?
                }
                Response::AuthSuccess(success) => {
                    if let Some(session) = auth_session.as_mut() {
                        session
                            .success(success.success_message.as_deref())
                            .await
                            .map_err(QueryError::AuthenticationError)?;
                    }
                    return Ok(());
                }
                _ => {
                    return Err(QueryError::ProtocolError(
                        "Unexpected response to STARTUP request",
                    ))
                }
            };

            response = self
                .send_request(&request::AuthResponse { response: reply }, false, None)
                .await?
                .response;
        }
    }

    /// Sends OPTIONS and waits for SUPPORTED.
    pub async fn ping(&self) -> Result<(), QueryError> {
        match self
            .send_request(&Options, false, None)
            .await?
            .into_non_error_response()?
        {
            Response::Supported(_) => Ok(()),
            _ => Err(QueryError::ProtocolError(
                "Unexpected response to OPTIONS request",
            )),
        }
    }

    /// Sends `USE "keyspace"`. Statements prepared afterwards are cached
    /// under the new keyspace.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<(), QueryError> {
        let statement = format!("USE \"{}\"", keyspace);
        let query = request::Query::new(statement, Consistency::Any);
        match self
            .send_request(&query, true, None)
            .await?
            .into_non_error_response()?
        {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                debug!(
                    "[{}] Using keyspace {}",
                    self.address, set_keyspace.keyspace_name
                );
                self.keyspace.store(Arc::new(keyspace.to_owned()));
                Ok(())
            }
            _ => Err(QueryError::ProtocolError(
                "Unexpected response to USE request",
            )),
        }
    }

    /// Sends `statement` as a plain QUERY.
    pub async fn query(
        &self,
        statement: &str,
        parameters: QueryParameters<'_>,
        tracer: Option<&Arc<dyn Tracer>>,
    ) -> Result<QueryResponse, QueryError> {
        let query = request::Query {
            contents: Cow::Borrowed(statement),
            parameters,
        };
        self.send_request(&query, true, tracer).await
    }

    /// Sends an EXECUTE of a statement prepared on this connection.
    pub async fn execute(
        &self,
        prepared: &PreparedInfo,
        parameters: QueryParameters<'_>,
        tracer: Option<&Arc<dyn Tracer>>,
    ) -> Result<QueryResponse, QueryError> {
        let execute = request::Execute {
            id: prepared.id.clone(),
            parameters,
        };
        self.send_request(&execute, true, tracer).await
    }

    /// Sends a PREPARE, bypassing the statement cache.
    pub async fn prepare(
        &self,
        statement: &str,
        tracer: Option<&Arc<dyn Tracer>>,
    ) -> Result<PreparedInfo, QueryError> {
        let response = self
            .send_request(&request::Prepare { query: statement }, true, tracer)
            .await?
            .into_non_error_response()?;
        match response {
            Response::Result(result::Result::Prepared(prepared)) => Ok(PreparedInfo {
                id: prepared.id,
                args: prepared.prepared_metadata.col_specs,
                rvals: prepared.result_metadata.col_specs,
            }),
            _ => Err(QueryError::ProtocolError(
                "PREPARE: Unexpected server response",
            )),
        }
    }

    /// Prepares `statement` through the statement cache, so that it is sent
    /// to this node at most once per keyspace.
    pub async fn prepare_statement(
        &self,
        statement: &str,
        tracer: Option<&Arc<dyn Tracer>>,
    ) -> Result<Arc<PreparedInfo>, QueryError> {
        self.cache
            .get_or_prepare(self.statement_key(statement), || async {
                self.prepare(statement, tracer).await.map(Arc::new)
            })
            .await
    }

    fn statement_key(&self, statement: &str) -> StatementKey {
        StatementKey {
            address: self.address.clone(),
            keyspace: self.keyspace.load().to_string(),
            statement: statement.to_owned(),
        }
    }

    /// Runs `query` on this connection and returns the first page of its result.
    ///
    /// DML statements are prepared and executed with their bound values;
    /// anything else is sent as plain text. When the node no longer knows
    /// the prepared id, the statement is prepared again and resent once.
    /// Callers hitting the same stale id share a single new PREPARE.
    pub async fn execute_query(self: &Arc<Self>, query: &Query) -> Result<Iter, QueryError> {
        let mut reprepared = false;
        loop {
            let prepared = if query.should_prepare() {
                Some(
                    self.prepare_statement(&query.stmt, query.tracer.as_ref())
                        .await?,
                )
            } else {
                None
            };
            match self.execute_query_once(query, prepared.as_deref()).await {
                Err(err) if !reprepared && err.unprepared_id().is_some() => {
                    if let Some(prepared) = &prepared {
                        self.cache
                            .remove_prepared(&self.statement_key(&query.stmt), prepared);
                    }
                    debug!(
                        "[{}] Statement {:?} is no longer prepared, preparing it again",
                        self.address, query.stmt
                    );
                    reprepared = true;
                }
                other => return other,
            }
        }
    }

    async fn execute_query_once(
        self: &Arc<Self>,
        query: &Query,
        prepared: Option<&PreparedInfo>,
    ) -> Result<Iter, QueryError> {
        let tracer = query.tracer.as_ref();
        let paged = self.config.protocol_version != ProtocolVersion::V1;
        let mut parameters = QueryParameters {
            consistency: query.consistency,
            page_size: (paged && query.page_size > 0).then_some(query.page_size),
            paging_state: query.paging_state.clone().filter(|_| paged),
            values: Cow::Borrowed(&[]),
        };

        let response = match prepared {
            Some(info) => {
                let values = query.bound_values(info)?;
                parameters.values = Cow::Owned(marshal_values(&values, &info.args)?);
                self.execute(info, parameters, tracer).await?
            }
            None => self.query(&query.stmt, parameters, tracer).await?,
        };

        match response.into_non_error_response()? {
            Response::Result(result::Result::Rows(rows)) => {
                Ok(Iter::new(rows, query, Arc::clone(self)))
            }
            Response::Result(
                result::Result::Void
                | result::Result::SetKeyspace(_)
                | result::Result::SchemaChange(_),
            ) => Ok(Iter::empty()),
            _ => Err(QueryError::ProtocolError(
                "Unexpected response to QUERY/EXECUTE request",
            )),
        }
    }

    /// Sends `batch` as a single BATCH request.
    ///
    /// Entries with bound values are prepared first. If the node reports one
    /// of their ids as unknown, that statement is prepared again and the
    /// batch resent once.
    pub async fn execute_batch(&self, batch: &Batch) -> Result<(), QueryError> {
        if self.config.protocol_version == ProtocolVersion::V1 {
            return Err(QueryError::Unsupported(
                "BATCH requires protocol version 2".to_owned(),
            ));
        }

        let mut reprepared = false;
        loop {
            let mut prepared_ids: HashMap<Bytes, (&str, Arc<PreparedInfo>)> = HashMap::new();
            let mut statements = Vec::with_capacity(batch.entries.len());
            for entry in &batch.entries {
                if entry.is_prepared() {
                    let info = self.prepare_statement(&entry.stmt, None).await?;
                    let values = entry.bound_values(&info)?;
                    let values = marshal_values(&values, &info.args)?;
                    statements.push(BatchStatement::Prepared {
                        id: info.id.clone(),
                        values,
                    });
                    prepared_ids.insert(info.id.clone(), (entry.stmt.as_str(), info));
                } else {
                    statements.push(BatchStatement::Query {
                        text: Cow::Borrowed(entry.stmt.as_str()),
                        values: Vec::new(),
                    });
                }
            }

            let request = request::Batch {
                batch_type: batch.batch_type,
                statements,
                consistency: batch.consistency,
            };
            let err = match self
                .send_request(&request, true, None)
                .await?
                .into_non_error_response()
            {
                Ok(Response::Result(result::Result::Void | result::Result::Rows(_))) => {
                    return Ok(())
                }
                Ok(_) => {
                    return Err(QueryError::ProtocolError(
                        "Unexpected response to BATCH request",
                    ))
                }
                Err(err) => err,
            };

            let stale = err.unprepared_id().and_then(|id| prepared_ids.get(id));
            match stale {
                Some((statement, info)) if !reprepared => {
                    self.cache
                        .remove_prepared(&self.statement_key(statement), info);
                    debug!(
                        "[{}] Batch statement {:?} is no longer prepared, preparing it again",
                        self.address, statement
                    );
                    reprepared = true;
                }
                _ => return Err(err),
            }
        }
    }

    /// Sends any request and decodes its response. A response carrying a
    /// tracing id is reported to `tracer` before returning.
    pub async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracer: Option<&Arc<dyn Tracer>>,
    ) -> Result<QueryResponse, QueryError> {
        if self.is_closed() {
            return Err(broken_connection("connection is closed"));
        }
        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        let task_response = self
            .router_handle
            .send_request(
                request,
                self.config.protocol_version,
                compression,
                tracer.is_some(),
            )
            .await?;

        let response = Self::parse_response(
            task_response,
            self.config.compression,
            self.config.protocol_version,
        )?;

        if let (Some(tracer), Some(tracing_id)) = (tracer, response.tracing_id) {
            tracer.trace(tracing_id).await;
        }

        Ok(response)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
        version: ProtocolVersion,
    ) -> Result<QueryResponse, QueryError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        let response = Response::deserialize(
            version,
            task_response.opcode,
            &mut &*body_with_ext.body,
        )?;

        Ok(QueryResponse {
            response,
            tracing_id: body_with_ext.trace_id,
        })
    }

    async fn router(
        config: ConnectionConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<QueryError>,
        router_handle: Arc<RouterHandle>,
        address: String,
    ) {
        let (read_half, write_half) = split(stream);
        let streams = &router_handle.streams;

        let r = Self::reader(
            read_half,
            streams,
            &config,
            router_handle.submit_channel.downgrade(),
            &address,
        );
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), streams, receiver);
        let c = async {
            router_handle.close_notify.notified().await;
            Err::<(), _>(broken_connection("connection closed by the client"))
        };

        let error = match futures::try_join!(r, w, c) {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };
        debug!("[{}] Connection broken: {}", address, error);

        // Respond to all pending requests with the error
        for handler in streams.drain() {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        streams: &StreamIdArena,
        config: &ConnectionConfig,
        ping_channel: mpsc::WeakSender<Task>,
        address: &str,
    ) -> Result<(), QueryError> {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            let (params, opcode, body) =
                Self::read_frame(&mut read_half, &mut buf, streams, config, &ping_channel, address)
                    .await?;

            if params.stream < 0 {
                // Negative stream ids carry server pushed events, and we
                // never register for any.
                trace!(
                    "[{}] Ignoring frame on server stream {}",
                    address,
                    params.stream
                );
                continue;
            }

            match streams.take(params.stream) {
                Some(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(TaskResponse {
                        params,
                        opcode,
                        body,
                    }));
                }
                None => {
                    debug!(
                        "[{}] Received response with unexpected StreamId {}",
                        address, params.stream
                    );
                }
            }
        }
    }

    // Reads one frame. When the read deadline passes, bytes received since
    // the previous deadline extend it; a frame that has not started yet
    // gets one OPTIONS ping if requests are waiting; any other stall is a
    // timeout.
    async fn read_frame(
        read_half: &mut (impl AsyncRead + Unpin),
        buf: &mut BytesMut,
        streams: &StreamIdArena,
        config: &ConnectionConfig,
        ping_channel: &mpsc::WeakSender<Task>,
        address: &str,
    ) -> Result<(FrameParams, ResponseOpcode, Bytes), QueryError> {
        let mut header = None;
        let mut last = 0;
        let mut pinged = false;

        loop {
            if header.is_none() && buf.len() >= HEADER_SIZE {
                let mut raw_header = [0u8; HEADER_SIZE];
                raw_header.copy_from_slice(&buf[..HEADER_SIZE]);
                header = Some(frame::parse_response_header(
                    &raw_header,
                    config.protocol_version,
                )?);
                buf.advance(HEADER_SIZE);
            }
            if let Some((params, opcode, length)) = header {
                if buf.len() >= length {
                    return Ok((params, opcode, buf.split_to(length).freeze()));
                }
                buf.reserve(length - buf.len());
            }

            let received = buf.len() + if header.is_some() { HEADER_SIZE } else { 0 };
            let n = match with_timeout(config.timeout, read_half.read_buf(buf)).await {
                Some(read) => read?,
                None if received > last => {
                    last = received;
                    continue;
                }
                None if received == 0 && !pinged => {
                    if streams.in_flight() > 0 {
                        Self::send_ping(streams, ping_channel, config, address);
                        pinged = true;
                    }
                    continue;
                }
                None => {
                    warn!("[{}] Read stalled, closing connection", address);
                    return Err(QueryError::TimeoutError);
                }
            };
            if n == 0 {
                return Err(broken_connection("connection closed by the server"));
            }
        }
    }

    fn send_ping(
        streams: &StreamIdArena,
        ping_channel: &mpsc::WeakSender<Task>,
        config: &ConnectionConfig,
        address: &str,
    ) {
        let (Some(channel), Some(permit)) = (ping_channel.upgrade(), streams.try_acquire()) else {
            return;
        };
        let serialized_request =
            match SerializedRequest::make(&Options, config.protocol_version, None, false) {
                Ok(request) => request,
                Err(err) => {
                    error!("[{}] Could not serialize OPTIONS: {}", address, err);
                    return;
                }
            };
        trace!("[{}] No data received, pinging", address);
        // The response is ignored, it only proves that the socket is alive.
        let (response_sender, _) = oneshot::channel();
        let _ = channel.try_send(Task {
            serialized_request,
            response_handler: ResponseHandler {
                response_sender,
                _permit: permit,
            },
        });
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        streams: &StreamIdArena,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), QueryError> {
        // When the Connection object is dropped, the sender half
        // of the channel will be dropped, this task will return an error
        // and the whole worker will be stopped
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let stream_id = match streams.allocate(task.response_handler) {
                    Ok(stream_id) => stream_id,
                    Err(handler) => {
                        error!("Could not allocate stream id");
                        let _ = handler
                            .response_sender
                            .send(Err(broken_connection("unable to allocate stream id")));
                        break;
                    }
                };
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half.write_all(req_data).await?;
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half.flush().await?;
        }

        Ok(())
    }

    /// Address this connection was opened to, as given to [`Connection::open`].
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Resolved address of the node.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Keyspace set by the last successful [`Connection::use_keyspace`].
    pub fn keyspace(&self) -> String {
        self.keyspace.load().to_string()
    }

    /// Protocol version of the connection.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.config.protocol_version
    }

    /// Number of stream ids not taken by a request.
    pub fn available_streams(&self) -> usize {
        self.router_handle.streams.permits.available_permits()
    }

    /// Closes the connection. Requests in flight fail with a broken
    /// connection error. Calling it again has no effect.
    pub fn close(&self) {
        if self.router_handle.streams.permits.is_closed() {
            return;
        }
        self.router_handle.streams.permits.close();
        self.router_handle.close_notify.notify_one();
    }

    /// Whether the connection was closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.router_handle.streams.permits.is_closed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("peer_addr", &self.peer_addr)
            .field("keyspace", &self.keyspace())
            .finish()
    }
}

// A zero duration means no bound. Returns `None` when the bound passed.
async fn with_timeout<F: std::future::Future>(duration: Duration, future: F) -> Option<F::Output> {
    if duration.is_zero() {
        Some(future.await)
    } else {
        tokio::time::timeout(duration, future).await.ok()
    }
}
