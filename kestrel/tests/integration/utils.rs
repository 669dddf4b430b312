//! An in-process node speaking just enough of protocol version 2 to drive
//! the client end to end.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::RemoteHandle;
use futures::FutureExt;
use kestrel::authentication::PASSWORD_AUTHENTICATOR;
use kestrel::errors::DbError;
use kestrel::frame::ColumnType;
use kestrel::value::Marshal;
use kestrel::{BatchType, Consistency, Session, SessionBuilder};
use kestrel_cql::frame::request::batch::{Batch, BatchStatement};
use kestrel_cql::frame::request::execute::Execute;
use kestrel_cql::frame::request::prepare::PrepareOwned;
use kestrel_cql::frame::request::query::{Query, QueryParameters};
use kestrel_cql::frame::request::startup::Startup;
use kestrel_cql::frame::request::{DeserializableRequest, RequestOpcode};
use kestrel_cql::frame::response::ResponseOpcode;
use kestrel_cql::frame::{types, ProtocolVersion, HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

const FLAG_TRACING: u8 = 0x02;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// A request as the node decoded it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Received {
    Startup(HashMap<String, String>),
    AuthResponse(Option<Vec<u8>>),
    Options,
    Query {
        text: String,
        params: Params,
    },
    Prepare(String),
    Execute {
        id: Bytes,
        params: Params,
    },
    Batch {
        batch_type: BatchType,
        consistency: Consistency,
        statements: Vec<BatchStatement<'static>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Params {
    pub(crate) consistency: Consistency,
    pub(crate) page_size: Option<i32>,
    pub(crate) paging_state: Option<Bytes>,
    pub(crate) values: Vec<Option<Bytes>>,
}

impl From<QueryParameters<'_>> for Params {
    fn from(params: QueryParameters<'_>) -> Self {
        Params {
            consistency: params.consistency,
            page_size: params.page_size,
            paging_state: params.paging_state,
            values: params.values.into_owned(),
        }
    }
}

/// Rows the node returns for a statement, and the bind markers it reports
/// when the statement is prepared.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    args: Option<Vec<ColumnType>>,
    columns: Vec<(String, ColumnType)>,
    rows: Vec<Vec<Option<Bytes>>>,
    delay: Duration,
}

impl Table {
    pub(crate) fn new(columns: &[(&str, ColumnType)]) -> Self {
        Table {
            columns: columns
                .iter()
                .map(|(name, typ)| (name.to_string(), typ.clone()))
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn args(mut self, args: &[ColumnType]) -> Self {
        self.args = Some(args.to_vec());
        self
    }

    pub(crate) fn row(mut self, values: &[&dyn Marshal]) -> Self {
        assert_eq!(values.len(), self.columns.len());
        let row = values
            .iter()
            .zip(&self.columns)
            .map(|(value, (_, typ))| value.marshal(typ).unwrap().map(Bytes::from))
            .collect();
        self.rows.push(row);
        self
    }

    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

// Bind markers of a statement nobody described: one int per `?`.
fn default_args(statement: &str) -> Vec<ColumnType> {
    statement
        .chars()
        .filter(|&c| c == '?')
        .map(|_| ColumnType::Int)
        .collect()
}

struct Reply {
    opcode: ResponseOpcode,
    body: Bytes,
    delay: Duration,
}

impl Reply {
    fn new(opcode: ResponseOpcode, body: BytesMut) -> Self {
        Reply {
            opcode,
            body: body.freeze(),
            delay: Duration::ZERO,
        }
    }

    fn ready() -> Self {
        Reply::new(ResponseOpcode::Ready, BytesMut::new())
    }

    fn authenticate(name: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_string(name, &mut buf).unwrap();
        Reply::new(ResponseOpcode::Authenticate, buf)
    }

    fn auth_success() -> Self {
        let mut buf = BytesMut::new();
        types::write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        Reply::new(ResponseOpcode::AuthSuccess, buf)
    }

    fn supported() -> Self {
        let mut options = HashMap::new();
        options.insert("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()]);
        let mut buf = BytesMut::new();
        types::write_string_multimap(&options, &mut buf).unwrap();
        Reply::new(ResponseOpcode::Supported, buf)
    }

    fn error(error: &DbError, message: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(error.code(), &mut buf);
        types::write_string(message, &mut buf).unwrap();
        match error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, &mut buf);
                types::write_int(*required, &mut buf);
                types::write_int(*alive, &mut buf);
            }
            DbError::Unprepared { statement_id } => {
                types::write_short_bytes(statement_id, &mut buf).unwrap();
            }
            _ => {}
        }
        Reply::new(ResponseOpcode::Error, buf)
    }

    fn void() -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0001, &mut buf);
        Reply::new(ResponseOpcode::Result, buf)
    }

    fn set_keyspace(keyspace: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0003, &mut buf);
        types::write_string(keyspace, &mut buf).unwrap();
        Reply::new(ResponseOpcode::Result, buf)
    }

    fn prepared(id: &[u8], args: &[ColumnType], columns: &[(String, ColumnType)]) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0004, &mut buf);
        types::write_short_bytes(id, &mut buf).unwrap();
        let args = args
            .iter()
            .enumerate()
            .map(|(i, typ)| (format!("arg{}", i), typ.clone()))
            .collect::<Vec<_>>();
        write_metadata(&args, None, &mut buf);
        write_metadata(columns, None, &mut buf);
        Reply::new(ResponseOpcode::Result, buf)
    }

    fn rows(table: &Table, params: &Params) -> Self {
        let start = params.paging_state.as_ref().map_or(0, |state| {
            u32::from_be_bytes(state[..4].try_into().unwrap()) as usize
        });
        let end = match params.page_size {
            Some(size) if size > 0 => (start + size as usize).min(table.rows.len()),
            _ => table.rows.len(),
        };
        let paging_state =
            (end < table.rows.len()).then(|| Bytes::copy_from_slice(&(end as u32).to_be_bytes()));

        let mut buf = BytesMut::new();
        types::write_int(0x0002, &mut buf);
        write_metadata(&table.columns, paging_state.as_deref(), &mut buf);
        types::write_int((end - start) as i32, &mut buf);
        for row in &table.rows[start..end] {
            for cell in row {
                types::write_bytes_opt(cell.as_ref(), &mut buf).unwrap();
            }
        }
        Reply {
            delay: table.delay,
            ..Reply::new(ResponseOpcode::Result, buf)
        }
    }
}

fn write_metadata(columns: &[(String, ColumnType)], paging_state: Option<&[u8]>, buf: &mut BytesMut) {
    let mut flags = 0x0001;
    if paging_state.is_some() {
        flags |= 0x0002;
    }
    types::write_int(flags, buf);
    types::write_int(columns.len() as i32, buf);
    if let Some(state) = paging_state {
        types::write_bytes(state, buf).unwrap();
    }
    types::write_string("ks", buf).unwrap();
    types::write_string("t", buf).unwrap();
    for (name, typ) in columns {
        types::write_string(name, buf).unwrap();
        write_type(typ, buf);
    }
}

fn write_type(typ: &ColumnType, buf: &mut BytesMut) {
    let id: u16 = match typ {
        ColumnType::Custom(name) => {
            types::write_short(0x0000, buf);
            types::write_string(name, buf).unwrap();
            return;
        }
        ColumnType::Ascii => 0x0001,
        ColumnType::BigInt => 0x0002,
        ColumnType::Blob => 0x0003,
        ColumnType::Boolean => 0x0004,
        ColumnType::Counter => 0x0005,
        ColumnType::Decimal => 0x0006,
        ColumnType::Double => 0x0007,
        ColumnType::Float => 0x0008,
        ColumnType::Int => 0x0009,
        ColumnType::Text => 0x000A,
        ColumnType::Timestamp => 0x000B,
        ColumnType::Uuid => 0x000C,
        ColumnType::Varchar => 0x000D,
        ColumnType::Varint => 0x000E,
        ColumnType::TimeUuid => 0x000F,
        ColumnType::Inet => 0x0010,
        ColumnType::List(elem) => {
            types::write_short(0x0020, buf);
            write_type(elem, buf);
            return;
        }
        ColumnType::Map(key, value) => {
            types::write_short(0x0021, buf);
            write_type(key, buf);
            write_type(value, buf);
            return;
        }
        ColumnType::Set(elem) => {
            types::write_short(0x0022, buf);
            write_type(elem, buf);
            return;
        }
    };
    types::write_short(id, buf);
}

#[derive(Default)]
struct NodeState {
    tables: Mutex<HashMap<String, Table>>,
    prepared: Mutex<HashMap<Bytes, String>>,
    next_id: AtomicUsize,
    received: Mutex<Vec<Received>>,
    failures: Mutex<VecDeque<DbError>>,
    credentials: Mutex<Option<(String, String)>>,
    stalled: AtomicBool,
    accepted: AtomicUsize,
    connections: Mutex<Vec<RemoteHandle<()>>>,
    trace_id: Mutex<Option<Uuid>>,
}

impl NodeState {
    fn handle(&self, version: ProtocolVersion, opcode: RequestOpcode, body: &[u8]) -> Option<Reply> {
        let buf = &mut &body[..];
        let received = match opcode {
            RequestOpcode::Startup => {
                let startup = Startup::deserialize(version, buf).unwrap();
                Received::Startup(
                    startup
                        .options
                        .into_iter()
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect(),
                )
            }
            RequestOpcode::AuthResponse => Received::AuthResponse(
                types::read_bytes_opt(buf).unwrap().map(<[u8]>::to_vec),
            ),
            RequestOpcode::Options => Received::Options,
            RequestOpcode::Query => {
                let query = Query::deserialize(version, buf).unwrap();
                Received::Query {
                    text: query.contents.into_owned(),
                    params: query.parameters.into(),
                }
            }
            RequestOpcode::Prepare => {
                Received::Prepare(PrepareOwned::deserialize(version, buf).unwrap().query)
            }
            RequestOpcode::Execute => {
                let execute = Execute::deserialize(version, buf).unwrap();
                Received::Execute {
                    id: execute.id,
                    params: execute.parameters.into(),
                }
            }
            RequestOpcode::Batch => {
                let batch = Batch::deserialize(version, buf).unwrap();
                Received::Batch {
                    batch_type: batch.batch_type,
                    consistency: batch.consistency,
                    statements: batch.statements.into_iter().map(into_static).collect(),
                }
            }
        };
        self.received.lock().unwrap().push(received.clone());

        if self.stalled.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.reply(received))
    }

    fn reply(&self, received: Received) -> Reply {
        match received {
            Received::Startup(_) => match &*self.credentials.lock().unwrap() {
                Some(_) => Reply::authenticate(PASSWORD_AUTHENTICATOR),
                None => Reply::ready(),
            },
            Received::AuthResponse(token) => {
                let expected = self
                    .credentials
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|(user, password)| format!("\0{}\0{}", user, password).into_bytes());
                if token.is_some() && token == expected {
                    Reply::auth_success()
                } else {
                    Reply::error(&DbError::AuthenticationError, "bad credentials")
                }
            }
            Received::Options => Reply::supported(),
            Received::Prepare(statement) => {
                let id = format!("id{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                self.prepared
                    .lock()
                    .unwrap()
                    .insert(Bytes::from(id.clone()), statement.clone());
                let table = self.table(&statement);
                let args = table.args.unwrap_or_else(|| default_args(&statement));
                Reply::prepared(id.as_bytes(), &args, &table.columns)
            }
            Received::Query { text, params } => {
                if let Some(keyspace) = text.strip_prefix("USE ") {
                    return Reply::set_keyspace(keyspace.trim_matches('"'));
                }
                self.run(&text, &params)
            }
            Received::Execute { id, params } => {
                let statement = self.prepared.lock().unwrap().get(&id).cloned();
                match statement {
                    Some(statement) => self.run(&statement, &params),
                    None => Reply::error(&DbError::Unprepared { statement_id: id }, "unknown id"),
                }
            }
            Received::Batch { statements, .. } => {
                if let Some(error) = self.failures.lock().unwrap().pop_front() {
                    return Reply::error(&error, "forced failure");
                }
                let prepared = self.prepared.lock().unwrap();
                for statement in statements {
                    if let BatchStatement::Prepared { id, .. } = statement {
                        if !prepared.contains_key(&id) {
                            return Reply::error(
                                &DbError::Unprepared { statement_id: id },
                                "unknown id",
                            );
                        }
                    }
                }
                Reply::void()
            }
        }
    }

    fn run(&self, statement: &str, params: &Params) -> Reply {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Reply::error(&error, "forced failure");
        }
        match self.tables.lock().unwrap().get(statement) {
            Some(table) => Reply::rows(table, params),
            None => Reply::void(),
        }
    }

    fn table(&self, statement: &str) -> Table {
        self.tables
            .lock()
            .unwrap()
            .get(statement)
            .cloned()
            .unwrap_or_default()
    }
}

fn into_static(statement: BatchStatement<'_>) -> BatchStatement<'static> {
    match statement {
        BatchStatement::Query { text, values } => BatchStatement::Query {
            text: text.into_owned().into(),
            values,
        },
        BatchStatement::Prepared { id, values } => BatchStatement::Prepared { id, values },
    }
}

/// A node listening on a local port. Dropping it closes every connection.
pub(crate) struct MockNode {
    addr: SocketAddr,
    state: Arc<NodeState>,
    _listener: RemoteHandle<()>,
}

impl MockNode {
    pub(crate) async fn start() -> MockNode {
        MockNode::bind("127.0.0.1:0").await
    }

    pub(crate) async fn bind(addr: &str) -> MockNode {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(NodeState::default());
        let (task, handle) = accept_loop(listener, state.clone()).remote_handle();
        tokio::spawn(task);
        MockNode {
            addr,
            state,
            _listener: handle,
        }
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    pub(crate) fn session_builder(&self) -> SessionBuilder {
        SessionBuilder::new()
            .known_node(self.addr())
            .timeout(Duration::from_secs(2))
    }

    pub(crate) async fn session(&self) -> Session {
        self.session_builder().build().await.unwrap()
    }

    pub(crate) fn add_table(&self, statement: &str, table: Table) {
        self.state
            .tables
            .lock()
            .unwrap()
            .insert(statement.to_owned(), table);
    }

    pub(crate) fn require_password(&self, user: &str, password: &str) {
        *self.state.credentials.lock().unwrap() = Some((user.to_owned(), password.to_owned()));
    }

    /// The next `count` QUERY, EXECUTE or BATCH requests fail with `error`.
    pub(crate) fn fail_next(&self, count: usize, error: DbError) {
        let mut failures = self.state.failures.lock().unwrap();
        failures.extend(std::iter::repeat_n(error, count));
    }

    /// Forgets every prepared id, as a restarted node would.
    pub(crate) fn forget_prepared(&self) {
        self.state.prepared.lock().unwrap().clear();
    }

    /// Stops answering requests, while still reading them.
    pub(crate) fn stall(&self) {
        self.state.stalled.store(true, Ordering::SeqCst);
    }

    /// Traced requests get this tracing id.
    pub(crate) fn set_trace_id(&self, trace_id: Uuid) {
        *self.state.trace_id.lock().unwrap() = Some(trace_id);
    }

    /// Drops every open connection.
    pub(crate) fn kill_connections(&self) {
        self.state.connections.lock().unwrap().clear();
    }

    /// Number of connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self) -> Vec<Received> {
        self.state.received.lock().unwrap().clone()
    }

    pub(crate) fn clear_received(&self) {
        self.state.received.lock().unwrap().clear();
    }

    pub(crate) fn prepares(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|received| match received {
                Received::Prepare(statement) => Some(statement),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn executes(&self) -> Vec<Params> {
        self.received()
            .into_iter()
            .filter_map(|received| match received {
                Received::Execute { params, .. } => Some(params),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn queries(&self) -> Vec<(String, Params)> {
        self.received()
            .into_iter()
            .filter_map(|received| match received {
                Received::Query { text, params } => Some((text, params)),
                _ => None,
            })
            .collect()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.kill_connections();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<NodeState>) {
    while let Ok((socket, _)) = listener.accept().await {
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let (task, handle) = serve_connection(socket, state.clone()).remote_handle();
        tokio::spawn(task);
        state.connections.lock().unwrap().push(handle);
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<NodeState>) {
    let (mut read_half, write_half) = socket.into_split();
    let write_half = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut delayed = Vec::new();
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if read_half.read_exact(&mut header).await.is_err() {
            return;
        }
        let version = ProtocolVersion::try_from(header[0]).unwrap();
        let flags = header[1];
        let stream = header[2] as i8;
        let opcode = RequestOpcode::try_from(header[3]).unwrap();
        let length = i32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        let mut body = vec![0u8; length];
        if read_half.read_exact(&mut body).await.is_err() {
            return;
        }

        let Some(reply) = state.handle(version, opcode, &body) else {
            continue;
        };
        let fixed_trace_id = *state.trace_id.lock().unwrap();
        let trace_id = (flags & FLAG_TRACING != 0 && reply.opcode == ResponseOpcode::Result)
            .then(|| fixed_trace_id.unwrap_or_else(Uuid::new_v4));
        let frame = response_frame(version, stream, &reply, trace_id);

        if reply.delay.is_zero() {
            if write_frame(&write_half, &frame).await.is_err() {
                return;
            }
        } else {
            let write_half = write_half.clone();
            let (task, handle) = async move {
                tokio::time::sleep(reply.delay).await;
                let _ = write_frame(&write_half, &frame).await;
            }
            .remote_handle();
            tokio::spawn(task);
            delayed.push(handle);
        }
    }
}

fn response_frame(
    version: ProtocolVersion,
    stream: i8,
    reply: &Reply,
    trace_id: Option<Uuid>,
) -> Bytes {
    let mut body = BytesMut::new();
    if let Some(trace_id) = trace_id {
        types::write_uuid(&trace_id, &mut body);
    }
    body.put_slice(&reply.body);

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_u8(version.response_byte());
    frame.put_u8(if trace_id.is_some() { FLAG_TRACING } else { 0 });
    frame.put_i8(stream);
    frame.put_u8(reply.opcode as u8);
    frame.put_i32(body.len() as i32);
    frame.put_slice(&body);
    frame.freeze()
}

async fn write_frame(
    write_half: &tokio::sync::Mutex<OwnedWriteHalf>,
    frame: &[u8],
) -> std::io::Result<()> {
    let mut write_half = write_half.lock().await;
    write_half.write_all(frame).await?;
    write_half.flush().await
}
