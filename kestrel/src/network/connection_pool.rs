use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use itertools::Itertools;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use super::connection::{Connection, ConnectionConfig, ErrorReceiver};
use super::statement_cache::StatementCache;
use crate::client::session_builder::SessionConfig;
use crate::cluster::HostInfo;
use crate::errors::QueryError;
use crate::statement::query::Query;

// Concurrent fill requests arriving within this window collapse into one.
const FILL_DEBOUNCE: Duration = Duration::from_millis(1);

/// Source of connections for a session.
///
/// The session asks the pool for a connection before every attempt of a
/// request, and reports connections that broke.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Hands out a usable connection, or `None` if there is none.
    async fn pick(&self, query: Option<&Query>) -> Option<Arc<Connection>>;

    /// Number of pooled connections.
    fn size(&self) -> usize;

    /// Reports an error seen on `connection`. `closed` tells whether the
    /// connection is now unusable.
    fn handle_error(&self, connection: &Arc<Connection>, error: &QueryError, closed: bool);

    /// Replaces the set of nodes the pool connects to.
    async fn set_hosts(&self, hosts: Vec<HostInfo>);

    /// Closes every connection. The pool hands out nothing afterwards.
    fn close(&self);
}

/// Builds the pool of a new session.
pub type PoolFactory = Arc<
    dyn Fn(SessionConfig, Arc<StatementCache>) -> BoxFuture<'static, Arc<dyn ConnectionPool>>
        + Send
        + Sync,
>;

/// Factory of [`SimplePool`]s, used when the configuration names none.
pub fn simple_pool_factory() -> PoolFactory {
    Arc::new(|config, cache| {
        async move { Arc::new(SimplePool::new(&config, cache).await) as Arc<dyn ConnectionPool> }
            .boxed()
    })
}

/// Returns `host` with `default_port` appended unless it already names a port.
pub fn host_addr(host: &str, default_port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_owned();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_owned(),
        _ => format!("{}:{}", host, default_port),
    }
}

/// Host part of a `host:port` address.
pub(crate) fn addr_host(addr: &str) -> &str {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        return match socket_addr {
            SocketAddr::V4(_) => addr.rsplit_once(':').map_or(addr, |(host, _)| host),
            SocketAddr::V6(_) => addr
                .rsplit_once(':')
                .map_or(addr, |(host, _)| host.trim_start_matches('[').trim_end_matches(']')),
        };
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}

/// Keeps `connections_per_host` connections open to every known node and
/// hands them out round-robin.
///
/// Broken connections are dropped from the pool and replaced in the
/// background. A node that refuses a connection is retried on the next fill.
pub struct SimplePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connection_config: ConnectionConfig,
    port: u16,
    num_conns: usize,
    keyspace: Option<String>,
    cache: Arc<StatementCache>,

    state: StdMutex<PoolState>,
    // Connections grouped by node, rebuilt on every change.
    groups: ArcSwap<Vec<Vec<Arc<Connection>>>>,
    host_index: AtomicUsize,
    conn_index: AtomicUsize,

    // A single permit; whoever holds it is filling the pool.
    fill_token: Semaphore,
    quit: AtomicBool,
}

#[derive(Default)]
struct PoolState {
    hosts: HashMap<String, HostInfo>,
    // Keyed by dial address. A host owns an entry even with no connection.
    conns: HashMap<String, Vec<Arc<Connection>>>,
    // Dials in progress, by dial address. They count against `num_conns`.
    connecting: HashMap<String, usize>,
}

impl PoolState {
    fn live(&self, addr: &str) -> usize {
        self.conns.get(addr).map_or(0, Vec::len) + self.connecting.get(addr).copied().unwrap_or(0)
    }

    fn release_dial(&mut self, addr: &str) {
        if let Some(count) = self.connecting.get_mut(addr) {
            *count -= 1;
            if *count == 0 {
                self.connecting.remove(addr);
            }
        }
    }
}

// A dial reserved against the connection limit of its host. Dropping it
// before the connection lands gives the slot back.
struct DialSlot<'a> {
    pool: &'a PoolInner,
    addr: &'a str,
    armed: bool,
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().unwrap().release_dial(self.addr);
        }
    }
}

impl SimplePool {
    /// Connects to the first reachable node of `config.known_nodes`, then
    /// fills the pool in the background.
    pub async fn new(config: &SessionConfig, cache: Arc<StatementCache>) -> Self {
        let mut state = PoolState::default();
        for host in &config.known_nodes {
            let info = HostInfo::new(host.clone());
            state
                .conns
                .insert(host_addr(&info.peer, config.port), Vec::new());
            state.hosts.insert(info.peer.clone(), info);
        }
        let seeds = config.known_nodes.clone();

        let inner = Arc::new(PoolInner {
            connection_config: config.connection_config(),
            port: config.port,
            num_conns: config.connections_per_host.max(1),
            keyspace: config.keyspace.clone().filter(|keyspace| !keyspace.is_empty()),
            cache,
            state: StdMutex::new(state),
            groups: ArcSwap::from_pointee(Vec::new()),
            host_index: AtomicUsize::new(rand::rng().random::<u32>() as usize),
            conn_index: AtomicUsize::new(rand::rng().random::<u32>() as usize),
            fill_token: Semaphore::new(0),
            quit: AtomicBool::new(false),
        });

        for seed in seeds {
            let addr = host_addr(&seed, inner.port);
            if inner.connect(&addr).await.is_ok() {
                debug!("Connected to seed {}", addr);
                break;
            }
        }

        inner.fill_token.add_permits(1);
        tokio::spawn(inner.clone().fill_pool());

        SimplePool { inner }
    }

    /// Nodes the pool currently connects to.
    pub fn hosts(&self) -> Vec<HostInfo> {
        let state = self.inner.state.lock().unwrap();
        state
            .hosts
            .values()
            .cloned()
            .sorted_by(|a, b| a.peer.cmp(&b.peer))
            .collect()
    }
}

impl PoolInner {
    // Reserves a slot for `addr`, or returns `None` when the host already
    // has `num_conns` connections open or being opened.
    fn reserve_dial<'a>(&'a self, addr: &'a str) -> Option<DialSlot<'a>> {
        let mut state = self.state.lock().unwrap();
        if state.live(addr) >= self.num_conns {
            return None;
        }
        *state.connecting.entry(addr.to_owned()).or_default() += 1;
        Some(DialSlot {
            pool: self,
            addr,
            armed: true,
        })
    }

    fn has_room(&self, addr: &str) -> bool {
        self.state.lock().unwrap().live(addr) < self.num_conns
    }

    async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), QueryError> {
        let Some(slot) = self.reserve_dial(addr) else {
            trace!("[{}] Host already has {} connections", addr, self.num_conns);
            return Ok(());
        };
        let (connection, errors) =
            match Connection::open(addr, self.connection_config.clone(), self.cache.clone()).await
            {
                Ok(opened) => opened,
                Err(err) => {
                    debug!("[{}] Failed to connect: {}", addr, err);
                    return Err(err);
                }
            };
        self.add_conn(slot, connection, errors).await
    }

    async fn connect_many(self: Arc<Self>, addr: String, count: usize) {
        for _ in 0..count {
            if self.quit.load(Ordering::Relaxed)
                || !self.has_room(&addr)
                || self.connect(&addr).await.is_err()
            {
                return;
            }
        }
    }

    async fn add_conn(
        self: &Arc<Self>,
        mut slot: DialSlot<'_>,
        connection: Connection,
        errors: ErrorReceiver,
    ) -> Result<(), QueryError> {
        let addr = slot.addr;
        if self.quit.load(Ordering::Relaxed) {
            connection.close();
            return Err(QueryError::SessionClosed);
        }
        if let Some(keyspace) = &self.keyspace {
            if let Err(err) = connection.use_keyspace(keyspace).await {
                warn!("[{}] Failed to use keyspace {}: {}", addr, keyspace, err);
                connection.close();
                return Err(err);
            }
        }

        let connection = Arc::new(connection);
        {
            let mut state = self.state.lock().unwrap();
            state.release_dial(addr);
            slot.armed = false;
            if self.quit.load(Ordering::Relaxed) {
                connection.close();
                return Err(QueryError::SessionClosed);
            }
            let Some(group) = state.conns.get_mut(addr) else {
                trace!("[{}] Host was removed while connecting", addr);
                connection.close();
                return Ok(());
            };
            if group.len() >= self.num_conns {
                trace!("[{}] Dropping surplus connection", addr);
                connection.close();
                return Ok(());
            }
            group.push(connection.clone());
            self.rebuild_groups(&state);
        }

        tokio::spawn(Self::watch_connection(
            Arc::downgrade(self),
            Arc::downgrade(&connection),
            errors,
        ));
        Ok(())
    }

    async fn watch_connection(
        pool: Weak<PoolInner>,
        connection: Weak<Connection>,
        errors: ErrorReceiver,
    ) {
        // The sender is dropped without an error when the connection is.
        let Ok(error) = errors.await else {
            return;
        };
        if let (Some(pool), Some(connection)) = (pool.upgrade(), connection.upgrade()) {
            pool.handle_error(&connection, &error, true);
        }
    }

    fn rebuild_groups(&self, state: &PoolState) {
        let groups = state
            .conns
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(_, group)| group.clone())
            .collect::<Vec<_>>();
        self.groups.store(Arc::new(groups));
    }

    async fn fill_pool(self: Arc<Self>) {
        let permit = match tokio::time::timeout(FILL_DEBOUNCE, self.fill_token.acquire()).await {
            Ok(Ok(permit)) => permit,
            // Someone else is filling, or the pool is closed.
            _ => return,
        };
        if self.quit.load(Ordering::Relaxed) {
            return;
        }

        let pending = {
            let state = self.state.lock().unwrap();
            state
                .conns
                .keys()
                .map(|addr| (addr.clone(), state.live(addr)))
                .sorted()
                .collect::<Vec<_>>()
        };

        for (addr, existing) in pending {
            if existing >= self.num_conns {
                continue;
            }
            let mut missing = self.num_conns - existing;
            if existing == 0 {
                // Probe a node with nothing open first, so that a node that
                // is down costs one attempt.
                if self.connect(&addr).await.is_err() {
                    continue;
                }
                missing -= 1;
            }
            if missing > 0 {
                tokio::spawn(self.clone().connect_many(addr, missing));
            }
        }
        drop(permit);
    }

    fn handle_error(self: &Arc<Self>, connection: &Arc<Connection>, error: &QueryError, closed: bool) {
        if !closed {
            return;
        }
        debug!("[{}] Removing broken connection: {}", connection.address(), error);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(group) = state.conns.get_mut(connection.address()) {
                group.retain(|conn| !Arc::ptr_eq(conn, connection));
            }
            self.rebuild_groups(&state);
        }
        if !self.quit.load(Ordering::Relaxed) {
            tokio::spawn(self.clone().fill_pool());
        }
    }

    fn pick_ready(&self) -> Option<Arc<Connection>> {
        let groups = self.groups.load();
        if groups.is_empty() {
            return None;
        }
        let start = self.host_index.fetch_add(1, Ordering::Relaxed);
        for i in 0..groups.len() {
            let group = &groups[(start + i) % groups.len()];
            if group.is_empty() {
                continue;
            }
            let offset = self.conn_index.fetch_add(1, Ordering::Relaxed);
            for j in 0..group.len() {
                let connection = &group[(offset + j) % group.len()];
                if !connection.is_closed() {
                    return Some(connection.clone());
                }
            }
        }
        None
    }

    fn size(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .conns
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl ConnectionPool for SimplePool {
    async fn pick(&self, _query: Option<&Query>) -> Option<Arc<Connection>> {
        if self.inner.quit.load(Ordering::Relaxed) {
            return None;
        }
        if self.inner.size() == 0 {
            self.inner.clone().fill_pool().await;
        }
        self.inner.pick_ready()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn handle_error(&self, connection: &Arc<Connection>, error: &QueryError, closed: bool) {
        self.inner.handle_error(connection, error, closed);
    }

    async fn set_hosts(&self, hosts: Vec<HostInfo>) {
        if self.inner.quit.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            let port = self.inner.port;
            let wanted = hosts
                .iter()
                .map(|host| host_addr(&host.peer, port))
                .collect::<HashSet<_>>();
            let removed = state
                .conns
                .keys()
                .filter(|addr| !wanted.contains(*addr))
                .cloned()
                .collect::<Vec<_>>();
            for addr in removed {
                debug!("[{}] Host removed from the pool", addr);
                for connection in state.conns.remove(&addr).unwrap_or_default() {
                    connection.close();
                }
            }
            state.hosts.clear();
            for host in hosts {
                let addr = host_addr(&host.peer, port);
                if !state.conns.contains_key(&addr) {
                    debug!("[{}] Host added to the pool", addr);
                    state.conns.insert(addr, Vec::new());
                }
                state.hosts.insert(host.peer.clone(), host);
            }
            self.inner.rebuild_groups(&state);
        }
        self.inner.clone().fill_pool().await;
    }

    fn close(&self) {
        if self.inner.quit.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        for connection in state.conns.values_mut().flat_map(std::mem::take) {
            connection.close();
        }
        self.inner.rebuild_groups(&state);
        self.inner.fill_token.close();
    }
}

impl Drop for SimplePool {
    fn drop(&mut self) {
        self.close();
    }
}
