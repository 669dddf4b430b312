//! SessionBuilder provides an easy way to create new Sessions

use std::sync::Arc;
use std::time::Duration;

use kestrel_cql::frame::request::options::DEFAULT_CQL_VERSION;
use kestrel_cql::frame::{Compression, ProtocolVersion};

use super::session::Session;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::cluster::DiscoveryConfig;
use crate::errors::NewSessionError;
use crate::network::{
    ConnectionConfig, PoolFactory, StatementCache, DEFAULT_MAX_PREPARED_STATEMENTS, MAX_STREAMS,
};
use crate::observability::tracing::Tracer;
use crate::policies::retry::RetryPolicy;
use crate::statement::query::DEFAULT_PREFETCH;
use crate::statement::Consistency;

/// Port nodes listen on unless a host names its own.
pub const DEFAULT_PORT: u16 = 9042;

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Nodes the session connects to first. A host without a port gets
    /// `port` appended.
    pub known_nodes: Vec<String>,

    /// CQL version announced in STARTUP.
    pub cql_version: String,

    /// Protocol version spoken on every connection.
    pub protocol_version: ProtocolVersion,

    /// Connect timeout, also bounding stalled reads on a connection.
    pub timeout: Duration,

    /// Default port of the nodes.
    pub port: u16,

    /// Keyspace to be used on all connections.
    /// Each connection will send `USE "<keyspace_name>"` before sending any requests.
    pub keyspace: Option<String>,

    /// Number of connections kept open to every node.
    pub connections_per_host: usize,

    /// Number of concurrent requests per connection. Values outside
    /// `1..=128` mean 128.
    pub streams_per_connection: usize,

    /// Consistency of queries and batches created by the session.
    pub consistency: Consistency,

    /// Compression algorithm used on connections.
    pub compression: Option<Compression>,

    /// Custom authenticator provider to create an authenticator instance
    /// upon connection startup.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Retry policy of queries and batches created by the session.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// Builds the connection pool. `None` means [`SimplePool`](crate::network::SimplePool).
    pub pool_factory: Option<PoolFactory>,

    /// Whether to keep the pool in sync with the nodes listed in
    /// `system.peers`.
    pub discover_hosts: bool,

    /// Options of host discovery.
    pub discovery: DiscoveryConfig,

    /// Bound of the prepared statement cache.
    pub max_prepared_statements: usize,

    /// Page size of queries created by the session. Zero leaves it to the node.
    pub page_size: i32,

    /// Prefetch fraction of queries created by the session.
    pub prefetch: f64,

    /// Tracer of queries created by the session.
    pub tracer: Option<Arc<dyn Tracer>>,

    /// Prepared statement cache. Sessions given the same cache share it.
    pub statement_cache: Option<Arc<StatementCache>>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * CQL version 3.0.0 over protocol version 2
    /// * Timeout: 600ms
    /// * Two connections per host, 128 streams each
    /// * Consistency: Quorum
    ///
    /// # Example
    /// ```
    /// # use kestrel::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            cql_version: DEFAULT_CQL_VERSION.to_owned(),
            protocol_version: ProtocolVersion::V2,
            timeout: Duration::from_millis(600),
            port: DEFAULT_PORT,
            keyspace: None,
            connections_per_host: 2,
            streams_per_connection: MAX_STREAMS,
            consistency: Consistency::Quorum,
            compression: None,
            authenticator: None,
            retry_policy: None,
            tcp_keepalive_interval: None,
            pool_factory: None,
            discover_hosts: false,
            discovery: DiscoveryConfig::default(),
            max_prepared_statements: DEFAULT_MAX_PREPARED_STATEMENTS,
            page_size: 0,
            prefetch: DEFAULT_PREFETCH,
            tracer: None,
            statement_cache: None,
        }
    }

    /// Adds a known database server with a hostname or an address.
    /// If the port is not explicitly specified, `port` is used.
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes.push(hostname.as_ref().to_owned());
    }

    /// Options of every connection opened with this configuration.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            protocol_version: self.protocol_version,
            cql_version: self.cql_version.clone(),
            timeout: self.timeout,
            compression: self.compression,
            authenticator: self.authenticator.clone(),
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            num_streams: self.streams_per_connection,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("known_nodes", &self.known_nodes)
            .field("protocol_version", &self.protocol_version)
            .field("timeout", &self.timeout)
            .field("port", &self.port)
            .field("keyspace", &self.keyspace)
            .field("connections_per_host", &self.connections_per_host)
            .field("consistency", &self.consistency)
            .field("discover_hosts", &self.discover_hosts)
            .finish_non_exhaustive()
    }
}

/// SessionBuilder is used to create new Session instances
/// # Example
///
/// ```
/// # use kestrel::{Session, SessionBuilder};
/// # use kestrel::Consistency;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .consistency(Consistency::One)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates new SessionBuilder with default configuration
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Add a known node with a hostname or an address.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Add a list of known nodes.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        for hostname in hostnames {
            self.config.add_known_node(hostname);
        }
        self
    }

    /// Set the default port of the nodes.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the keyspace used by every connection.
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace.into());
        self
    }

    /// Set the CQL version announced in STARTUP.
    pub fn cql_version(mut self, cql_version: impl Into<String>) -> Self {
        self.config.cql_version = cql_version.into();
        self
    }

    /// Set the protocol version.
    pub fn protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.config.protocol_version = protocol_version;
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set username and password for plain text authentication.
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Set custom authenticator provider to create an authenticator instance during connection startup.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Set the default retry policy.
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = Some(retry_policy);
        self
    }

    /// Set the number of connections per node.
    pub fn connections_per_host(mut self, connections: usize) -> Self {
        self.config.connections_per_host = connections;
        self
    }

    /// Set the number of concurrent requests per connection.
    pub fn streams_per_connection(mut self, streams: usize) -> Self {
        self.config.streams_per_connection = streams;
        self
    }

    /// Set the default consistency.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = consistency;
        self
    }

    /// Set the connect and read stall timeout. Zero disables both.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the default page size.
    pub fn page_size(mut self, page_size: i32) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// Set the default prefetch fraction.
    pub fn prefetch(mut self, prefetch: f64) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    /// Set the bound of the prepared statement cache.
    pub fn max_prepared_statements(mut self, max: usize) -> Self {
        self.config.max_prepared_statements = max;
        self
    }

    /// Keep the pool in sync with the nodes listed in `system.peers`.
    pub fn discover_hosts(mut self, discovery: DiscoveryConfig) -> Self {
        self.config.discover_hosts = true;
        self.config.discovery = discovery;
        self
    }

    /// Set the TCP keepalive interval.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        if interval <= Duration::from_secs(1) {
            tracing::warn!(
                "Setting the TCP keepalive interval to low values ({:?}) is not recommended as it can have a negative impact on performance. Consider setting it above 1 second.",
                interval
            );
        }
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Set the default tracer.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.config.tracer = Some(tracer);
        self
    }

    /// Use `cache` for prepared statements. Sessions built with the same
    /// cache share it.
    pub fn statement_cache(mut self, cache: Arc<StatementCache>) -> Self {
        self.config.statement_cache = Some(cache);
        self
    }

    /// Replace the connection pool implementation.
    pub fn pool_factory(mut self, pool_factory: PoolFactory) -> Self {
        self.config.pool_factory = Some(pool_factory);
        self
    }

    /// Builds the Session after setting all the options.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}
