//! Connections to nodes, their pooling and the prepared statement cache.

mod connection;
pub use connection::{Connection, ConnectionConfig, ErrorReceiver, QueryResponse, MAX_STREAMS};

mod connection_pool;
pub(crate) use connection_pool::addr_host;
pub use connection_pool::{host_addr, simple_pool_factory, ConnectionPool, PoolFactory, SimplePool};

mod statement_cache;
pub use statement_cache::{
    PreparedInfo, StatementCache, StatementKey, DEFAULT_MAX_PREPARED_STATEMENTS,
};
