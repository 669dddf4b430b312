//! Async driver core for databases speaking the CQL binary protocol
//! (versions 1 and 2), such as Apache Cassandra®.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use kestrel::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4")
//!         .keyspace("ks")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! Nodes given without a port use [SessionConfig::port]. Every node gets
//! [SessionConfig::connections_per_host] connections, each of them able to
//! carry up to 128 requests at once.
//!
//! ### Making queries
//! [Session::query] creates a [Query] bound to its values. DML statements
//! (`SELECT`, `INSERT`, `UPDATE`, `DELETE` and `BATCH`) are prepared once per
//! node and keyspace and executed with their values; anything else is sent
//! as plain text.
//!
//! ```rust
//! # use kestrel::{Consistency, Session};
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! session
//!     .query("INSERT INTO ks.tab (a, b) VALUES(?, ?)", (2_i32, "some text"))
//!     .consistency(Consistency::One)
//!     .exec()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Receiving results
//! Rows are read one at a time with [Iter::scan]. Following pages are
//! fetched in the background while the current one is being read.
//!
//! ```rust
//! # use kestrel::Session;
//! # use kestrel::value::Unmarshal;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! let mut iter = session
//!     .query("SELECT a, b FROM ks.tab", ())
//!     .page_size(100)
//!     .iter()
//!     .await;
//! let (mut a, mut b) = (0_i32, String::new());
//! while iter.scan(&mut [&mut a as &mut dyn Unmarshal, &mut b]).await {
//!     println!("{a} {b}");
//! }
//! iter.close()?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod frame {
    //! Protocol level types appearing in the driver API.
    pub use kestrel_cql::frame::response::result::{ColumnSpec, ColumnType, Row};
    pub use kestrel_cql::frame::{Compression, ProtocolVersion};
}

pub mod value {
    //! Encoding of bound values and decoding of cells.
    pub use kestrel_cql::value::*;
}

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod observability;
pub mod policies;
pub mod statement;

pub(crate) mod utils;

pub use client::pager::Iter;
pub use client::session::Session;
pub use client::session_builder::{SessionBuilder, SessionConfig};
pub use cluster::{DiscoveryConfig, HostInfo};
pub use statement::batch::Batch;
pub use statement::query::Query;
pub use statement::{BatchType, Consistency};

pub use observability::tracing::{TraceWriter, Tracer};
pub use policies::retry;
