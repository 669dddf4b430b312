mod auth;
mod connection;
mod discovery;
mod pool;
mod retries;
mod session;
mod trace_writer;
pub(crate) mod utils;
