//! Sessions, the statements they run and the rows they return.

pub mod pager;
pub mod session;
pub mod session_builder;
