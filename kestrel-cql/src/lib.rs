//! CQL binary protocol (versions 1 and 2) frames, requests, responses and
//! value encoding.
//!
//! Mainly intended to be used by the `kestrel` driver. The crate does no
//! networking of its own; [`frame::read_response_frame`] works over any
//! [`tokio::io::AsyncRead`].

pub mod frame;
pub mod value;

pub use crate::frame::types::Consistency;
