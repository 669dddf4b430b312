//! CQL requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod startup;

use thiserror::Error;

use bytes::Bytes;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use startup::Startup;

use super::frame_errors::{ParseError, RequestSerializationError};
use super::{ProtocolVersion, TryFromPrimitiveError};

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    /// Initialize the connection. The server answers with READY or, if it
    /// requires authentication, with AUTHENTICATE.
    Startup = 0x01,
    /// Asks the server which STARTUP options it supports.
    /// Also used as a cheap liveness ping.
    Options = 0x05,
    /// Executes an unprepared statement.
    Query = 0x07,
    /// Prepares a statement for later execution through EXECUTE.
    Prepare = 0x09,
    /// Executes a prepared statement.
    Execute = 0x0A,
    /// Executes a list of statements (prepared or not) as a batch.
    Batch = 0x0D,
    /// Answers a server authentication challenge.
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    /// Opcode of the request, used to identify the request type in the CQL frame.
    const OPCODE: RequestOpcode;

    /// Serializes the request body for the given protocol version.
    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError>;

    /// Serializes the request body into a heap-allocated `Bytes` object.
    fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, RequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(version, &mut v)?;
        Ok(v.into())
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// The driver itself never decodes requests; this exists so that tests and
/// mock servers can assert on what was actually sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    /// Deserializes the request body written for the given protocol version.
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError>;
}

/// An error type returned by [`DeserializableRequest::deserialize`].
#[derive(Debug, Error)]
pub enum RequestDeserializationError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Specified flags are not recognised: {flags:02x}")]
    UnknownFlags { flags: u8 },
    #[error("Bad BatchType value: {0}")]
    BadBatchType(u8),
    #[error("Unexpected batch statement kind: {0}")]
    UnexpectedBatchStatementKind(u8),
    #[error("{0} request cannot be encoded in protocol version 1")]
    UnsupportedVersion(&'static str),
}
