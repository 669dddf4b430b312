use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;
use thiserror::Error;

/// An error that occurred while reading a frame header or its extensions
/// (compression, tracing) from the wire.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Response protocol version does not match connection protocol version ({received} != {expected})")]
    VersionMismatch { received: u8, expected: u8 },
    #[error("Received a frame from version {0}, but only versions 1 and 2 are supported")]
    VersionNotSupported(u8),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame body length is negative: {0}")]
    NegativeBodyLength(i32),
    #[error("Frame is traced, but its body is shorter than a trace id: {0} < 16")]
    TracedBodyTooShort(usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Unrecognized opcode: {0}")]
    TryFromPrimitiveError(#[from] TryFromPrimitiveError<u8>),
    #[error("Error compressing lz4 data {0}")]
    Lz4CompressError(#[from] lz4_flex::block::CompressError),
    #[error("Error decompressing lz4 data {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
}

/// An error that occurred while decoding the body of a response.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid length in frame body: {0}")]
    InvalidLength(i32),
    #[error("UTF8 deserialization failed: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Type not yet implemented, id: {0}")]
    TypeNotImplemented(u16),
    #[error("Unknown result kind: {0}")]
    UnknownResultKind(i32),
    #[error("Unexpected {opcode:?} response body: {reason}")]
    BadIncomingData {
        opcode: ResponseOpcode,
        reason: String,
    },
    #[error("Malformed {db_error} error: failed to read {field}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: Box<ParseError>,
    },
    #[error(transparent)]
    BadConsistency(#[from] TryFromPrimitiveError<u16>),
}

/// An error that occurred while serializing a request.
#[derive(Error, Debug, Clone)]
pub enum RequestSerializationError {
    #[error("{what} is not supported by protocol version {version}")]
    Unsupported { what: &'static str, version: u8 },
    #[error("Value length does not fit the wire representation: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Request compression failed: {0}")]
    Compression(String),
}
