use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::ProtocolVersion;

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

pub struct Prepare<'a> {
    pub query: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(self.query, buf)?;
        Ok(())
    }
}

/// Owned counterpart of [`Prepare`], produced when decoding a PREPARE frame.
#[derive(Debug, PartialEq, Eq)]
pub struct PrepareOwned {
    pub query: String,
}

impl SerializableRequest for PrepareOwned {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        Prepare { query: &self.query }.serialize(version, buf)
    }
}

impl DeserializableRequest for PrepareOwned {
    fn deserialize(
        _version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        Ok(Self {
            query: types::read_long_string(buf)?.to_owned(),
        })
    }
}
