use std::borrow::Cow;

use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::{types, ProtocolVersion};
use crate::Consistency;

use super::query::{read_values, write_values};
use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<'b> {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement<'b>>,
    pub consistency: Consistency,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = RequestDeserializationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(RequestDeserializationError::BadBatchType(value)),
        }
    }
}

/// One entry of a BATCH: either the text of a statement, or the id of a
/// statement prepared on the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatement<'a> {
    Query {
        text: Cow<'a, str>,
        values: Vec<Option<Bytes>>,
    },
    Prepared {
        id: Bytes,
        values: Vec<Option<Bytes>>,
    },
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        if version == ProtocolVersion::V1 {
            return Err(RequestSerializationError::Unsupported {
                what: "BATCH",
                version: version.as_u8(),
            });
        }

        // Serializing type of batch
        buf.put_u8(self.batch_type as u8);

        // Serializing queries
        types::write_short_length(self.statements.len(), buf)?;
        for statement in &self.statements {
            statement.serialize(buf)?;
        }

        // Serializing consistency
        types::write_consistency(self.consistency, buf);

        Ok(())
    }
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        match self {
            Self::Query { text, values } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
                write_values(values, buf)?;
            }
            Self::Prepared { id, values } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
                write_values(values, buf)?;
            }
        }

        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        match types::read_byte(buf)? {
            0 => {
                let text = Cow::Owned(types::read_long_string(buf)?.to_owned());
                let values = read_values(buf)?;
                Ok(Self::Query { text, values })
            }
            1 => {
                let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
                let values = read_values(buf)?;
                Ok(Self::Prepared { id, values })
            }
            kind => Err(RequestDeserializationError::UnexpectedBatchStatementKind(
                kind,
            )),
        }
    }
}

impl DeserializableRequest for Batch<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        if version == ProtocolVersion::V1 {
            return Err(RequestDeserializationError::UnsupportedVersion("BATCH"));
        }

        let batch_type = BatchType::try_from(types::read_byte(buf)?)?;
        let count = types::read_short_length(buf)?;
        let statements = (0..count)
            .map(|_| BatchStatement::deserialize(buf))
            .collect::<Result<Vec<_>, _>>()?;
        let consistency = types::read_consistency(buf)?;

        Ok(Self {
            batch_type,
            statements,
            consistency,
        })
    }
}
