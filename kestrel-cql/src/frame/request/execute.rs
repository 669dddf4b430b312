use std::borrow::Cow;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::ProtocolVersion;
use bytes::Bytes;

use crate::{
    frame::request::{query, RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, PartialEq, Eq)]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: query::QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        // Serializing statement id
        types::write_short_bytes(&self.id[..], buf)?;

        match version {
            // Version 1 has no flags: values come first, then consistency.
            ProtocolVersion::V1 => {
                if self.parameters.page_size.is_some() || self.parameters.paging_state.is_some() {
                    return Err(RequestSerializationError::Unsupported {
                        what: "Paging",
                        version: version.as_u8(),
                    });
                }
                query::write_values(&self.parameters.values, buf)?;
                types::write_consistency(self.parameters.consistency, buf);
            }
            ProtocolVersion::V2 => self.parameters.serialize(buf)?,
        }
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let parameters = match version {
            ProtocolVersion::V1 => {
                let values = query::read_values(buf)?;
                query::QueryParameters {
                    consistency: types::read_consistency(buf)?,
                    values: Cow::Owned(values),
                    ..Default::default()
                }
            }
            ProtocolVersion::V2 => query::QueryParameters::deserialize(buf)?,
        };

        Ok(Self { id, parameters })
    }
}
