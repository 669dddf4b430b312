use std::borrow::Cow;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::ProtocolVersion;
use bytes::{BufMut, Bytes};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
    Consistency,
};

use super::{DeserializableRequest, RequestDeserializationError};

// Query flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const ALL_FLAGS: u8 = FLAG_VALUES | FLAG_SKIP_METADATA | FLAG_PAGE_SIZE | FLAG_WITH_PAGING_STATE;

#[derive(Debug, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl<'q> Query<'q> {
    /// A QUERY without bound values or paging.
    pub fn new(contents: impl Into<Cow<'q, str>>, consistency: Consistency) -> Self {
        Self {
            contents: contents.into(),
            parameters: QueryParameters {
                consistency,
                ..Default::default()
            },
        }
    }
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        match version {
            ProtocolVersion::V1 => {
                if !self.parameters.values.is_empty() {
                    return Err(RequestSerializationError::Unsupported {
                        what: "Binding values to a QUERY",
                        version: version.as_u8(),
                    });
                }
                if self.parameters.page_size.is_some() || self.parameters.paging_state.is_some() {
                    return Err(RequestSerializationError::Unsupported {
                        what: "Paging",
                        version: version.as_u8(),
                    });
                }
                types::write_consistency(self.parameters.consistency, buf);
                Ok(())
            }
            ProtocolVersion::V2 => self.parameters.serialize(buf),
        }
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = match version {
            ProtocolVersion::V1 => QueryParameters {
                consistency: types::read_consistency(buf)?,
                ..Default::default()
            },
            ProtocolVersion::V2 => QueryParameters::deserialize(buf)?,
        };

        Ok(Self {
            contents,
            parameters,
        })
    }
}

/// Parameters shared by QUERY and EXECUTE.
///
/// Values are already marshalled; `None` encodes a null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: Consistency,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub values: Cow<'a, [Option<Bytes>]>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            page_size: None,
            paging_state: None,
            values: Cow::Borrowed(&[]),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            write_values(&self.values, buf)?;
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        Ok(())
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        let flags = types::read_byte(buf)?;
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }

        let values = if flags & FLAG_VALUES != 0 {
            read_values(buf)?
        } else {
            Vec::new()
        };
        let page_size = if flags & FLAG_PAGE_SIZE != 0 {
            Some(types::read_int(buf)?)
        } else {
            None
        };
        let paging_state = if flags & FLAG_WITH_PAGING_STATE != 0 {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };

        Ok(Self {
            consistency,
            page_size,
            paging_state,
            values: Cow::Owned(values),
        })
    }
}

// A short count followed by one [bytes] per value.
pub(crate) fn write_values(
    values: &[Option<Bytes>],
    buf: &mut impl BufMut,
) -> Result<(), RequestSerializationError> {
    types::write_short_length(values.len(), buf)?;
    for value in values {
        types::write_bytes_opt(value.as_ref(), buf)?;
    }
    Ok(())
}

pub(crate) fn read_values(
    buf: &mut &[u8],
) -> Result<Vec<Option<Bytes>>, RequestDeserializationError> {
    let count = types::read_short_length(buf)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
    }
    Ok(values)
}
