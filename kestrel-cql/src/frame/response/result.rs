use crate::frame::frame_errors::ParseError;
use crate::frame::response::ResponseOpcode;
use crate::frame::{types, ProtocolVersion};
use bytes::Bytes;
use std::fmt;
use std::result::Result as StdResult;

const CUSTOM_TYPE_PREFIX: &str = "org.apache.cassandra.db.marshal.";

// Metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    TimeUuid,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Custom(name) => write!(f, "{}", name),
            ColumnType::Ascii => f.write_str("ascii"),
            ColumnType::BigInt => f.write_str("bigint"),
            ColumnType::Blob => f.write_str("blob"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Counter => f.write_str("counter"),
            ColumnType::Decimal => f.write_str("decimal"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Uuid => f.write_str("uuid"),
            ColumnType::Varchar => f.write_str("varchar"),
            ColumnType::Varint => f.write_str("varint"),
            ColumnType::TimeUuid => f.write_str("timeuuid"),
            ColumnType::Inet => f.write_str("inet"),
            ColumnType::List(elem) => write!(f, "list<{}>", elem),
            ColumnType::Map(key, value) => write!(f, "map<{}, {}>", key, value),
            ColumnType::Set(elem) => write!(f, "set<{}>", elem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_specs: Vec<ColumnSpec>,
    pub paging_state: Option<Bytes>,
}

pub type Row = Vec<Option<Bytes>>;

#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    /// Schema of the bind markers.
    pub prepared_metadata: ResultMetadata,
    /// Schema of the returned rows. Always empty on protocol version 1.
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub change: String,
    pub keyspace: String,
    pub table: String,
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => {
            let name = types::read_string(buf)?;
            Custom(name.strip_prefix(CUSTOM_TYPE_PREFIX).unwrap_or(name).to_owned())
        }
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000A => Text,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Varchar,
        0x000E => Varint,
        0x000F => TimeUuid,
        0x0010 => Inet,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        id => return Err(ParseError::TypeNotImplemented(id)),
    })
}

pub fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    let global_table_spec = if global_tables_spec {
        let keyspace = types::read_string(buf)?.to_owned();
        let table = types::read_string(buf)?.to_owned();
        Some((keyspace, table))
    } else {
        None
    };

    let mut col_specs = Vec::with_capacity(col_count.min(buf.len()));
    for _ in 0..col_count {
        let (keyspace, table) = match &global_table_spec {
            Some((keyspace, table)) => (keyspace.clone(), table.clone()),
            None => (
                types::read_string(buf)?.to_owned(),
                types::read_string(buf)?.to_owned(),
            ),
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            keyspace,
            table,
            name,
            typ,
        });
    }

    Ok(ResultMetadata {
        col_specs,
        paging_state,
    })
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let metadata = deser_result_metadata(buf)?;
    let col_count = metadata.col_specs.len();

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count.min(buf.len()));
    for _ in 0..rows_count {
        let mut row = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            row.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
        }
        rows.push(row);
    }

    Ok(Rows { metadata, rows })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_result_metadata(buf)?;
    let result_metadata = match version {
        ProtocolVersion::V1 => ResultMetadata::default(),
        ProtocolVersion::V2 => deser_result_metadata(buf)?,
    };
    if prepared_metadata.paging_state.is_some() || result_metadata.paging_state.is_some() {
        return Err(ParseError::BadIncomingData {
            opcode: ResponseOpcode::Result,
            reason: "PREPARED result carries a paging state".to_owned(),
        });
    }

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    Ok(SchemaChange {
        change: types::read_string(buf)?.to_owned(),
        keyspace: types::read_string(buf)?.to_owned(),
        table: types::read_string(buf)?.to_owned(),
    })
}

pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(version, buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        kind => return Err(ParseError::UnknownResultKind(kind)),
    })
}
