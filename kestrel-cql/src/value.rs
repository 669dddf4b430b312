//! Conversion between Rust values and the CQL value encoding.
//!
//! A value is marshalled against the [`ColumnType`] the server announced for
//! the bind marker or column it belongs to. `None` on the wire is a null.
//!
//! Collections use the protocol v1/v2 layout: a 16-bit element count followed
//! by elements prefixed with a 16-bit length. Neither the count nor a single
//! element may exceed 65,535.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::response::result::ColumnType;

/// A value that can be sent to the server.
pub trait Marshal {
    /// Encodes `self` as a value of type `typ`. `Ok(None)` encodes a null.
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError>;
}

/// A destination a received cell can be decoded into.
pub trait Unmarshal: Send {
    /// Overwrites `self` with the decoding of `data`, a cell of type `typ`.
    /// `None` is a null cell.
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("can not marshal {rust_name} into {typ}")]
    TypeMismatch {
        rust_name: &'static str,
        typ: ColumnType,
    },
    #[error("marshal: value {value} out of range for {typ}")]
    OutOfRange { value: i64, typ: ColumnType },
    #[error("marshal: {what} too large ({len} > 65535)")]
    TooLarge { what: &'static str, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnmarshalError {
    #[error("can not unmarshal {typ} into {rust_name}")]
    TypeMismatch {
        rust_name: &'static str,
        typ: ColumnType,
    },
    #[error("unmarshal {typ}: expected {expected} bytes, got {received}")]
    BadLength {
        typ: ColumnType,
        expected: usize,
        received: usize,
    },
    #[error("unmarshal {0}: unexpected eof")]
    UnexpectedEof(ColumnType),
    #[error("unmarshal {0}: invalid UTF-8")]
    BadUtf8(ColumnType),
    #[error("unmarshal {0}: value does not fit the destination")]
    Overflow(ColumnType),
}

fn marshal_mismatch(rust_name: &'static str, typ: &ColumnType) -> MarshalError {
    MarshalError::TypeMismatch {
        rust_name,
        typ: typ.clone(),
    }
}

fn unmarshal_mismatch(rust_name: &'static str, typ: &ColumnType) -> UnmarshalError {
    UnmarshalError::TypeMismatch {
        rust_name,
        typ: typ.clone(),
    }
}

// An empty cell is the "empty value" of fixed-width types and decodes as zero.
fn fixed<const N: usize>(typ: &ColumnType, data: &[u8]) -> Result<Option<[u8; N]>, UnmarshalError> {
    if data.is_empty() {
        return Ok(None);
    }
    data.try_into()
        .map(Some)
        .map_err(|_| UnmarshalError::BadLength {
            typ: typ.clone(),
            expected: N,
            received: data.len(),
        })
}

fn encode_varint(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (head, next) = (bytes[start], bytes[start + 1]);
        let redundant = (head == 0x00 && next & 0x80 == 0) || (head == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn decode_varint(typ: &ColumnType, data: &[u8]) -> Result<i64, UnmarshalError> {
    if data.len() > 8 {
        return Err(UnmarshalError::Overflow(typ.clone()));
    }
    let Some(first) = data.first() else {
        return Ok(0);
    };
    let mut buf = if first & 0x80 != 0 { [0xff; 8] } else { [0; 8] };
    buf[8 - data.len()..].copy_from_slice(data);
    Ok(i64::from_be_bytes(buf))
}

fn write_collection_len(len: usize, what: &'static str, out: &mut Vec<u8>) -> Result<(), MarshalError> {
    let len = u16::try_from(len).map_err(|_| MarshalError::TooLarge { what, len })?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn write_collection_item(
    item: &dyn Marshal,
    typ: &ColumnType,
    out: &mut Vec<u8>,
) -> Result<(), MarshalError> {
    let bytes = item.marshal(typ)?.unwrap_or_default();
    write_collection_len(bytes.len(), "collection item", out)?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn read_collection_len(typ: &ColumnType, data: &mut &[u8]) -> Result<usize, UnmarshalError> {
    let Some((len, rest)) = data.split_first_chunk::<2>() else {
        return Err(UnmarshalError::UnexpectedEof(typ.clone()));
    };
    *data = rest;
    Ok(u16::from_be_bytes(*len) as usize)
}

fn read_collection_item<'a>(typ: &ColumnType, data: &mut &'a [u8]) -> Result<&'a [u8], UnmarshalError> {
    let len = read_collection_len(typ, data)?;
    if data.len() < len {
        return Err(UnmarshalError::UnexpectedEof(typ.clone()));
    }
    let (item, rest) = data.split_at(len);
    *data = rest;
    Ok(item)
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        (**self).marshal(typ)
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match self {
            Some(v) => v.marshal(typ),
            None => Ok(None),
        }
    }
}

impl<T: Unmarshal + Default> Unmarshal for Option<T> {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        *self = match data {
            None => None,
            Some(data) => {
                let mut value = T::default();
                value.unmarshal(typ, Some(data))?;
                Some(value)
            }
        };
        Ok(())
    }
}

impl Marshal for bool {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Boolean => Ok(Some(vec![*self as u8])),
            _ => Err(marshal_mismatch("bool", typ)),
        }
    }
}

impl Unmarshal for bool {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::Boolean => {
                *self = fixed::<1>(typ, data.unwrap_or_default())?.is_some_and(|[b]| b != 0);
                Ok(())
            }
            _ => Err(unmarshal_mismatch("bool", typ)),
        }
    }
}

impl Marshal for i32 {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Int => Ok(Some(self.to_be_bytes().to_vec())),
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Varint => {
                (*self as i64).marshal(typ)
            }
            _ => Err(marshal_mismatch("i32", typ)),
        }
    }
}

impl Unmarshal for i32 {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::Int => {
                *self = fixed::<4>(typ, data.unwrap_or_default())?.map_or(0, i32::from_be_bytes);
                Ok(())
            }
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Varint => {
                let mut wide = 0i64;
                wide.unmarshal(typ, data)?;
                *self = i32::try_from(wide).map_err(|_| UnmarshalError::Overflow(typ.clone()))?;
                Ok(())
            }
            _ => Err(unmarshal_mismatch("i32", typ)),
        }
    }
}

impl Marshal for i64 {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Timestamp => {
                Ok(Some(self.to_be_bytes().to_vec()))
            }
            ColumnType::Int => i32::try_from(*self)
                .map_err(|_| MarshalError::OutOfRange {
                    value: *self,
                    typ: typ.clone(),
                })?
                .marshal(typ),
            ColumnType::Varint => Ok(Some(encode_varint(*self))),
            _ => Err(marshal_mismatch("i64", typ)),
        }
    }
}

impl Unmarshal for i64 {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        let data = data.unwrap_or_default();
        *self = match typ {
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Timestamp => {
                fixed::<8>(typ, data)?.map_or(0, i64::from_be_bytes)
            }
            ColumnType::Int => fixed::<4>(typ, data)?.map_or(0, i32::from_be_bytes) as i64,
            ColumnType::Varint => decode_varint(typ, data)?,
            _ => return Err(unmarshal_mismatch("i64", typ)),
        };
        Ok(())
    }
}

impl Marshal for f32 {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Float => Ok(Some(self.to_be_bytes().to_vec())),
            _ => Err(marshal_mismatch("f32", typ)),
        }
    }
}

impl Unmarshal for f32 {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::Float => {
                *self = fixed::<4>(typ, data.unwrap_or_default())?.map_or(0.0, f32::from_be_bytes);
                Ok(())
            }
            _ => Err(unmarshal_mismatch("f32", typ)),
        }
    }
}

impl Marshal for f64 {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Double => Ok(Some(self.to_be_bytes().to_vec())),
            _ => Err(marshal_mismatch("f64", typ)),
        }
    }
}

impl Unmarshal for f64 {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::Double => {
                *self = fixed::<8>(typ, data.unwrap_or_default())?.map_or(0.0, f64::from_be_bytes);
                Ok(())
            }
            _ => Err(unmarshal_mismatch("f64", typ)),
        }
    }
}

impl Marshal for str {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Ascii | ColumnType::Text | ColumnType::Varchar | ColumnType::Blob => {
                Ok(Some(self.as_bytes().to_vec()))
            }
            _ => Err(marshal_mismatch("&str", typ)),
        }
    }
}

impl Marshal for String {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        self.as_str().marshal(typ)
    }
}

impl Unmarshal for String {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::Ascii | ColumnType::Text | ColumnType::Varchar | ColumnType::Blob => {
                let text = std::str::from_utf8(data.unwrap_or_default())
                    .map_err(|_| UnmarshalError::BadUtf8(typ.clone()))?;
                self.clear();
                self.push_str(text);
                Ok(())
            }
            _ => Err(unmarshal_mismatch("String", typ)),
        }
    }
}

impl Marshal for Bytes {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Blob
            | ColumnType::Custom(_)
            | ColumnType::Decimal
            | ColumnType::Varint
            | ColumnType::Ascii
            | ColumnType::Text
            | ColumnType::Varchar => Ok(Some(self.to_vec())),
            _ => Err(marshal_mismatch("Bytes", typ)),
        }
    }
}

impl Unmarshal for Bytes {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::List(_) | ColumnType::Set(_) | ColumnType::Map(_, _) => {
                Err(unmarshal_mismatch("Bytes", typ))
            }
            // Any scalar cell can be read raw.
            _ => {
                *self = Bytes::copy_from_slice(data.unwrap_or_default());
                Ok(())
            }
        }
    }
}

impl Marshal for Uuid {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match typ {
            ColumnType::Uuid | ColumnType::TimeUuid => Ok(Some(self.as_bytes().to_vec())),
            _ => Err(marshal_mismatch("Uuid", typ)),
        }
    }
}

impl Unmarshal for Uuid {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        match typ {
            ColumnType::Uuid | ColumnType::TimeUuid => {
                *self = fixed::<16>(typ, data.unwrap_or_default())?.map_or(Uuid::nil(), Uuid::from_bytes);
                Ok(())
            }
            _ => Err(unmarshal_mismatch("Uuid", typ)),
        }
    }
}

impl Marshal for IpAddr {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match (typ, self) {
            (ColumnType::Inet, IpAddr::V4(v4)) => Ok(Some(v4.octets().to_vec())),
            (ColumnType::Inet, IpAddr::V6(v6)) => Ok(Some(v6.octets().to_vec())),
            _ => Err(marshal_mismatch("IpAddr", typ)),
        }
    }
}

impl Unmarshal for IpAddr {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        if *typ != ColumnType::Inet {
            return Err(unmarshal_mismatch("IpAddr", typ));
        }
        let data = data.unwrap_or_default();
        *self = match data.len() {
            0 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            4 => IpAddr::from(fixed::<4>(typ, data)?.unwrap_or_default()),
            16 => IpAddr::from(fixed::<16>(typ, data)?.unwrap_or_default()),
            received => {
                return Err(UnmarshalError::BadLength {
                    typ: typ.clone(),
                    expected: 16,
                    received,
                })
            }
        };
        Ok(())
    }
}

fn marshal_items<'a, T: Marshal + 'a>(
    items: impl ExactSizeIterator<Item = &'a T>,
    typ: &ColumnType,
) -> Result<Option<Vec<u8>>, MarshalError> {
    let elem = match typ {
        ColumnType::List(elem) | ColumnType::Set(elem) => elem,
        _ => return Err(marshal_mismatch("list", typ)),
    };
    let mut out = Vec::new();
    write_collection_len(items.len(), "list", &mut out)?;
    for item in items {
        write_collection_item(item, elem, &mut out)?;
    }
    Ok(Some(out))
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        marshal_items(self.iter(), typ)
    }
}

impl<T: Marshal> Marshal for [T] {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        marshal_items(self.iter(), typ)
    }
}

impl<T: Unmarshal + Default> Unmarshal for Vec<T> {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        let elem = match typ {
            ColumnType::List(elem) | ColumnType::Set(elem) => elem,
            _ => return Err(unmarshal_mismatch("Vec", typ)),
        };
        self.clear();
        let Some(mut data) = data else {
            return Ok(());
        };
        let count = read_collection_len(typ, &mut data)?;
        self.reserve(count.min(data.len()));
        for _ in 0..count {
            let item = read_collection_item(typ, &mut data)?;
            let mut value = T::default();
            value.unmarshal(elem, Some(item))?;
            self.push(value);
        }
        Ok(())
    }
}

impl<K: Marshal, V: Marshal, S: BuildHasher> Marshal for HashMap<K, V, S> {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        let ColumnType::Map(key_type, value_type) = typ else {
            return Err(marshal_mismatch("HashMap", typ));
        };
        let mut out = Vec::new();
        write_collection_len(self.len(), "map", &mut out)?;
        for (key, value) in self {
            write_collection_item(key, key_type, &mut out)?;
            write_collection_item(value, value_type, &mut out)?;
        }
        Ok(Some(out))
    }
}

impl<K, V, S> Unmarshal for HashMap<K, V, S>
where
    K: Unmarshal + Default + Eq + Hash,
    V: Unmarshal + Default,
    S: BuildHasher + Send,
{
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        let ColumnType::Map(key_type, value_type) = typ else {
            return Err(unmarshal_mismatch("HashMap", typ));
        };
        self.clear();
        let Some(mut data) = data else {
            return Ok(());
        };
        let count = read_collection_len(typ, &mut data)?;
        for _ in 0..count {
            let mut key = K::default();
            key.unmarshal(key_type, Some(read_collection_item(typ, &mut data)?))?;
            let mut value = V::default();
            value.unmarshal(value_type, Some(read_collection_item(typ, &mut data)?))?;
            self.insert(key, value);
        }
        Ok(())
    }
}

/// A scan destination that accepts any cell and discards it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Skip;

impl Unmarshal for Skip {
    fn unmarshal(&mut self, _typ: &ColumnType, _data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        Ok(())
    }
}

/// A dynamically typed CQL value, used when the shape of a row is only known
/// at runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    BigInt(i64),
    Blob(Bytes),
    Boolean(bool),
    Counter(i64),
    /// Raw decimal encoding: a 32-bit scale followed by the unscaled varint.
    Decimal(Bytes),
    Double(f64),
    Float(f32),
    Int(i32),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Text(String),
    Uuid(Uuid),
    TimeUuid(Uuid),
    /// Raw two's complement big-endian integer.
    Varint(Bytes),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Custom(Bytes),
    /// A zero-length cell of a fixed-width type.
    #[default]
    Empty,
}

impl CqlValue {
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) | Self::Counter(i) | Self::Timestamp(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Self::Blob(b) | Self::Custom(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::TimeUuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Decodes a non-null cell of type `typ`.
    pub fn decode(typ: &ColumnType, data: &[u8]) -> Result<CqlValue, UnmarshalError> {
        fn scalar<T: Unmarshal + Default>(typ: &ColumnType, data: &[u8]) -> Result<T, UnmarshalError> {
            let mut value = T::default();
            value.unmarshal(typ, Some(data))?;
            Ok(value)
        }

        let fixed_width = !matches!(
            typ,
            ColumnType::Ascii
                | ColumnType::Text
                | ColumnType::Varchar
                | ColumnType::Blob
                | ColumnType::Custom(_)
                | ColumnType::List(_)
                | ColumnType::Set(_)
                | ColumnType::Map(_, _)
        );
        if fixed_width && data.is_empty() {
            return Ok(CqlValue::Empty);
        }

        Ok(match typ {
            ColumnType::Ascii => CqlValue::Ascii(scalar(typ, data)?),
            ColumnType::Text | ColumnType::Varchar => CqlValue::Text(scalar(typ, data)?),
            ColumnType::Blob => CqlValue::Blob(Bytes::copy_from_slice(data)),
            ColumnType::Custom(_) => CqlValue::Custom(Bytes::copy_from_slice(data)),
            ColumnType::Decimal => CqlValue::Decimal(Bytes::copy_from_slice(data)),
            ColumnType::Varint => CqlValue::Varint(Bytes::copy_from_slice(data)),
            ColumnType::Boolean => CqlValue::Boolean(scalar(typ, data)?),
            ColumnType::Int => CqlValue::Int(scalar(typ, data)?),
            ColumnType::BigInt => CqlValue::BigInt(scalar(typ, data)?),
            ColumnType::Counter => CqlValue::Counter(scalar(typ, data)?),
            ColumnType::Timestamp => CqlValue::Timestamp(scalar(typ, data)?),
            ColumnType::Float => CqlValue::Float(scalar(typ, data)?),
            ColumnType::Double => CqlValue::Double(scalar(typ, data)?),
            ColumnType::Uuid => CqlValue::Uuid(scalar(typ, data)?),
            ColumnType::TimeUuid => CqlValue::TimeUuid(scalar(typ, data)?),
            ColumnType::Inet => {
                let mut ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
                ip.unmarshal(typ, Some(data))?;
                CqlValue::Inet(ip)
            }
            ColumnType::List(elem) | ColumnType::Set(elem) => {
                let mut data = data;
                let count = read_collection_len(typ, &mut data)?;
                let mut items = Vec::with_capacity(count.min(data.len()));
                for _ in 0..count {
                    items.push(CqlValue::decode(elem, read_collection_item(typ, &mut data)?)?);
                }
                if matches!(typ, ColumnType::Set(_)) {
                    CqlValue::Set(items)
                } else {
                    CqlValue::List(items)
                }
            }
            ColumnType::Map(key_type, value_type) => {
                let mut data = data;
                let count = read_collection_len(typ, &mut data)?;
                let mut entries = Vec::with_capacity(count.min(data.len()));
                for _ in 0..count {
                    let key = CqlValue::decode(key_type, read_collection_item(typ, &mut data)?)?;
                    let value = CqlValue::decode(value_type, read_collection_item(typ, &mut data)?)?;
                    entries.push((key, value));
                }
                CqlValue::Map(entries)
            }
        })
    }
}

impl Unmarshal for CqlValue {
    fn unmarshal(&mut self, typ: &ColumnType, data: Option<&[u8]>) -> Result<(), UnmarshalError> {
        *self = match data {
            Some(data) => CqlValue::decode(typ, data)?,
            None => CqlValue::Empty,
        };
        Ok(())
    }
}

impl Marshal for CqlValue {
    fn marshal(&self, typ: &ColumnType) -> Result<Option<Vec<u8>>, MarshalError> {
        match (self, typ) {
            (CqlValue::Empty, _) => Ok(Some(Vec::new())),
            (CqlValue::Ascii(s) | CqlValue::Text(s), _) => s.marshal(typ),
            (CqlValue::Boolean(b), _) => b.marshal(typ),
            (CqlValue::Int(i), _) => i.marshal(typ),
            (CqlValue::BigInt(i) | CqlValue::Counter(i) | CqlValue::Timestamp(i), _) => {
                i.marshal(typ)
            }
            (CqlValue::Float(f), _) => f.marshal(typ),
            (CqlValue::Double(d), _) => d.marshal(typ),
            (CqlValue::Uuid(u) | CqlValue::TimeUuid(u), _) => u.marshal(typ),
            (CqlValue::Inet(ip), _) => ip.marshal(typ),
            (CqlValue::Blob(b) | CqlValue::Custom(b), _) => b.marshal(typ),
            (CqlValue::Decimal(b), ColumnType::Decimal) | (CqlValue::Varint(b), ColumnType::Varint) => {
                Ok(Some(b.to_vec()))
            }
            (CqlValue::List(items) | CqlValue::Set(items), _) => items.marshal(typ),
            (CqlValue::Map(entries), ColumnType::Map(key_type, value_type)) => {
                let mut out = Vec::new();
                write_collection_len(entries.len(), "map", &mut out)?;
                for (key, value) in entries {
                    write_collection_item(key, key_type, &mut out)?;
                    write_collection_item(value, value_type, &mut out)?;
                }
                Ok(Some(out))
            }
            _ => Err(marshal_mismatch("CqlValue", typ)),
        }
    }
}
