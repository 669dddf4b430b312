//! Statements sent through a [`Session`](crate::Session): single queries and batches.

use std::sync::Arc;

use bytes::Bytes;
use kestrel_cql::frame::response::result::ColumnSpec;
use kestrel_cql::value::{CqlValue, Marshal};

use crate::errors::{BadQuery, QueryError};
use crate::network::PreparedInfo;

pub mod batch;
pub mod query;

pub use kestrel_cql::frame::request::batch::BatchType;
pub use kestrel_cql::Consistency;

/// A value bound to a bind marker.
pub type BoundValue = Arc<dyn Marshal + Send + Sync>;

/// Computes bound values once the bind markers of the prepared statement
/// are known.
pub type Binder = Arc<dyn Fn(&PreparedInfo) -> Result<Vec<BoundValue>, QueryError> + Send + Sync>;

/// Conversion of a list of values into [`BoundValue`]s.
///
/// Implemented for `()`, tuples of up to 16 elements and `Vec<BoundValue>`.
pub trait IntoValues {
    /// Converts `self` into bound values, in bind marker order.
    fn into_values(self) -> Vec<BoundValue>;
}

impl IntoValues for Vec<BoundValue> {
    fn into_values(self) -> Vec<BoundValue> {
        self
    }
}

impl IntoValues for Vec<CqlValue> {
    fn into_values(self) -> Vec<BoundValue> {
        self.into_iter()
            .map(|value| Arc::new(value) as BoundValue)
            .collect()
    }
}

macro_rules! impl_into_values_for_tuple {
    ($($T:ident),*) => {
        impl<$($T),*> IntoValues for ($($T,)*)
        where
            $($T: Marshal + Send + Sync + 'static),*
        {
            #[allow(non_snake_case)]
            fn into_values(self) -> Vec<BoundValue> {
                let ($($T,)*) = self;
                vec![$(Arc::new($T) as BoundValue),*]
            }
        }
    };
}

impl IntoValues for () {
    fn into_values(self) -> Vec<BoundValue> {
        Vec::new()
    }
}

impl_into_values_for_tuple!(T0);
impl_into_values_for_tuple!(T0, T1);
impl_into_values_for_tuple!(T0, T1, T2);
impl_into_values_for_tuple!(T0, T1, T2, T3);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13);
impl_into_values_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14);
impl_into_values_for_tuple!(
    T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15
);

/// Encodes `values` against the bind markers `args`.
pub(crate) fn marshal_values(
    values: &[BoundValue],
    args: &[ColumnSpec],
) -> Result<Vec<Option<Bytes>>, QueryError> {
    if values.len() != args.len() {
        return Err(BadQuery::ArgLength {
            expected: args.len(),
            got: values.len(),
        }
        .into());
    }
    values
        .iter()
        .zip(args)
        .map(|(value, arg)| Ok(value.marshal(&arg.typ)?.map(Bytes::from)))
        .collect()
}

/// Whether `stmt` is worth preparing: SELECT, INSERT, UPDATE, DELETE and
/// BATCH statements are, anything else is sent as plain text.
pub(crate) fn should_prepare(stmt: &str) -> bool {
    let stmt = stmt
        .trim_end_matches(|c: char| c.is_whitespace() || c == ';')
        .trim_start();
    let Some((first, _)) = stmt.split_once(char::is_whitespace) else {
        return false;
    };
    let mut kind = first.to_lowercase();
    if kind == "begin" {
        if let Some((_, last)) = stmt.rsplit_once(char::is_whitespace) {
            kind = last.to_lowercase();
        }
    }
    matches!(
        kind.as_str(),
        "select" | "insert" | "update" | "delete" | "batch"
    )
}
