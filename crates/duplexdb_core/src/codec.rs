//! CBOR helpers for entries and transactions.

use crate::error::{DatabaseError, DatabaseResult};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes a value to CBOR bytes.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> DatabaseResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| DatabaseError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR bytes.
pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> DatabaseResult<T> {
    ciborium::from_reader(bytes).map_err(|e| DatabaseError::codec(e.to_string()))
}
