//! Payload byte codec.
//!
//! All wire-visible values are encoded with bincode; decode failures
//! surface as [`crate::ErrorKind::WireDecode`].

use crate::error::{Error, ErrorKind, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to payload bytes.
pub(crate) fn encode<T: Serialize + ?Sized>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v)
        .map_err(|e| Error::new(ErrorKind::WireDecode).with_context("encode").with_source(e))
}

/// Decodes a value from payload bytes.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::new(ErrorKind::WireDecode).with_context("decode").with_source(e))
}
