//! Value serialization for the typed backend helpers.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheResult;

/// Converts typed values to and from the opaque bytes a store keeps.
pub trait ValueCodec: Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Bytes>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T>;
}

/// Default codec: JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
