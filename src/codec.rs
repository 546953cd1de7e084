//! JSON wire codec.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serializer options applied to every payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerializerOptions {
    /// Emit indented JSON (debugging aid; larger messages).
    pub pretty: bool,
}

/// Encodes and decodes message payloads as UTF-8 JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    options: SerializerOptions,
}

impl JsonCodec {
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> serde_json::Result<Vec<u8>> {
        if self.options.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> serde_json::Result<T> {
        serde_json::from_slice(payload)
    }
}
