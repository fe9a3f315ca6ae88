//! Snapshot codec for the last applied remote object.
//!
//! The snapshot lives in the resource status as `gzip(json)` wrapped in
//! standard base64 so it survives any string-typed persistence layer.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors from encoding or decoding a snapshot.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be serialized or the payload is not valid JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),

    /// The stored string is not valid base64.
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encode `value` into a snapshot string.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    Ok(STANDARD.encode(compressed))
}

/// Decode a snapshot string. An empty string means no snapshot was taken yet.
pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<Option<T>, CodecError> {
    if encoded.is_empty() {
        return Ok(None);
    }

    let compressed = STANDARD.decode(encoded)?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;

    Ok(Some(serde_json::from_slice(&json)?))
}
