//! Payload decoding for submitted files.
//!
//! The filename suffix selects the encoding: `.gz.b64` is gzip inside
//! standard base64, `.b64` is plain base64, anything else is taken as-is.
//! The suffix is stripped from the name the bytes are stored under.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;
use std::io::Read;
use thiserror::Error;

const GZ_B64_SUFFIX: &str = ".gz.b64";
const B64_SUFFIX: &str = ".b64";
/// Ceiling on one decompressed file.
pub const MAX_DECODED_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{name}: invalid base64: {message}")]
    Base64 { name: String, message: String },
    #[error("{name}: invalid gzip stream: {message}")]
    Gzip { name: String, message: String },
    #[error("{name}: decompresses past {limit} bytes")]
    TooLarge { name: String, limit: u64 },
    #[error("{0:?}: empty file name")]
    EmptyName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Base64,
    GzipBase64,
}

impl Encoding {
    /// Encoding named by `name`'s suffix, and the name without it.
    pub fn of(name: &str) -> (Self, &str) {
        if let Some(stem) = name.strip_suffix(GZ_B64_SUFFIX) {
            (Self::GzipBase64, stem)
        } else if let Some(stem) = name.strip_suffix(B64_SUFFIX) {
            (Self::Base64, stem)
        } else {
            (Self::Raw, name)
        }
    }
}

/// Decode one submitted file. Returns the stored name and its bytes.
pub fn decode_payload(name: &str, payload: &str) -> Result<(String, Vec<u8>), CodecError> {
    let (encoding, stem) = Encoding::of(name);
    if stem.is_empty() {
        return Err(CodecError::EmptyName(name.to_string()));
    }
    let bytes = match encoding {
        Encoding::Raw => payload.as_bytes().to_vec(),
        Encoding::Base64 => decode_base64(name, payload)?,
        Encoding::GzipBase64 => {
            gunzip_limited(name, &decode_base64(name, payload)?, MAX_DECODED_BYTES)?
        }
    };
    Ok((stem.to_string(), bytes))
}

/// Standard-alphabet base64, surrounding whitespace ignored.
pub fn decode_base64(name: &str, payload: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| CodecError::Base64 {
            name: name.to_string(),
            message: e.to_string(),
        })
}

fn gunzip_limited(name: &str, compressed: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    // one byte past the limit tells "exactly at" from "over"
    GzDecoder::new(compressed)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Gzip {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    if out.len() as u64 > limit {
        return Err(CodecError::TooLarge {
            name: name.to_string(),
            limit,
        });
    }
    Ok(out)
}
