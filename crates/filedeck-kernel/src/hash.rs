//! Hash tokens: the only identifiers clients ever see.
//!
//! A token is `<volume id><base64url(backend id)>`. Volume ids end in
//! [`SEPARATOR`] and contain it nowhere else, so decoding splits on its
//! first occurrence.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use md5::{Digest, Md5};
use thiserror::Error;

/// Reserved character closing every volume id.
pub const SEPARATOR: char = '_';

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Malformed hash tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    #[error("hash has no volume separator: {0}")]
    MissingSeparator(String),

    #[error("unknown volume: {0}")]
    UnknownVolume(String),

    #[error("invalid hash encoding: {0}")]
    InvalidEncoding(String),

    #[error("hash does not decode to UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Encode a backend id under a volume id.
pub fn encode(volume_id: &str, backend_id: &str) -> String {
    format!("{volume_id}{}", URL_SAFE_NO_PAD.encode(backend_id))
}

/// Split a token into its volume id (separator included) and backend id.
///
/// Pure: no lookup happens here, see [`VolumeRegistry::unhash`].
///
/// [`VolumeRegistry::unhash`]: crate::registry::VolumeRegistry::unhash
pub fn decode(token: &str) -> Result<(&str, String), HashError> {
    let split = token
        .find(SEPARATOR)
        .ok_or_else(|| HashError::MissingSeparator(token.to_string()))?;
    let (volume_id, encoded) = token.split_at(split + SEPARATOR.len_utf8());
    let encoded = encoded.replace('.', "=");
    let bytes = LENIENT
        .decode(encoded.as_bytes())
        .map_err(|_| HashError::InvalidEncoding(token.to_string()))?;
    let id = String::from_utf8(bytes).map_err(|_| HashError::InvalidUtf8(token.to_string()))?;
    Ok((volume_id, id))
}

/// Lowercase hex md5 of some bytes.
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Md5::digest(data.as_ref()))
}
