//! Stream identifier encodings.
//!
//! The API surface carries stream ids as URL-safe base64 without padding.
//! The crypto primitive derives stream keys from the standard, padded base64
//! form of the same bytes. Both the encryption and the decryption paths go
//! through this module; deriving from the wrong form silently yields the
//! wrong key.

use std::fmt;

use base64::{
    alphabet,
    engine::{
        general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD},
        DecodePaddingMode,
    },
    Engine as _,
};

use crate::error::{AgentlessError, Result};

const URL_SAFE_API: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Standard-encoding stream id. Only ever handed to the crypto primitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKeyId(String);

impl StreamKeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert an API-facing stream id into the key-derivation form.
///
/// Message records returned by some backends already carry the standard
/// alphabet; those are accepted too since they name the same bytes.
/// Non-zero trailing bits in the last symbol are tolerated and dropped, so
/// only canonical ids convert back to exactly the input.
pub fn to_key_id(api_stream_id: &str) -> Result<StreamKeyId> {
    let bytes = decode_stream_bytes(api_stream_id)?;
    Ok(StreamKeyId(STANDARD.encode(bytes)))
}

/// Convert a key-derivation form back into the URL-safe API form.
pub fn to_api_id(key_id: &str) -> Result<String> {
    let bytes = STANDARD_LENIENT
        .decode(key_id)
        .map_err(|e| invalid(key_id, &e.to_string()))?;
    if bytes.is_empty() {
        return Err(invalid(key_id, "empty"));
    }
    Ok(URL_SAFE_API.encode(bytes))
}

fn decode_stream_bytes(stream_id: &str) -> Result<Vec<u8>> {
    if stream_id.is_empty() {
        return Err(invalid(stream_id, "empty"));
    }
    let decoded = match URL_SAFE_API.decode(stream_id) {
        Ok(bytes) => bytes,
        Err(_) if stream_id.contains(['+', '/']) => STANDARD_LENIENT
            .decode(stream_id)
            .map_err(|e| invalid(stream_id, &e.to_string()))?,
        Err(e) => return Err(invalid(stream_id, &e.to_string())),
    };
    if decoded.is_empty() {
        return Err(invalid(stream_id, "empty"));
    }
    Ok(decoded)
}

fn invalid(stream_id: &str, reason: &str) -> AgentlessError {
    AgentlessError::InvalidStreamIdentifier(format!("{stream_id:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use proptest::prelude::*;

    const API_ID: &str = "v7ZTHzpNvFu2ADUrwIq0AH___or-SZVqdA";

    #[test]
    fn api_id_maps_to_padded_standard_form() {
        let key_id = to_key_id(API_ID).unwrap();
        assert_eq!(key_id.as_str(), "v7ZTHzpNvFu2ADUrwIq0AH///or+SZVqdA==");
        assert_eq!(to_api_id(key_id.as_str()).unwrap(), API_ID);
    }

    #[test]
    fn standard_form_input_names_the_same_stream() {
        let from_standard = to_key_id("v7ZTHzpNvFu2ADUrwIq0AH///or+SZVqdA==").unwrap();
        assert_eq!(from_standard, to_key_id(API_ID).unwrap());
    }

    #[test]
    fn non_canonical_trailing_bits_are_tolerated() {
        let key_id = to_key_id("abc123_urlsafe").unwrap();
        assert_eq!(key_id, to_key_id(&to_api_id(key_id.as_str()).unwrap()).unwrap());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for bad in ["", "not base64!", "a", "===="] {
            assert!(
                matches!(to_key_id(bad), Err(AgentlessError::InvalidStreamIdentifier(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    proptest! {
        #[test]
        fn api_id_survives_key_id_conversion(bytes in proptest::collection::vec(any::<u8>(), 1..64)) {
            let api_id = URL_SAFE_NO_PAD.encode(&bytes);
            let key_id = to_key_id(&api_id).unwrap();
            prop_assert_eq!(to_api_id(key_id.as_str()).unwrap(), api_id);
        }
    }
}
