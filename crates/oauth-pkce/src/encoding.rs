//! URL-safe base64 codec for PKCE material and token payloads
//!
//! Output never carries padding. Input to `decode` may carry trailing `=`
//! padding; it is stripped before decoding.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{Error, Result};

/// Encode bytes as unpadded base64url.
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode unpadded (or padded) base64url text.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text.trim_end_matches('='))
        .map_err(|e| Error::Decoding(format!("invalid base64url input: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_empty_input() {
        assert_eq!(encode(&[]), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn roundtrip_single_byte() {
        let encoded = encode(&[0xfb]);
        assert_eq!(encoded, "-w");
        assert_eq!(decode(&encoded).unwrap(), vec![0xfb]);
    }

    #[test]
    fn roundtrip_every_byte_value() {
        let bytes: Vec<u8> = (0..=255).collect();
        let encoded = encode(&bytes);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn decode_accepts_padded_input() {
        assert_eq!(decode("aGk=").unwrap(), b"hi");
    }

    #[test]
    fn decode_rejects_standard_alphabet() {
        let err = decode("ab+/").unwrap_err();
        assert!(matches!(err, Error::Decoding(_)), "got {err:?}");
    }

    #[test]
    fn decode_rejects_invalid_characters() {
        assert!(decode("not base64!").is_err());
    }
}
