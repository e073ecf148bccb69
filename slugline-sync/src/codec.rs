//! Transport codec for binary CRDT updates.
//!
//! The backend stores update payloads as text, so outgoing Yrs deltas are
//! base64-encoded before append and decoded again when they come back over
//! the change feed:
//!
//! ```text
//! ┌──────────┐  encode (base64)  ┌─────────────────┐
//! │ Yrs bytes│ ────────────────► │ transport string │ ──► backend row
//! │ (opaque) │ ◄──────────────── │                  │ ◄── change feed
//! └──────────┘  decode           └─────────────────┘
//! ```
//!
//! Validation is two-layered: size/emptiness checks here, and a structural
//! check that applies the candidate bytes to a scratch [`yrs::Doc`]. The
//! binary layout is an implementation detail of Yrs, so a trial apply is the
//! only reliable way to reject a malformed delta.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

use crate::update::UpdatePayload;

/// Maximum accepted size for an outgoing update at encode time.
pub const MAX_ENCODE_BYTES: usize = 100 * 1024;

/// Ceiling for any update accepted off the wire, regardless of direction.
pub const MAX_TRANSPORT_BYTES: usize = 1024 * 1024;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Zero-length payload — an empty delta is never valid.
    Empty,
    /// Payload exceeds the applicable size limit.
    TooLarge { size: usize, limit: usize },
    /// Transport string is not valid base64.
    InvalidEncoding(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Empty => write!(f, "Empty update payload"),
            CodecError::TooLarge { size, limit } => {
                write!(
                    f,
                    "Update payload of {size} bytes exceeds limit of {limit} bytes"
                )
            }
            CodecError::InvalidEncoding(e) => write!(f, "Invalid transport encoding: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode an outgoing update as a transport string.
///
/// Rejects empty payloads and anything above [`MAX_ENCODE_BYTES`].
pub fn encode(payload: &UpdatePayload) -> Result<String, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Empty);
    }
    if payload.len() > MAX_ENCODE_BYTES {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            limit: MAX_ENCODE_BYTES,
        });
    }
    Ok(BASE64.encode(payload.as_bytes()))
}

/// Decode a transport string back into update bytes.
///
/// Rejects empty strings, invalid base64, and payloads above
/// [`MAX_TRANSPORT_BYTES`].
pub fn decode(transport: &str) -> Result<UpdatePayload, CodecError> {
    if transport.is_empty() {
        return Err(CodecError::Empty);
    }
    let bytes = BASE64
        .decode(transport)
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    if bytes.len() > MAX_TRANSPORT_BYTES {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            limit: MAX_TRANSPORT_BYTES,
        });
    }
    Ok(UpdatePayload::new(bytes))
}

/// Structural validation of candidate update bytes.
///
/// Returns false for empty or oversized input, and for anything a scratch
/// Yrs document refuses to decode or apply. The scratch document is
/// discarded afterwards; validation never touches live state.
pub fn validate(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.len() > MAX_TRANSPORT_BYTES {
        return false;
    }
    let update = match Update::decode_v1(bytes) {
        Ok(update) => update,
        Err(_) => return false,
    };
    let scratch = Doc::new();
    let mut txn = scratch.transact_mut();
    txn.apply_update(update).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, ReadTxn, Text, WriteTxn};

    fn sample_update(content: &str) -> UpdatePayload {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("body");
            text.insert(&mut txn, 0, content);
        }
        let bytes = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&yrs::StateVector::default())
        };
        UpdatePayload::new(bytes)
    }

    #[test]
    fn test_roundtrip_small() {
        let payload = UpdatePayload::new(vec![1, 2, 3, 4, 5]);
        let transport = encode(&payload).unwrap();
        let back = decode(&transport).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_roundtrip_1kb() {
        let payload = UpdatePayload::new((0..1024).map(|i| (i % 251) as u8).collect());
        let transport = encode(&payload).unwrap();
        assert_eq!(decode(&transport).unwrap(), payload);
    }

    #[test]
    fn test_encode_empty_rejected() {
        let err = encode(&UpdatePayload::new(Vec::new())).unwrap_err();
        assert_eq!(err, CodecError::Empty);
    }

    #[test]
    fn test_encode_oversized_rejected() {
        let payload = UpdatePayload::new(vec![0u8; MAX_ENCODE_BYTES + 1]);
        match encode(&payload).unwrap_err() {
            CodecError::TooLarge { size, limit } => {
                assert_eq!(size, MAX_ENCODE_BYTES + 1);
                assert_eq!(limit, MAX_ENCODE_BYTES);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode("not base64 !!!").unwrap_err(),
            CodecError::InvalidEncoding(_)
        ));
    }

    #[test]
    fn test_decode_empty_rejected() {
        assert_eq!(decode("").unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn test_validate_real_update() {
        let payload = sample_update("INT. WAREHOUSE - NIGHT");
        assert!(validate(payload.as_bytes()));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(!validate(&[0xFF, 0xFE, 0xFD, 0xFC]));
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(!validate(&[]));
    }

    #[test]
    fn test_validate_rejects_oversized() {
        let big = vec![0u8; MAX_TRANSPORT_BYTES + 1];
        assert!(!validate(&big));
    }

    #[test]
    fn test_encoded_update_survives_transport() {
        let payload = sample_update("FADE IN:");
        let transport = encode(&payload).unwrap();
        let back = decode(&transport).unwrap();

        // Apply the round-tripped update to a fresh doc and read the text back
        let doc = Doc::new();
        {
            let update = Update::decode_v1(back.as_bytes()).unwrap();
            let mut txn = doc.transact_mut();
            txn.apply_update(update).unwrap();
        }
        let txn = doc.transact();
        let text = txn.get_text("body").unwrap();
        assert_eq!(text.get_string(&txn), "FADE IN:");
    }
}
