// Envelope codec: canonical signing input, HMAC-SHA256 sign/verify, wire limits

use super::types::{now_ms, Envelope, SharedSecret};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Separator between fields of the signing input.
pub const FIELD_DELIMITER: char = '|';

/// Length of a hex-encoded HMAC-SHA256 tag.
pub const SIGNATURE_HEX_LEN: usize = 64;

/// Maximum encoded envelope size: 256 KB
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No signing secret configured")]
    MissingSecret,
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Canonical input covered by the signature:
/// `type|timestamp|nonce|json(payload)`.
///
/// `serde_json` keeps object keys sorted, so the payload rendering does not
/// depend on the order fields were inserted.
pub fn signing_input(envelope: &Envelope) -> Result<String, CodecError> {
    let payload = serde_json::to_string(&envelope.payload)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(format!(
        "{}{d}{}{d}{}{d}{}",
        envelope.message_type,
        envelope.timestamp,
        envelope.nonce,
        payload,
        d = FIELD_DELIMITER
    ))
}

fn keyed_mac(secret: &SharedSecret, envelope: &Envelope) -> Result<HmacSha256, CodecError> {
    if secret.is_empty() {
        return Err(CodecError::MissingSecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
    mac.update(signing_input(envelope)?.as_bytes());
    Ok(mac)
}

/// Compute the lowercase hex HMAC-SHA256 tag for `envelope`.
///
/// The existing `signature` field is ignored.
pub fn sign(envelope: &Envelope, secret: &SharedSecret) -> Result<String, CodecError> {
    let mac = keyed_mac(secret, envelope)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recompute the tag from the envelope's declared fields and compare it to
/// the declared signature in constant time.
///
/// Every failure mode (no secret, malformed hex, wrong length) is `false`.
pub fn verify(envelope: &Envelope, secret: &SharedSecret) -> bool {
    if envelope.signature.len() != SIGNATURE_HEX_LEN {
        return false;
    }
    let declared = match hex::decode(&envelope.signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    match keyed_mac(secret, envelope) {
        Ok(mac) => mac.verify_slice(&declared).is_ok(),
        Err(_) => false,
    }
}

impl Envelope {
    /// Build a fresh envelope (new id, nonce and timestamp) and sign it.
    pub fn signed(
        message_type: impl Into<String>,
        payload: Value,
        source_id: impl Into<String>,
        secret: &SharedSecret,
    ) -> Result<Self, CodecError> {
        Self::signed_at(message_type, payload, source_id, secret, now_ms())
    }

    /// Same as [`Envelope::signed`] with an explicit timestamp.
    pub fn signed_at(
        message_type: impl Into<String>,
        payload: Value,
        source_id: impl Into<String>,
        secret: &SharedSecret,
        timestamp: u64,
    ) -> Result<Self, CodecError> {
        let mut envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            payload,
            timestamp,
            nonce: Uuid::new_v4().to_string(),
            signature: String::new(),
            source_id: source_id.into(),
        };
        envelope.signature = sign(&envelope, secret)?;
        Ok(envelope)
    }
}

/// Serialize an envelope to JSON bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let bytes =
        serde_json::to_vec(envelope).map_err(|e| CodecError::Serialization(e.to_string()))?;

    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }

    Ok(bytes)
}

/// Deserialize JSON bytes to an envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }

    serde_json::from_slice(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn secret() -> SharedSecret {
        SharedSecret::from_text("demo-shared-secret")
    }

    fn flip_low_bit(text: &str, index: usize) -> String {
        let mut bytes = text.as_bytes().to_vec();
        let i = index % bytes.len();
        bytes[i] ^= 0x01;
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_signing_input_layout() {
        let envelope = Envelope {
            id: "ignored".into(),
            message_type: "ping".into(),
            payload: json!({ "z": 1, "a": [true, null] }),
            timestamp: 42,
            nonce: "n-1".into(),
            signature: "ignored".into(),
            source_id: "ignored".into(),
        };
        assert_eq!(
            signing_input(&envelope).unwrap(),
            r#"ping|42|n-1|{"a":[true,null],"z":1}"#
        );
    }

    #[test]
    fn test_sign_is_lowercase_hex_of_fixed_width() {
        let envelope = Envelope::signed("ping", json!({ "n": 1 }), "A", &secret()).unwrap();
        assert_eq!(envelope.signature.len(), SIGNATURE_HEX_LEN);
        assert!(envelope
            .signature
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert!(verify(&envelope, &secret()));
    }

    #[test]
    fn test_signature_does_not_cover_id_or_source() {
        let mut envelope = Envelope::signed("ping", json!(1), "A", &secret()).unwrap();
        envelope.id = "other".into();
        envelope.source_id = "B".into();
        assert!(verify(&envelope, &secret()));
    }

    #[test]
    fn test_verify_with_wrong_secret() {
        let envelope = Envelope::signed("ping", json!(1), "A", &secret()).unwrap();
        assert!(!verify(&envelope, &SharedSecret::from_text("other-secret")));
    }

    #[test]
    fn test_missing_secret() {
        let mut envelope = Envelope::signed("ping", json!(1), "A", &secret()).unwrap();
        assert!(!verify(&envelope, &SharedSecret::default()));

        envelope.signature.clear();
        assert!(matches!(
            sign(&envelope, &SharedSecret::default()),
            Err(CodecError::MissingSecret)
        ));
    }

    #[test]
    fn test_malformed_signatures_are_rejected() {
        let envelope = Envelope::signed("ping", json!(1), "A", &secret()).unwrap();

        let mut empty = envelope.clone();
        empty.signature = String::new();
        assert!(!verify(&empty, &secret()));

        let mut short = envelope.clone();
        short.signature.truncate(62);
        assert!(!verify(&short, &secret()));

        let mut long = envelope.clone();
        long.signature.push_str("00");
        assert!(!verify(&long, &secret()));

        let mut non_hex = envelope.clone();
        non_hex.signature.replace_range(0..2, "zz");
        assert!(!verify(&non_hex, &secret()));

        let mut multibyte = envelope;
        multibyte.signature = "é".repeat(32);
        assert!(!verify(&multibyte, &secret()));
    }

    #[test]
    fn test_encode_decode_envelope() {
        let envelope = Envelope::signed("ping", json!({ "n": 1 }), "A", &secret()).unwrap();
        let bytes = encode_envelope(&envelope).unwrap();
        let restored = decode_envelope(&bytes).unwrap();
        assert_eq!(envelope, restored);
        assert!(verify(&restored, &secret()));
    }

    #[test]
    fn test_reject_oversized_payload() {
        let big = "x".repeat(MAX_ENVELOPE_SIZE + 1);
        let envelope = Envelope::signed("blob", json!(big), "A", &secret()).unwrap();
        assert!(matches!(
            encode_envelope(&envelope),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big_bytes = vec![b' '; MAX_ENVELOPE_SIZE + 1];
        assert!(decode_envelope(&big_bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_negative_timestamp() {
        let raw = br#"{"id":"x","type":"ping","payload":1,"timestamp":-5,"nonce":"n"}"#;
        assert!(decode_envelope(raw).is_err());
    }

    proptest! {
        #[test]
        fn prop_sign_then_verify(
            kind in "[a-z:]{1,16}",
            timestamp in any::<u64>(),
            nonce in "[a-f0-9-]{1,36}",
            n in any::<i64>(),
            text in ".{0,32}",
        ) {
            let secret = secret();
            let mut envelope = Envelope {
                id: "id".into(),
                message_type: kind,
                payload: json!({ "n": n, "text": text }),
                timestamp,
                nonce,
                signature: String::new(),
                source_id: "A".into(),
            };
            envelope.signature = sign(&envelope, &secret).unwrap();
            prop_assert!(verify(&envelope, &secret));
        }

        #[test]
        fn prop_single_bit_mutation_fails(
            field in 0usize..5,
            index in any::<usize>(),
            bit in 0u32..64,
            n in any::<i32>(),
        ) {
            let secret = secret();
            let original = Envelope::signed_at(
                "ping",
                json!({ "n": n }),
                "A",
                &secret,
                1_700_000_000_000,
            )
            .unwrap();

            let mut mutated = original.clone();
            match field {
                0 => mutated.message_type = flip_low_bit(&mutated.message_type, index),
                1 => mutated.timestamp ^= 1u64 << bit,
                2 => mutated.nonce = flip_low_bit(&mutated.nonce, index),
                3 => mutated.payload = json!({ "n": (n as i64) ^ (1i64 << (bit % 32)) }),
                _ => mutated.signature = flip_low_bit(&mutated.signature, index),
            }

            prop_assert_ne!(&mutated, &original);
            prop_assert!(!verify(&mutated, &secret));
        }
    }
}
