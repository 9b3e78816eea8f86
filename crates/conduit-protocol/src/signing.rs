//! Optional HMAC-SHA256 envelope signatures.
//!
//! The signed string is `type|request_id|timestamp|payload`, where `payload`
//! is the compact JSON serialization of the payload as received. The
//! signature travels base64-encoded in the envelope's `signature` field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::envelope::Envelope;

type HmacSha256 = Hmac<Sha256>;

/// Canonical input for a signature.
pub fn signing_input(message_type: &str, request_id: &str, timestamp: &str, payload: &Value) -> String {
    let payload = serde_json::to_string(payload).unwrap_or_default();
    format!("{message_type}|{request_id}|{timestamp}|{payload}")
}

/// Signs outbound envelopes and verifies inbound signatures with one secret.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Create a signer for `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Option<HmacSha256> {
        // HMAC accepts keys of any length; this only fails for fixed-size MACs.
        HmacSha256::new_from_slice(&self.key).ok()
    }

    /// Base64 signature of a canonical input.
    pub fn sign_input(&self, input: &str) -> String {
        let Some(mut mac) = self.mac() else {
            return String::new();
        };
        mac.update(input.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Set `envelope.signature` from its current contents.
    pub fn sign(&self, envelope: &mut Envelope) {
        let input = signing_input(
            envelope.message_type.as_str(),
            &envelope.request_id,
            &envelope.timestamp,
            &envelope.payload,
        );
        envelope.signature = Some(self.sign_input(&input));
    }

    /// Constant-time check of `signature` against `input`.
    pub fn verify_input(&self, input: &str, signature: &str) -> bool {
        let Ok(bytes) = STANDARD.decode(signature) else {
            return false;
        };
        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(input.as_bytes());
        mac.verify_slice(&bytes).is_ok()
    }

    /// Verify an envelope's own signature against its current contents.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        let Some(signature) = envelope.signature.as_deref() else {
            return false;
        };
        let input = signing_input(
            envelope.message_type.as_str(),
            &envelope.request_id,
            &envelope.timestamp,
            &envelope.payload,
        );
        self.verify_input(&input, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type::MessageType;
    use serde_json::json;

    #[test]
    fn signing_input_layout() {
        let input = signing_input("PING", "r1", "t", &json!({"a": 1}));
        assert_eq!(input, r#"PING|r1|t|{"a":1}"#);
    }

    #[test]
    fn sign_then_verify() {
        let signer = Signer::new("secret");
        let mut env = Envelope::new(MessageType::Event, "s", "r", json!({"x": [1, 2]}));
        signer.sign(&mut env);
        assert!(env.signature.is_some());
        assert!(signer.verify(&env));
    }

    #[test]
    fn tampered_payload_fails() {
        let signer = Signer::new("secret");
        let mut env = Envelope::new(MessageType::Event, "s", "r", json!({"x": 1}));
        signer.sign(&mut env);
        env.payload = json!({"x": 2});
        assert!(!signer.verify(&env));
    }

    #[test]
    fn wrong_secret_or_garbage_fails() {
        let mut env = Envelope::new(MessageType::Ack, "s", "r", json!({}));
        Signer::new("one").sign(&mut env);
        assert!(!Signer::new("two").verify(&env));
        assert!(!Signer::new("one").verify_input("x", "not base64!!"));
        env.signature = None;
        assert!(!Signer::new("one").verify(&env));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let signer = Signer::new("Jefe");
        let sig = signer.sign_input("what do ya want for nothing?");
        let expected = STANDARD.encode(
            [
                0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
                0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
                0x64, 0xec, 0x38, 0x43,
            ],
        );
        assert_eq!(sig, expected);
    }
}
