//! HMAC-SHA384 request signing for the Bitfinex v2 private surfaces.

use hmac::{Hmac, Mac};
use sha2::Sha384;

type HmacSha384 = Hmac<Sha384>;

/// Signature for a private REST call: HMAC over `/api/v2/{path}{nonce}{body}`.
pub fn sign_rest(secret: &str, path: &str, nonce: i64, body: &str) -> String {
    sign(secret, &format!("/api/v2/{}{}{}", path, nonce, body))
}

/// Auth payload and signature for the private WebSocket handshake.
/// Returns `(auth_payload, auth_sig)` where the payload is `AUTH{nonce}`.
pub fn sign_ws_auth(secret: &str, nonce: i64) -> (String, String) {
    let payload = format!("AUTH{}", nonce);
    let sig = sign(secret, &payload);
    (payload, sig)
}

fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha384::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_96_hex_chars() {
        // SHA-384 output is 48 bytes.
        let sig = sign_rest("secret", "auth/r/wallets", 1700000000000000, "{}");
        assert_eq!(sig.len(), 96);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_nonce() {
        let a = sign_rest("secret", "auth/r/wallets", 1, "{}");
        let b = sign_rest("secret", "auth/r/wallets", 2, "{}");
        assert_ne!(a, b);
    }

    #[test]
    fn test_ws_auth_payload_format() {
        let (payload, sig) = sign_ws_auth("secret", 42);
        assert_eq!(payload, "AUTH42");
        assert_eq!(sig.len(), 96);
    }
}
