//! Dialback key derivation.
//!
//! Keys are HMAC-SHA256 over `"{receiving} {sending} {stream_id}"`, keyed with
//! the hex SHA-256 digest of the local secret, and rendered as lowercase hex.
//! Both servers must produce bit-identical output for the same inputs.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Derives the dialback key a sending domain presents to a receiving domain
/// on the stream identified by `stream_id`.
pub fn generate_dialback_key(sending: &str, receiving: &str, secret: &str, stream_id: &str) -> String {
    let hashed_secret = hex::encode(Sha256::digest(secret.as_bytes()));

    let mut mac =
        HmacSha256::new_from_slice(hashed_secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(receiving.as_bytes());
    mac.update(b" ");
    mac.update(sending.as_bytes());
    mac.update(b" ");
    mac.update(stream_id.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}

/// Compares a locally derived key with the one presented by the peer in
/// constant time.
pub fn keys_match(expected: &str, presented: &str) -> bool {
    let presented = presented.trim();
    expected.len() == presented.len() && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}
