use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `value`. Used wherever only a lookup key for a
/// secret is stored.
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// URL-safe random token built from `byte_len` random bytes.
pub fn random_token(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    if let Err(err) = OsRng.try_fill_bytes(&mut bytes) {
        tracing::warn!(error = %err, "OS randomness unavailable, falling back to thread rng");
        rand::thread_rng().fill_bytes(&mut bytes);
    }
    URL_SAFE_NO_PAD.encode(bytes)
}
