//! HMAC-SHA256 signatures over canonical JSON, shared by the consent store
//! and the integrity manifest.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of generated signing keys.
pub const KEY_LEN: usize = 32;

/// Base64 HMAC-SHA256 of `message`.
pub fn sign(key: &[u8], message: &[u8]) -> String {
    STANDARD.encode(mac(key, message).finalize().into_bytes())
}

/// Constant-time check of a base64 signature. Malformed input is a mismatch.
pub fn verify(key: &[u8], message: &[u8], signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature) else {
        return false;
    };
    mac(key, message).verify_slice(&expected).is_ok()
}

fn mac(key: &[u8], message: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(message);
    mac
}

/// Fresh key from the OS secure random source. `None` when the source is
/// unavailable; callers must fail closed.
pub fn generate_key() -> Option<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    OsRng.try_fill_bytes(&mut key).ok()?;
    Some(key)
}
