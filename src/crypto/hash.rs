/// SHA-256 utilities shared by the KDF, the archive envelope, and the
/// key-file formats.
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Incremental HMAC-SHA-256 (standard 64-byte ipad/opad construction).
pub type HmacSha256 = Hmac<Sha256>;

/// Hash arbitrary data with SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Start an HMAC-SHA-256 computation under `key`.
pub fn hmac(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(key).expect("HMAC key length is unrestricted")
}
