/// Curve25519 key pairs and the public key fingerprint.
use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::hash;
use crate::crypto::kdf;
use crate::crypto::sensitive::{Passphrase, Sensitive32};
use crate::error::Result;

pub const KEY_LEN: usize = 32;
pub const FINGERPRINT_LEN: usize = 16;

/// Clamp a 32-byte buffer into a valid Curve25519 scalar. Idempotent.
pub fn clamp(scalar: &mut [u8; KEY_LEN]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

/// A Curve25519 secret scalar. Always clamped; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Generate a fresh secret key from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Derive a secret key deterministically from a passphrase.
    pub fn from_passphrase(passphrase: &Passphrase, iexp: u8) -> Result<Self> {
        let derived = kdf::derive(passphrase.as_bytes(), iexp, None)?;
        Ok(Self::from_bytes(*derived.as_bytes()))
    }

    /// Adopt raw bytes as a secret key, clamping them.
    pub fn from_bytes(mut bytes: [u8; KEY_LEN]) -> Self {
        clamp(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The public point for this scalar.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519(self.0, X25519_BASEPOINT_BYTES))
    }

    /// Diffie-Hellman with a peer's public point.
    pub fn shared_secret(&self, peer: &PublicKey) -> SharedSecret {
        SharedSecret(Sensitive32::new(x25519(self.0, peer.0)))
    }
}

/// A Curve25519 public point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Truncated SHA-256 of the point, for display and comparison by eye.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = hash::sha256(&self.0);
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Fingerprint(bytes)
    }
}

/// Diffie-Hellman output; keys both the archive cipher and its MAC.
pub struct SharedSecret(Sensitive32);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }
}

/// A public key fingerprint, rendered as four 8-hex-digit groups.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks_exact(4).enumerate() {
            let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "{word:08x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_idempotent() {
        let mut once = [0xFF; KEY_LEN];
        clamp(&mut once);
        let mut twice = once;
        clamp(&mut twice);
        assert_eq!(once, twice);
        assert_eq!(once[0] & 7, 0);
        assert_eq!(once[31] & 0x80, 0);
        assert_eq!(once[31] & 0x40, 0x40);
    }

    #[test]
    fn test_generated_keys_are_clamped() {
        let key = SecretKey::generate();
        let mut clamped = *key.as_bytes();
        clamp(&mut clamped);
        assert_eq!(key.as_bytes(), &clamped);
    }

    #[test]
    fn test_public_key_deterministic() {
        let key = SecretKey::from_bytes([0x42; KEY_LEN]);
        assert_eq!(key.public_key(), key.public_key());
    }

    #[test]
    fn test_shared_secret_agreement() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let ab = a.shared_secret(&b.public_key());
        let ba = b.shared_secret(&a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_passphrase_derived_key_deterministic() {
        let pass = Passphrase::new("orbital mechanics".into());
        let a = SecretKey::from_passphrase(&pass, 8).unwrap();
        let b = SecretKey::from_passphrase(&pass, 8).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_fingerprint_rendering() {
        let key = PublicKey::from_bytes([0x01; KEY_LEN]);
        assert_eq!(
            key.fingerprint().to_string(),
            "72cd6e84-22c407fb-6d098690-f1130b7d"
        );
    }

    #[test]
    fn test_fingerprints_distinct() {
        let a = SecretKey::generate().public_key();
        let b = SecretKey::generate().public_key();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
