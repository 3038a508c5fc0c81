/// On-disk key files: the 64-byte wrapped secret key and the raw public
/// key. Both are created with owner-only permissions.
///
/// Secret-key layout: Salt/IV[8] || cost exponent[1] || version[1] ||
/// zero[2] || ProtectionTag[20] || SecretScalar[32]. A zero cost exponent
/// means the scalar is stored unwrapped; otherwise it is XORed with the
/// ChaCha20 keystream of the passphrase-derived protection key, and the
/// tag (truncated SHA-256 of that key) validates passphrase attempts.
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::ChaCha20Legacy;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::agent;
use crate::crypto::hash;
use crate::crypto::kdf;
use crate::crypto::keys::{PublicKey, SecretKey, KEY_LEN};
use crate::crypto::sensitive::{Passphrase, Sensitive32};
use crate::error::{EnchiveError, Result};
use crate::passphrase::PassphraseProvider;
use crate::FORMAT_VERSION;

/// Secret-key file length.
pub const SECKEY_FILE_LEN: usize = 64;
/// Protection tag length (truncated SHA-256).
pub const TAG_LEN: usize = 20;

const OFF_IV: usize = 0;
const OFF_ITERATIONS: usize = 8;
const OFF_VERSION: usize = 9;
const OFF_TAG: usize = 12;
const OFF_SECKEY: usize = 32;

/// A decoded secret-key file.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKeyFile {
    iv: [u8; 8],
    iexp: u8,
    tag: [u8; TAG_LEN],
    payload: [u8; KEY_LEN],
}

impl SecretKeyFile {
    /// Wrap `secret` under a passphrase-derived protection key, drawing a
    /// fresh Salt/IV from OS entropy.
    pub fn protect(secret: &SecretKey, passphrase: &Passphrase, iexp: u8) -> Result<Self> {
        let mut iv = [0u8; 8];
        OsRng.fill_bytes(&mut iv);

        let protect = kdf::derive(passphrase.as_bytes(), iexp, Some(&iv))?;
        let digest = hash::sha256(protect.as_bytes());
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);

        let mut payload = *secret.as_bytes();
        wrap_cipher(&protect, &iv).apply_keystream(&mut payload);

        Ok(Self {
            iv,
            iexp,
            tag,
            payload,
        })
    }

    /// Store `secret` without passphrase protection.
    pub fn plain(secret: &SecretKey) -> Self {
        Self {
            iv: [0u8; 8],
            iexp: 0,
            tag: [0u8; TAG_LEN],
            payload: *secret.as_bytes(),
        }
    }

    pub fn decode(buf: &[u8; SECKEY_FILE_LEN]) -> Result<Self> {
        let version = buf[OFF_VERSION];
        if version != FORMAT_VERSION {
            return Err(EnchiveError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: version,
            });
        }
        let mut file = Self {
            iv: [0u8; 8],
            iexp: buf[OFF_ITERATIONS],
            tag: [0u8; TAG_LEN],
            payload: [0u8; KEY_LEN],
        };
        file.iv.copy_from_slice(&buf[OFF_IV..OFF_IV + 8]);
        file.tag.copy_from_slice(&buf[OFF_TAG..OFF_TAG + TAG_LEN]);
        file.payload
            .copy_from_slice(&buf[OFF_SECKEY..OFF_SECKEY + KEY_LEN]);
        Ok(file)
    }

    pub fn encode(&self) -> [u8; SECKEY_FILE_LEN] {
        let mut buf = [0u8; SECKEY_FILE_LEN];
        buf[OFF_IV..OFF_IV + 8].copy_from_slice(&self.iv);
        buf[OFF_ITERATIONS] = self.iexp;
        buf[OFF_VERSION] = FORMAT_VERSION;
        buf[OFF_TAG..OFF_TAG + TAG_LEN].copy_from_slice(&self.tag);
        buf[OFF_SECKEY..OFF_SECKEY + KEY_LEN].copy_from_slice(&self.payload);
        buf
    }

    pub fn protected(&self) -> bool {
        self.iexp != 0
    }

    /// The Salt/IV doubles as KDF salt and agent-socket discriminator.
    pub fn iv(&self) -> &[u8; 8] {
        &self.iv
    }

    pub fn cost_exponent(&self) -> u8 {
        self.iexp
    }

    /// Constant-time check of a candidate protection key against the tag.
    pub fn verify(&self, protect: &Sensitive32) -> bool {
        let digest = hash::sha256(protect.as_bytes());
        bool::from(digest[..TAG_LEN].ct_eq(&self.tag))
    }

    /// Unwrap the stored scalar with an already-verified protection key.
    pub fn unwrap_secret(&self, protect: &Sensitive32) -> SecretKey {
        let mut payload = self.payload;
        wrap_cipher(protect, &self.iv).apply_keystream(&mut payload);
        let secret = SecretKey::from_bytes(payload);
        payload.zeroize();
        secret
    }

    /// The scalar of an unprotected file.
    pub fn secret(&self) -> SecretKey {
        SecretKey::from_bytes(self.payload)
    }
}

fn wrap_cipher(protect: &Sensitive32, iv: &[u8; 8]) -> ChaCha20Legacy {
    ChaCha20Legacy::new(protect.as_bytes().into(), iv.into())
}

/// Open `path` for writing with owner-only permissions.
pub(crate) fn create_private(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| EnchiveError::Open {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn write_secret_key(path: &Path, file: &SecretKeyFile) -> Result<()> {
    let mut out = create_private(path)?;
    let mut buf = file.encode();
    let written = out.write_all(&buf);
    buf.zeroize();
    written?;
    Ok(())
}

pub fn read_secret_key_file(path: &Path) -> Result<SecretKeyFile> {
    let mut input = File::open(path).map_err(|e| EnchiveError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buf = [0u8; SECKEY_FILE_LEN];
    match input.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(EnchiveError::Malformed(format!(
                "secret key file is too short -- {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    }
    let file = SecretKeyFile::decode(&buf);
    buf.zeroize();
    file
}

pub fn write_public_key(path: &Path, key: &PublicKey) -> Result<()> {
    let mut out = create_private(path)?;
    out.write_all(key.as_bytes())?;
    Ok(())
}

pub fn read_public_key(path: &Path) -> Result<PublicKey> {
    let mut input = File::open(path).map_err(|e| EnchiveError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buf = [0u8; KEY_LEN];
    match input.read_exact(&mut buf) {
        Ok(()) => Ok(PublicKey::from_bytes(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(EnchiveError::Malformed(format!(
            "public key file is too short -- {}",
            path.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Load and, if necessary, unlock the secret key at `path`.
///
/// A protected key is first requested from the agent; on any agent failure
/// the passphrase provider is consulted instead. When agent caching is
/// enabled and the passphrase was freshly accepted, a new agent is handed
/// the protection key (spawn failure is non-fatal).
pub fn load_secret_key(
    path: &Path,
    provider: &mut dyn PassphraseProvider,
    agent_timeout: u32,
) -> Result<SecretKey> {
    let file = read_secret_key_file(path)?;
    if !file.protected() {
        return Ok(file.secret());
    }

    if let Some(cached) = agent::read_key(file.iv()) {
        if file.verify(&cached) {
            return Ok(file.unwrap_secret(&cached));
        }
    }

    let passphrase = provider.read_passphrase("passphrase: ")?;
    let protect = kdf::derive(passphrase.as_bytes(), file.cost_exponent(), Some(file.iv()))?;
    if !file.verify(&protect) {
        return Err(EnchiveError::WrongPassphrase);
    }

    if agent_timeout > 0 {
        agent::spawn(&protect, file.iv(), agent_timeout);
    }

    Ok(file.unwrap_secret(&protect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passphrase::QueuedPassphrases;

    // Cost exponents are kept low in tests; the KDF scales exponentially.
    const TEST_IEXP: u8 = 8;

    fn passphrase(s: &str) -> Passphrase {
        Passphrase::new(s.into())
    }

    #[test]
    fn test_protect_unwrap_roundtrip() {
        let secret = SecretKey::generate();
        let file = SecretKeyFile::protect(&secret, &passphrase("p1"), TEST_IEXP).unwrap();
        assert!(file.protected());

        let protect =
            kdf::derive(b"p1", file.cost_exponent(), Some(file.iv())).unwrap();
        assert!(file.verify(&protect));
        assert_eq!(file.unwrap_secret(&protect).as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_wrong_passphrase_fails_verification() {
        let secret = SecretKey::generate();
        let file = SecretKeyFile::protect(&secret, &passphrase("p1"), TEST_IEXP).unwrap();
        let wrong = kdf::derive(b"p2", file.cost_exponent(), Some(file.iv())).unwrap();
        assert!(!file.verify(&wrong));
    }

    #[test]
    fn test_plain_file_roundtrip() {
        let secret = SecretKey::generate();
        let file = SecretKeyFile::plain(&secret);
        assert!(!file.protected());
        assert_eq!(file.secret().as_bytes(), secret.as_bytes());

        let decoded = SecretKeyFile::decode(&file.encode()).unwrap();
        assert_eq!(decoded.secret().as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let secret = SecretKey::generate();
        let file = SecretKeyFile::protect(&secret, &passphrase("p1"), TEST_IEXP).unwrap();
        let decoded = SecretKeyFile::decode(&file.encode()).unwrap();
        assert_eq!(decoded.iv(), file.iv());
        assert_eq!(decoded.cost_exponent(), file.cost_exponent());
        assert_eq!(decoded.tag, file.tag);
        assert_eq!(decoded.payload, file.payload);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let secret = SecretKey::generate();
        let mut buf = SecretKeyFile::plain(&secret).encode();
        buf[OFF_VERSION] = FORMAT_VERSION.wrapping_add(1);
        assert!(matches!(
            SecretKeyFile::decode(&buf),
            Err(EnchiveError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_secret_key_file_on_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.sec");
        let secret = SecretKey::generate();
        let file = SecretKeyFile::protect(&secret, &passphrase("p1"), TEST_IEXP).unwrap();
        write_secret_key(&path, &file).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
        let loaded = read_secret_key_file(&path).unwrap();
        assert_eq!(loaded.iv(), file.iv());

        let mut provider = QueuedPassphrases::new(&["p1"]);
        let unlocked = load_secret_key(&path, &mut provider, 0).unwrap();
        assert_eq!(unlocked.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_load_with_wrong_passphrase_is_authentication_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.sec");
        let secret = SecretKey::generate();
        let file = SecretKeyFile::protect(&secret, &passphrase("p1"), TEST_IEXP).unwrap();
        write_secret_key(&path, &file).unwrap();

        let mut provider = QueuedPassphrases::new(&["p2"]);
        assert!(matches!(
            load_secret_key(&path, &mut provider, 0),
            Err(EnchiveError::WrongPassphrase)
        ));
    }

    #[test]
    fn test_truncated_secret_key_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.sec");
        std::fs::write(&path, [0u8; SECKEY_FILE_LEN - 1]).unwrap();
        let mut provider = QueuedPassphrases::new(&[]);
        assert!(matches!(
            load_secret_key(&path, &mut provider, 0),
            Err(EnchiveError::Malformed(_))
        ));
    }

    #[test]
    fn test_public_key_on_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pub");
        let public = SecretKey::generate().public_key();
        write_public_key(&path, &public).unwrap();
        assert_eq!(read_public_key(&path).unwrap(), public);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.sec");
        let secret = SecretKey::generate();
        write_secret_key(&path, &SecretKeyFile::plain(&secret)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
