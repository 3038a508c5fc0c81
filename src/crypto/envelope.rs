/// The archive envelope: an ephemeral-ECDH ChaCha20 stream with an
/// HMAC-SHA-256 trailer.
///
/// Layout: IV[8] || EphemeralPublic[32] || Ciphertext[N] || MAC[32].
///
/// The IV is the truncated SHA-256 of the ECDH shared secret with the
/// format version folded into its first byte, so it doubles as a fast
/// recipient check and makes format versions cross-incompatible. The MAC
/// is computed over the *plaintext* on both sides (encrypt-and-MAC); that
/// order is weaker than encrypt-then-MAC but is fixed by the on-disk
/// format and must not change.
use std::io::{ErrorKind, Read, Write};

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::ChaCha20Legacy;
use hmac::Mac;
use subtle::ConstantTimeEq;

use crate::crypto::hash;
use crate::crypto::keys::{PublicKey, SecretKey, SharedSecret, KEY_LEN};
use crate::error::{EnchiveError, Result};
use crate::FORMAT_VERSION;

/// Archive IV length.
pub const IV_LEN: usize = 8;
/// MAC trailer length.
pub const MAC_LEN: usize = 32;
/// IV plus ephemeral public key.
pub const HEADER_LEN: usize = IV_LEN + KEY_LEN;
/// Smallest well-formed archive: a header and the MAC of an empty stream.
pub const MIN_ARCHIVE_LEN: usize = HEADER_LEN + MAC_LEN;

const BLOCK_LEN: usize = 64 * 1024;

/// Derive the archive IV from a shared secret.
fn archive_iv(shared: &SharedSecret) -> [u8; IV_LEN] {
    let digest = hash::sha256(shared.as_bytes());
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv[0] = iv[0].wrapping_add(FORMAT_VERSION);
    iv
}

fn keystream(shared: &SharedSecret, iv: &[u8; IV_LEN]) -> ChaCha20Legacy {
    ChaCha20Legacy::new(shared.as_bytes().into(), iv.into())
}

/// Read until `buf` is full or EOF, retrying short reads.
fn full_read<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt `input` to `output` for `recipient`.
///
/// A fresh ephemeral scalar is drawn per archive; its public half is the
/// only part that survives in the output.
pub fn encrypt<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    recipient: &PublicKey,
) -> Result<()> {
    let ephemeral = SecretKey::generate();
    let ephemeral_public = ephemeral.public_key();
    let shared = ephemeral.shared_secret(recipient);
    let iv = archive_iv(&shared);

    output.write_all(&iv)?;
    output.write_all(ephemeral_public.as_bytes())?;

    let mut cipher = keystream(&shared, &iv);
    let mut mac = hash::hmac(shared.as_bytes());
    let mut buf = vec![0u8; BLOCK_LEN];
    loop {
        let z = full_read(input, &mut buf)?;
        if z == 0 {
            break;
        }
        mac.update(&buf[..z]);
        cipher.apply_keystream(&mut buf[..z]);
        output.write_all(&buf[..z])?;
        if z < BLOCK_LEN {
            break;
        }
    }

    let tag: [u8; MAC_LEN] = mac.finalize().into_bytes().into();
    output.write_all(&tag)?;
    Ok(())
}

/// Decrypt `input` to `output` with the recipient's secret key.
///
/// Plaintext is emitted progressively; callers must treat it as
/// provisional until this returns Ok, since the MAC sits at the tail of
/// the stream.
pub fn decrypt<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    secret: &SecretKey,
) -> Result<()> {
    let mut iv = [0u8; IV_LEN];
    if full_read(input, &mut iv)? != IV_LEN {
        return Err(EnchiveError::Malformed("archive file is too short".into()));
    }
    let mut ephemeral_public = [0u8; KEY_LEN];
    if full_read(input, &mut ephemeral_public)? != KEY_LEN {
        return Err(EnchiveError::Malformed("archive file is too short".into()));
    }

    let shared = secret.shared_secret(&PublicKey::from_bytes(ephemeral_public));
    if archive_iv(&shared) != iv {
        return Err(EnchiveError::InvalidRecipient);
    }

    let mut cipher = keystream(&shared, &iv);
    let mut mac = hash::hmac(shared.as_bytes());

    // The trailing MAC_LEN bytes seen so far are the candidate MAC;
    // everything ahead of them is confirmed ciphertext.
    let mut buf = vec![0u8; BLOCK_LEN + MAC_LEN];
    if full_read(input, &mut buf[..MAC_LEN])? != MAC_LEN {
        return Err(EnchiveError::Malformed("archive file is too short".into()));
    }
    loop {
        let z = full_read(input, &mut buf[MAC_LEN..])?;
        if z == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..z]);
        mac.update(&buf[..z]);
        output.write_all(&buf[..z])?;
        buf.copy_within(z..z + MAC_LEN, 0);
        if z < BLOCK_LEN {
            break;
        }
    }

    let tag: [u8; MAC_LEN] = mac.finalize().into_bytes().into();
    if bool::from(buf[..MAC_LEN].ct_eq(&tag)) {
        Ok(())
    } else {
        Err(EnchiveError::ChecksumMismatch)
    }
}
