/// Memory-hard passphrase key derivation.
///
/// Fills `2^iexp` bytes of memory with a SHA-256 chain seeded by
/// HMAC-SHA-256(salt block, passphrase), then performs `2^(iexp - 5)`
/// data-dependent jumps through it and returns the 32 bytes under the
/// final pointer. The memory size is the cost knob: each step up doubles
/// both the allocation and the iteration count.
use hmac::Mac;
use zeroize::Zeroize;

use crate::crypto::hash;
use crate::crypto::sensitive::Sensitive32;
use crate::error::{EnchiveError, Result};

/// Smallest permitted cost exponent (32 bytes, one iteration).
pub const MIN_COST_EXPONENT: u8 = 5;
/// Largest permitted cost exponent (2 GiB of memory).
pub const MAX_COST_EXPONENT: u8 = 31;
/// Default cost exponent for the on-disk protection key.
pub const PROTECT_COST_EXPONENT: u8 = 20;
/// Default cost exponent when deriving a master key from a passphrase.
pub const MASTER_COST_EXPONENT: u8 = 29;

const DIGEST_LEN: usize = 32;
const SALT_BLOCK_LEN: usize = 64;

/// Derive a 32-byte key from a passphrase.
///
/// A missing salt is equivalent to an all-zero one. Deterministic: the same
/// (passphrase, iexp, salt) triple always produces the same output.
pub fn derive(passphrase: &[u8], iexp: u8, salt: Option<&[u8; 8]>) -> Result<Sensitive32> {
    if !(MIN_COST_EXPONENT..=MAX_COST_EXPONENT).contains(&iexp) {
        return Err(EnchiveError::BadArgument(format!(
            "cost exponent must be {MIN_COST_EXPONENT} <= n <= {MAX_COST_EXPONENT} -- {iexp}"
        )));
    }
    let memlen = 1usize << iexp;
    let mask = memlen - 1;
    let iterations = 1u64 << (iexp - MIN_COST_EXPONENT);

    let mut salt_block = [0u8; SALT_BLOCK_LEN];
    if let Some(salt) = salt {
        salt_block[..salt.len()].copy_from_slice(salt);
    }
    let mut mac = hash::hmac(&salt_block);
    mac.update(passphrase);
    let mut seed: [u8; DIGEST_LEN] = mac.finalize().into_bytes().into();

    let mut memory = Vec::new();
    memory
        .try_reserve_exact(memlen + DIGEST_LEN)
        .map_err(|_| EnchiveError::OutOfMemory)?;
    memory.resize(memlen + DIGEST_LEN, 0);
    memory[..DIGEST_LEN].copy_from_slice(&seed);
    seed.zeroize();

    // Sequential fill: each 32-byte block is the hash of its predecessor.
    let mut p = DIGEST_LEN;
    while p < memlen + DIGEST_LEN {
        let block = hash::sha256(&memory[p - DIGEST_LEN..p]);
        memory[p..p + DIGEST_LEN].copy_from_slice(&block);
        p += DIGEST_LEN;
    }

    // Data-dependent walk. The pointer may land unaligned anywhere in the
    // first `memlen` bytes; the extra 32 bytes of tail keep the final read
    // in bounds.
    let mut ptr = memlen - DIGEST_LEN;
    for _ in 0..iterations {
        let block = hash::sha256(&memory[ptr..ptr + DIGEST_LEN]);
        memory[ptr..ptr + DIGEST_LEN].copy_from_slice(&block);
        let offset = u32::from_le_bytes([
            memory[ptr],
            memory[ptr + 1],
            memory[ptr + 2],
            memory[ptr + 3],
        ]) as usize;
        ptr = offset & mask;
    }

    let mut output = [0u8; DIGEST_LEN];
    output.copy_from_slice(&memory[ptr..ptr + DIGEST_LEN]);
    memory.zeroize();
    Ok(Sensitive32::new(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; 8] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_derive_deterministic() {
        let a = derive(b"correct horse", 8, Some(&SALT)).unwrap();
        let b = derive(b"correct horse", 8, Some(&SALT)).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_pinned_vector() {
        let key = derive(b"password", 5, Some(&SALT)).unwrap();
        assert_eq!(
            hex(key.as_bytes()),
            "a0fc4ff0f37ae8714d8dc68c0444e8ccca8a7ba3ef06f617836f9c883d87e297"
        );
    }

    #[test]
    fn test_derive_pinned_vector_higher_cost() {
        let key = derive(b"password", 8, Some(&SALT)).unwrap();
        assert_eq!(
            hex(key.as_bytes()),
            "d90eb521bee8eeb4d0c6ca8a6c725d958400c613ded3fd448ab39450da4d3ab6"
        );
    }

    #[test]
    fn test_missing_salt_means_zero_salt() {
        let implicit = derive(b"password", 5, None).unwrap();
        let explicit = derive(b"password", 5, Some(&[0u8; 8])).unwrap();
        assert_eq!(implicit.as_bytes(), explicit.as_bytes());
        assert_eq!(
            hex(implicit.as_bytes()),
            "868f6b024d71b8c39e37ee441797c53aee6ccd9ac1624196a8390200642f2909"
        );
    }

    #[test]
    fn test_salt_changes_output() {
        let a = derive(b"password", 6, Some(&SALT)).unwrap();
        let b = derive(b"password", 6, Some(&[0xFF; 8])).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_passphrase_changes_output() {
        let a = derive(b"password", 6, Some(&SALT)).unwrap();
        let b = derive(b"Password", 6, Some(&SALT)).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_cost_exponent_changes_output() {
        let a = derive(b"password", 5, Some(&SALT)).unwrap();
        let b = derive(b"password", 6, Some(&SALT)).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_cost_exponent_out_of_range() {
        assert!(derive(b"password", 4, None).is_err());
        assert!(derive(b"password", 32, None).is_err());
    }
}
