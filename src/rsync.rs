//! Module implement thin wrappers over the rsync-algorithm engine.
//!
//! The engine itself is external; this package only needs the three
//! classic operations: `signature(basis)`, `delta(signature, new)` and
//! `patch(basis, delta)`, with the guarantee that
//! `patch(basis, delta(signature(basis), new)) == new`. Payloads are
//! in-memory buffers, one file at a time; engine failures surface as
//! [crate::Error::RsyncError].

use fast_rsync::{apply, diff, Signature, SignatureOptions};

use crate::{Error, Result};

/// Strong-hash bytes kept per block in a signature.
const CRYPTO_HASH_SIZE: u32 = 8;

/// Smallest block size the signature generator will use.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// A reasonable block size for a file of `file_len` bytes: the square
/// root rounded down to a multiple of 16, clamped at 64. Too big makes
/// deltas coarse, too small makes them slow.
pub fn find_blocksize(file_len: u64) -> u32 {
    if file_len < 4096 {
        MIN_BLOCK_SIZE
    } else {
        let root = (file_len as f64).sqrt() as u64;
        ((root / 16) * 16) as u32
    }
}

/// Serialized signature of `basis`.
pub fn signature(basis: &[u8]) -> Vec<u8> {
    let options = SignatureOptions {
        block_size: find_blocksize(basis.len() as u64),
        crypto_hash_size: CRYPTO_HASH_SIZE,
    };
    Signature::calculate(basis, options).into_serialized()
}

/// Delta that reconstructs `new` from the basis described by
/// `sig_bytes`.
pub fn delta(sig_bytes: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let sig = err_at!(RsyncError, Signature::deserialize(sig_bytes.to_vec()))?;
    let indexed = sig.index();
    let mut out = vec![];
    err_at!(RsyncError, diff(&indexed, new, &mut out))?;
    Ok(out)
}

/// Apply `delta_bytes` to `basis`.
pub fn patch(basis: &[u8], delta_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![];
    err_at!(RsyncError, apply(basis, delta_bytes, &mut out))?;
    Ok(out)
}

/// Reverse delta: reconstructs `old` from `new`, the payload of a
/// `diff` increment.
pub fn reverse_delta(new: &[u8], old: &[u8]) -> Result<Vec<u8>> {
    delta(&signature(new), old)
}

#[cfg(test)]
#[path = "rsync_test.rs"]
mod rsync_test;
