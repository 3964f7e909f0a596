//! Position-addressable AES-256-CTR transform for protected file contents.
//!
//! CTR mode XORs the data with a keystream that depends only on the owner,
//! the file identity and the byte offset, so the same routine maps plaintext
//! to ciphertext and back, any byte range can be transformed at random
//! access time, and the output length always equals the input length.

use crate::ident::{Fid, Uid};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;

type Aes256Ctr = Ctr128BE<Aes256>;

/// AES-CTR block width in bytes.
const BLOCK: u64 = 16;

/// Derive the 32 byte key for a user by iterating CRC32 over the growing key
/// tail: the digest of the user identity fills the last four bytes, then each
/// round hashes the filled tail into the four bytes before it. The key is a
/// deterministic function of the user identity alone.
fn derive_key(uid: Uid) -> [u8; 32] {
    let mut key = [0u8; 32];
    let digest = crc32fast::hash(&uid.to_le_bytes());
    key[28..32].copy_from_slice(&digest.to_le_bytes());
    let mut i = 28;
    while i > 0 {
        let digest = crc32fast::hash(&key[i..32]);
        key[i - 4..i].copy_from_slice(&digest.to_le_bytes());
        i -= 4;
    }
    key
}

/// Derive the 16 byte IV for one block of a file: the file identity digest
/// fills bytes [4..8), its re-digest fills [0..4), and the block index goes
/// into [8..16) big-endian. Big-endian placement lets the standard 128 bit
/// counter increment advance the block index, so the keystream for block
/// b + 1 equals the keystream derived directly at block b + 1.
fn derive_iv(fid: Fid, block: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    let digest = crc32fast::hash(&fid.to_le_bytes());
    iv[4..8].copy_from_slice(&digest.to_le_bytes());
    let digest = crc32fast::hash(&iv[4..8]);
    iv[0..4].copy_from_slice(&digest.to_le_bytes());
    iv[8..16].copy_from_slice(&block.to_be_bytes());
    iv
}

/// Transform `buf` in place as the byte range starting at `offset` of file
/// `fid` owned by `uid`. Involutive: applying the transform twice with the
/// same parameters restores the original bytes.
///
/// The keystream is generated from the 16 byte block containing `offset` and
/// advanced past the leading `offset % 16` bytes, so callers never have to
/// align their I/O to block boundaries.
pub fn transform(buf: &mut [u8], uid: Uid, fid: Fid, offset: u64) {
    if buf.is_empty() {
        return;
    }
    let key = derive_key(uid);
    let iv = derive_iv(fid, offset / BLOCK);
    let mut ctr = Aes256Ctr::new(&key.into(), &iv.into());
    ctr.seek(offset % BLOCK);
    ctr.apply_keystream(buf);
}
