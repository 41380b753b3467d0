//! Content-identifier handling for block keys.
//!
//! A block key's last segment is the unpadded upper-case base32 encoding of
//! either a CID or a bare multihash. A CIDv1 is
//! `<varint 1><varint codec><multihash>`; a CIDv0 is a bare sha2-256
//! multihash (`0x12 0x20` + 32 digest bytes), which is also exactly what a
//! migrated key looks like.

use data_encoding::BASE32_NOPAD;

use crate::error::MigrationError;
use crate::store::Key;

const SHA2_256: u64 = 0x12;
const SHA2_256_LEN: u8 = 32;
const MAX_VARINT_LEN: usize = 9;

/// Reads an unsigned LEB128 varint, returning `(value, bytes_consumed)`.
/// Rejects overlong encodings and anything past nine bytes.
pub fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if byte == 0 && i > 0 {
                return None;
            }
            return Some((value, i + 1));
        }
    }
    None
}

fn is_v0(bytes: &[u8]) -> bool {
    bytes.len() == 2 + SHA2_256_LEN as usize
        && bytes[0] == SHA2_256 as u8
        && bytes[1] == SHA2_256_LEN
}

/// `bytes` if it is exactly one multihash: code, digest length, digest.
fn checked_multihash(bytes: &[u8]) -> Option<&[u8]> {
    let (_code, code_len) = read_uvarint(bytes)?;
    let (digest_len, len_len) = read_uvarint(&bytes[code_len..])?;
    let header = code_len + len_len;
    if (bytes.len() - header) as u64 != digest_len {
        return None;
    }
    Some(bytes)
}

/// Extracts the multihash from CIDv1 bytes. CIDv0 and anything that does not
/// parse as a CID yield `None`.
pub fn multihash_of_v1(bytes: &[u8]) -> Option<&[u8]> {
    if is_v0(bytes) {
        return None;
    }
    let (version, version_len) = read_uvarint(bytes)?;
    if version != 1 {
        return None;
    }
    let (_codec, codec_len) = read_uvarint(&bytes[version_len..])?;
    checked_multihash(&bytes[version_len + codec_len..])
}

/// Rewrites `/blocks/<CIDv1>` as `/blocks/<multihash>`. Keys already in
/// multihash form, CIDv0 keys and names that are not base32 CIDs map to
/// themselves, which is what lets an interrupted run be repeated.
pub fn cid_key_to_multihash(key: &Key) -> Result<Key, MigrationError> {
    let Ok(bytes) = BASE32_NOPAD.decode(key.name().as_bytes()) else {
        return Ok(key.clone());
    };
    match multihash_of_v1(&bytes) {
        Some(multihash) => Ok(key.parent().child(&BASE32_NOPAD.encode(multihash))),
        None => Ok(key.clone()),
    }
}
