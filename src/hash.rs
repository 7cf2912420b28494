/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;

use siphasher::sip128::SipHasher24;

/// Fixed fingerprint key; changing it invalidates every dep file on disk.
const SIPHASH_KEY: &[u8; 16] = b"redo siphash key";

pub const HASH_HEX_LEN: usize = 32;
pub const STAMP_HEX_LEN: usize = 16;

const BLOCK_SIZE: usize = 4096;

/// SipHash-2-4-128 of the empty input under [`SIPHASH_KEY`]; the fingerprint
/// recorded for empty files.
pub const EMPTY_HASH: [u8; 16] = [
    0x92, 0x8f, 0xea, 0xaf, 0x8f, 0xb3, 0x39, 0x46, 0xcd, 0x28, 0x6e, 0x6f, 0x0b, 0xbd, 0x30, 0xc2,
];

pub fn hash_bytes(data: &[u8]) -> [u8; 16] {
    SipHasher24::new_with_key(SIPHASH_KEY).hash(data).as_bytes()
}

/// Fingerprint of a file's contents.
///
/// Reads in 4 KiB blocks and keeps only the hash of the final block, so two
/// files sharing their last block collide. Kept for bit compatibility with
/// dep files already on disk; a whole-stream hash needs a format version bump.
pub fn hash_file(file: &mut File) -> io::Result<[u8; 16]> {
    let mut buf = [0u8; BLOCK_SIZE];
    let mut hash = EMPTY_HASH;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash = hash_bytes(&buf[..n]);
    }
    Ok(hash)
}

pub fn hex(hash: &[u8; 16]) -> String {
    let mut out = String::with_capacity(HASH_HEX_LEN);
    for byte in hash {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
        out.push(char::from_digit((byte & 0xf) as u32, 16).unwrap());
    }
    out
}

/// Change stamp: `st_ctime` as 16 zero-padded lowercase hex digits.
pub fn stamp(meta: &Metadata) -> String {
    format!("{:016x}", meta.ctime() as u64)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_hash_constant() {
        assert_eq!(EMPTY_HASH, hash_bytes(b""));
        assert_eq!("928feaaf8fb33946cd286e6f0bbd30c2", hex(&EMPTY_HASH));
    }

    #[test]
    fn test_hex_rendering() {
        let rendered = hex(&[
            0x00, 0x01, 0x10, 0xff, 0xab, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x9a,
        ]);
        assert_eq!(HASH_HEX_LEN, rendered.len());
        assert_eq!("000110ffab000000000000000000009a", rendered);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        let mut file = File::open(&path).unwrap();
        assert_eq!(EMPTY_HASH, hash_file(&mut file).unwrap());
    }

    #[test]
    fn test_short_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        fs::write(&path, b"hello\n").unwrap();
        let mut file = File::open(&path).unwrap();
        assert_eq!(hash_bytes(b"hello\n"), hash_file(&mut file).unwrap());
    }

    #[test]
    fn test_only_last_block_counts() {
        let dir = tempfile::tempdir().unwrap();
        let fst = dir.path().join("fst");
        let snd = dir.path().join("snd");
        let mut f = File::create(&fst).unwrap();
        f.write_all(&[b'a'; BLOCK_SIZE]).unwrap();
        f.write_all(b"tail").unwrap();
        drop(f);
        let mut f = File::create(&snd).unwrap();
        f.write_all(&[b'b'; BLOCK_SIZE]).unwrap();
        f.write_all(b"tail").unwrap();
        drop(f);
        let fst_hash = hash_file(&mut File::open(&fst).unwrap()).unwrap();
        let snd_hash = hash_file(&mut File::open(&snd).unwrap()).unwrap();
        assert_eq!(fst_hash, snd_hash);
        assert_eq!(hash_bytes(b"tail"), fst_hash);
    }

    #[test]
    fn test_stamp_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamped");
        fs::write(&path, b"x").unwrap();
        let meta = fs::metadata(&path).unwrap();
        let stamp = stamp(&meta);
        assert_eq!(STAMP_HEX_LEN, stamp.len());
        assert!(stamp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
