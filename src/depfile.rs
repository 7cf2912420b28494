/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;

use anyhow::Context as _;
use thiserror::Error;

use crate::context::{env_int, ENV_DEP_FD};
use crate::hash;

/// One line of a target's dependency ledger.
///
/// `=hash stamp path` records a consumed file with its last observed
/// fingerprint and change stamp, `-path` a file that must keep not existing,
/// and `!` marks the target always out of date.
#[derive(Debug, PartialEq)]
pub enum DepEntry {
    Used {
        hash: String,
        stamp: String,
        path: String,
    },
    Absent {
        path: String,
    },
    Always,
}

#[derive(Error, Debug, PartialEq)]
pub enum DepParseError {
    #[error("empty dependency line")]
    Empty,
    #[error("truncated '=' entry")]
    Truncated,
    #[error("invalid entry kind '{0}'")]
    BadKind(char),
}

impl DepEntry {
    /// Positional parse of one newline-stripped ledger line. Fields are at
    /// fixed offsets; anything that does not fit invalidates the dep file.
    pub fn parse(line: &str) -> Result<DepEntry, DepParseError> {
        let mut chars = line.chars();
        match chars.next() {
            None => Err(DepParseError::Empty),
            Some('=') => {
                let hash_end = 1 + hash::HASH_HEX_LEN;
                let stamp_start = hash_end + 1;
                let stamp_end = stamp_start + hash::STAMP_HEX_LEN;
                let path_start = stamp_end + 1;
                if line.len() < path_start {
                    return Err(DepParseError::Truncated);
                }
                let hash = line.get(1..hash_end).ok_or(DepParseError::Truncated)?;
                let stamp = line
                    .get(stamp_start..stamp_end)
                    .ok_or(DepParseError::Truncated)?;
                let path = line.get(path_start..).ok_or(DepParseError::Truncated)?;
                Ok(DepEntry::Used {
                    hash: hash.to_owned(),
                    stamp: stamp.to_owned(),
                    path: path.to_owned(),
                })
            }
            Some('-') => Ok(DepEntry::Absent {
                path: line[1..].to_owned(),
            }),
            Some('!') => Ok(DepEntry::Always),
            Some(kind) => Err(DepParseError::BadKind(kind)),
        }
    }
}

/// Up-relative prefix mapping recipe-relative paths into the dep file's
/// directory: one `../` per component of `REDO_DIRPREFIX`.
pub fn uprel(dirprefix: &str) -> String {
    let mut out = String::new();
    for component in dirprefix.split('/') {
        if !component.is_empty() {
            out.push_str("../");
        }
    }
    out
}

/// Appends ledger entries to a dep channel (a temp dep file of our own, the
/// parent's inherited channel, or stdout for the hash verb).
pub struct DepWriter<W: Write> {
    sink: W,
    uprel: String,
}

impl<W: Write> DepWriter<W> {
    pub fn new(sink: W, uprel: String) -> DepWriter<W> {
        DepWriter { sink, uprel }
    }

    /// Hash and stamp `path` and append its `=` entry, the path prefixed with
    /// the up-relative prefix unless absolute. Returns false when the file
    /// cannot be opened or read; nothing is written then.
    pub fn record_used(&mut self, path: &str) -> anyhow::Result<bool> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(false),
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(_) => return Ok(false),
        };
        let hash = match hash::hash_file(&mut file) {
            Ok(hash) => hash,
            Err(_) => return Ok(false),
        };
        let prefix = if path.starts_with('/') {
            ""
        } else {
            self.uprel.as_str()
        };
        writeln!(
            self.sink,
            "={} {} {}{}",
            hash::hex(&hash),
            hash::stamp(&meta),
            prefix,
            path
        )
        .with_context(|| format!("failed to record dependency '{}'", path))?;
        Ok(true)
    }

    /// Append a `-` entry: the target is invalid once `path` exists.
    pub fn record_absent(&mut self, path: &str) -> anyhow::Result<()> {
        writeln!(self.sink, "-{}", path)
            .with_context(|| format!("failed to record absence of '{}'", path))
    }

    /// Append the `!` marker: always rebuild.
    pub fn record_always(&mut self) -> anyhow::Result<()> {
        writeln!(self.sink, "!").with_context(|| "failed to record always entry")
    }
}

/// Writer over the parent recipe's dep channel, when this process runs inside
/// one. Takes ownership of the descriptor; the channel closes with the writer.
pub fn writer_from_env(uprel: String) -> Option<DepWriter<File>> {
    let fd = env_int(ENV_DEP_FD);
    if fd < 0 {
        return None;
    }
    let file = unsafe { File::from_raw_fd(fd) };
    Some(DepWriter::new(file, uprel))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_parse_used() {
        let line = "=928feaaf8fb33946cd286e6f0bbd30c2 00000000675e21a0 ./foo.do";
        assert_eq!(
            Ok(DepEntry::Used {
                hash: "928feaaf8fb33946cd286e6f0bbd30c2".to_owned(),
                stamp: "00000000675e21a0".to_owned(),
                path: "./foo.do".to_owned(),
            }),
            DepEntry::parse(line)
        );
    }

    #[test]
    fn test_parse_absent_and_always() {
        assert_eq!(
            Ok(DepEntry::Absent {
                path: "./x.o.do".to_owned()
            }),
            DepEntry::parse("-./x.o.do")
        );
        assert_eq!(Ok(DepEntry::Always), DepEntry::parse("!"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Err(DepParseError::Empty), DepEntry::parse(""));
        assert_eq!(Err(DepParseError::BadKind('#')), DepEntry::parse("# note"));
        assert_eq!(
            Err(DepParseError::Truncated),
            DepEntry::parse("=deadbeef too short")
        );
    }

    #[test]
    fn test_uprel() {
        assert_eq!("", uprel(""));
        assert_eq!("../", uprel("b"));
        assert_eq!("../../", uprel("b/c"));
    }

    #[test]
    fn test_record_used_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dep = dir.path().join("dep");
        fs::write(&dep, b"contents\n").unwrap();
        let mut out = Vec::new();
        let mut writer = DepWriter::new(&mut out, String::new());
        assert!(writer.record_used(dep.to_str().unwrap()).unwrap());
        let line = String::from_utf8(out).unwrap();
        let line = line.strip_suffix('\n').unwrap();
        match DepEntry::parse(line).unwrap() {
            DepEntry::Used { hash, stamp, path } => {
                assert_eq!(hash::hex(&hash::hash_bytes(b"contents\n")), hash);
                assert_eq!(hash::STAMP_HEX_LEN, stamp.len());
                // absolute paths are recorded without a prefix
                assert_eq!(dep.to_str().unwrap(), path);
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_record_used_skips_missing() {
        let mut out = Vec::new();
        let mut writer = DepWriter::new(&mut out, String::new());
        assert!(!writer.record_used("/no/such/file").unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn test_record_uprel_prefix() {
        let mut out = Vec::new();
        let mut writer = DepWriter::new(&mut out, "../../".to_owned());
        writer.record_absent("gone").unwrap();
        writer.record_always().unwrap();
        assert_eq!(b"-gone\n!\n".as_slice(), out.as_slice());
    }
}
