/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// A located dofile plus every candidate probed before it that did not
/// exist. The misses become `-` entries in the target's new dep file so that
/// creating a better-placed dofile later invalidates the target.
pub struct Resolution {
    pub dofile: String,
    pub misses: Vec<String>,
}

/// Candidate names tried at one directory level, in order.
///
/// For `dir/base.a.b` the overall search is `dir/base.a.b.do`, then per
/// ancestor: `base.a.b.do` (skipped at the first level, already probed),
/// `default.a.b.do`, `default.b.do`, `default.do`.
fn level_candidates(target: &str, updir: &str, first: bool) -> Vec<String> {
    let mut candidates = Vec::new();
    if !first {
        candidates.push(format!("{}{}.do", updir, target));
    }
    let mut rest = target;
    while let Some(dot) = rest.find('.') {
        rest = &rest[dot + 1..];
        candidates.push(format!("{}default.{}.do", updir, rest));
    }
    candidates.push(format!("{}default.do", updir));
    candidates
}

/// Locate the dofile governing `target` (which must not contain `/`); the
/// working directory must be the target's directory. Walks ancestor
/// directories until `..` stops changing the `(dev, ino)` pair.
pub fn find_dofile(target: &str) -> Option<Resolution> {
    let mut misses = Vec::new();

    let first = format!("./{}.do", target);
    if Path::new(&first).exists() {
        return Some(Resolution {
            dofile: first,
            misses,
        });
    }
    misses.push(first);

    let mut updir = String::from("./");
    let mut prev = None;
    loop {
        let meta = match fs::metadata(&updir) {
            Ok(meta) => meta,
            Err(_) => return None,
        };
        let id = (meta.dev(), meta.ino());
        if prev == Some(id) {
            // reached the filesystem root, .. = .
            return None;
        }
        prev = Some(id);

        for candidate in level_candidates(target, &updir, updir == "./") {
            if Path::new(&candidate).exists() {
                return Some(Resolution {
                    dofile: candidate,
                    misses,
                });
            }
            misses.push(candidate);
        }

        updir.push_str("../");
    }
}

/// The recipe's second argument: the target stripped of one trailing
/// `.`-suffix per extra dot in a `default.*` dofile's name. For any other
/// dofile it is the target unchanged.
pub fn basename(dofile: &str, target: &str) -> String {
    let name = match dofile.rfind('/') {
        Some(pos) => &dofile[pos + 1..],
        None => dofile,
    };
    let mut strip = if name.starts_with("default.") {
        name.matches('.').count() as i32 - 1
    } else {
        0
    };
    let mut buf = target.to_owned();
    while strip > 0 {
        if let Some(dot) = buf.rfind('.') {
            buf.truncate(dot);
        }
        strip -= 1;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_candidates_first_level() {
        assert_eq!(
            vec![
                "./default.a.b.do".to_owned(),
                "./default.b.do".to_owned(),
                "./default.do".to_owned(),
            ],
            level_candidates("base.a.b", "./", true)
        );
    }

    #[test]
    fn test_level_candidates_ancestor() {
        assert_eq!(
            vec![
                "./../base.a.b.do".to_owned(),
                "./../default.a.b.do".to_owned(),
                "./../default.b.do".to_owned(),
                "./../default.do".to_owned(),
            ],
            level_candidates("base.a.b", "./../", false)
        );
    }

    #[test]
    fn test_level_candidates_no_extension() {
        assert_eq!(
            vec!["./default.do".to_owned()],
            level_candidates("all", "./", true)
        );
    }

    #[test]
    fn test_basename_strips_default_suffixes() {
        assert_eq!("x", basename("default.o.do", "x.o"));
        assert_eq!("x", basename("default.a.b.do", "x.a.b"));
        assert_eq!("subdir/foo", basename("default.o.do", "subdir/foo.o"));
        assert_eq!("x.o", basename("default.do", "x.o"));
    }

    #[test]
    fn test_basename_plain_dofile_unchanged() {
        assert_eq!("foo", basename("foo.do", "foo"));
        assert_eq!("x.o", basename("./x.o.do", "x.o"));
    }

    #[test]
    fn test_find_dofile_walks_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("default.o.do"), b"echo x\n").unwrap();
        let _cwd = crate::paths::cwd_guard();
        let keep = crate::paths::DirHandle::open_cwd().unwrap();
        std::env::set_current_dir(dir.path().join("a/b")).unwrap();
        let found = find_dofile("x.o");
        keep.chdir().unwrap();

        let found = found.expect("dofile should be found");
        assert_eq!("./../../default.o.do", found.dofile);
        assert!(found.misses.contains(&"./x.o.do".to_owned()));
        assert!(found.misses.contains(&"./default.o.do".to_owned()));
        assert!(found.misses.contains(&"./../x.o.do".to_owned()));
    }
}
