/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::env;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::FatalError;
use crate::hash;

/// Environment marker for a target under construction. The name embeds a
/// hash of the target's absolute directory and basename; it rides through
/// `exec` into every nested invocation and unwinds with process exit.
pub fn guard_name(cwd: &Path, base: &str) -> String {
    let mut key = cwd.as_os_str().as_bytes().to_vec();
    key.extend_from_slice(base.as_bytes());
    format!("REDO_{}", hash::hex(&hash::hash_bytes(&key)))
}

/// Fails when the marker is already present: some ancestor recipe is
/// building this very target, so the dependency chain has looped.
pub fn check(guard: &str, target: &str) -> Result<(), FatalError> {
    match env::var(guard) {
        Ok(pid) => Err(FatalError::CyclicDependency {
            target: target.to_owned(),
            pid,
        }),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_name_shape() {
        let name = guard_name(Path::new("/work/project"), "all");
        assert!(name.starts_with("REDO_"));
        assert_eq!("REDO_".len() + hash::HASH_HEX_LEN, name.len());
    }

    #[test]
    fn test_guard_name_distinguishes_directories() {
        let one = guard_name(Path::new("/work/a"), "out");
        let two = guard_name(Path::new("/work/b"), "out");
        assert_ne!(one, two);
        assert_eq!(one, guard_name(Path::new("/work/a"), "out"));
    }

    #[test]
    fn test_check_detects_marker() {
        let name = guard_name(Path::new("/nowhere"), "cycle-test");
        assert!(check(&name, "cycle-test").is_ok());
        env::set_var(&name, "123");
        let err = check(&name, "cycle-test").unwrap_err();
        assert_eq!(255, err.exit_code());
        env::remove_var(&name);
    }
}
