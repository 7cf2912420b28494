/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;

use fs2::FileExt;

use crate::error::FatalError;
use crate::paths;

pub enum LockState {
    /// We hold the lock and are the builder.
    Acquired(File),
    /// Another process is building this target right now.
    Contended(File),
}

/// Create or truncate the target's lock file and try a non-blocking
/// exclusive lock on it. The lock is released when the file handle drops
/// (or when the process dies).
pub fn acquire(target: &str) -> anyhow::Result<LockState> {
    let path = paths::lock_path(target);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(&path)
        .map_err(|err| FatalError::Setup(format!("failed to create '{}': {}", path, err)))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(LockState::Acquired(file)),
        Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Ok(LockState::Contended(file))
        }
        Err(err) => Err(FatalError::Setup(format!("lock '{}': {}", path, err)).into()),
    }
}

/// Fork a helper child that blocks until the contended lock is released and
/// then exits 0. Reaping it tells the scheduler the other builder finished,
/// so the target can be presumed current without running the recipe twice.
pub fn fork_waiter(lock: &File) -> anyhow::Result<i32> {
    match unsafe { libc::fork() } {
        -1 => Err(FatalError::Setup(format!("fork: {}", io::Error::last_os_error())).into()),
        0 => {
            let _ = lock.lock_exclusive();
            unsafe { libc::_exit(0) }
        }
        pid => Ok(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::DirHandle;

    #[test]
    fn test_second_acquire_contends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(paths::REDO_DIR)).unwrap();
        let _cwd = crate::paths::cwd_guard();
        let keep = DirHandle::open_cwd().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let first = acquire("target");
        let second = acquire("target");
        keep.chdir().unwrap();

        let first = first.unwrap();
        assert!(matches!(first, LockState::Acquired(_)));
        assert!(matches!(second.unwrap(), LockState::Contended(_)));
        drop(first);
        // released: a fresh attempt must win again
        keep.chdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let third = acquire("target");
        keep.chdir().unwrap();
        assert!(matches!(third.unwrap(), LockState::Acquired(_)));
    }
}
