/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;

use log::debug;

use crate::error::FatalError;

/// Per-directory state directory holding dep files, lock files and build temps.
pub const REDO_DIR: &str = ".redo";

pub fn dep_path(target: &str) -> String {
    format!("{}/{}.dep", REDO_DIR, target)
}

pub fn lock_path(target: &str) -> String {
    format!("{}/{}.lock", REDO_DIR, target)
}

/// Candidate target contents while a recipe runs; pid-keyed.
pub fn temp_target_path(pid: u32, target: &str) -> String {
    format!("{}/.tmp.{}.{}", REDO_DIR, pid, target)
}

/// Candidate dep file while a recipe runs; pid-keyed.
pub fn temp_dep_path(pid: u32, target: &str) -> String {
    format!("{}/.dep.{}.{}", REDO_DIR, pid, target)
}

/// Open directory descriptor used as a stable base for resolving targets and
/// for restoring the working directory across recursion.
pub struct DirHandle {
    fd: RawFd,
}

impl DirHandle {
    pub fn open_cwd() -> anyhow::Result<DirHandle> {
        let dot = CString::new(".").unwrap();
        let fd = unsafe { libc::open(dot.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(FatalError::Setup(format!(
                "dir open: {}",
                io::Error::last_os_error()
            ))
            .into());
        }
        Ok(DirHandle { fd })
    }

    /// Make this directory the working directory again.
    pub fn chdir(&self) -> anyhow::Result<()> {
        if unsafe { libc::fchdir(self.fd) } < 0 {
            return Err(FatalError::Filesystem(format!(
                "chdir: {}",
                io::Error::last_os_error()
            ))
            .into());
        }
        Ok(())
    }

    fn open_subdir(&self, path: &str) -> anyhow::Result<DirHandle> {
        let c_path = CString::new(path)
            .map_err(|_| FatalError::Filesystem(format!("bad path '{}'", path)))?;
        let fd = unsafe { libc::openat(self.fd, c_path.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
        if fd < 0 {
            return Err(FatalError::Filesystem(format!(
                "openat '{}': {}",
                path,
                io::Error::last_os_error()
            ))
            .into());
        }
        Ok(DirHandle { fd })
    }
}

impl Drop for DirHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Change into the directory containing `target`, resolved against `dir`, and
/// return the target's basename. Targets without a separator just re-enter
/// `dir` itself.
pub fn enter_target_dir<'a>(dir: &DirHandle, target: &'a str) -> anyhow::Result<&'a str> {
    match target.rfind('/') {
        Some(pos) => {
            let sub = dir.open_subdir(&target[..pos])?;
            sub.chdir()?;
            Ok(&target[pos + 1..])
        }
        None => {
            dir.chdir()?;
            Ok(target)
        }
    }
}

/// Create `path` with mode 0755 if missing, and insist it is a usable
/// directory otherwise.
pub fn check_or_create_dir(path: &str) -> anyhow::Result<()> {
    match fs::DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => return Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(
                FatalError::Filesystem(format!("failed to mkdir '{}': {}", path, err)).into(),
            )
        }
    }
    let meta = fs::metadata(path)
        .map_err(|err| FatalError::Filesystem(format!("failed to stat '{}': {}", path, err)))?;
    if !meta.is_dir() {
        return Err(FatalError::Filesystem(format!("not a directory: '{}'", path)).into());
    }
    let c_path = CString::new(path).unwrap();
    if unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) } < 0 {
        return Err(FatalError::Filesystem(format!("insufficient rights: '{}'", path)).into());
    }
    Ok(())
}

/// Sweep the working directory's state dir for temps left behind by builds
/// whose process is gone (crash or external kill). Best effort.
pub fn cleanup_stale_temps() {
    let entries = match fs::read_dir(REDO_DIR) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(pid) = temp_pid(name) {
            if !process_alive(pid) {
                debug!("remove stale temp file: {}/{}", REDO_DIR, name);
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Owning pid of a temp file name, if it is one.
fn temp_pid(name: &str) -> Option<i32> {
    let rest = name
        .strip_prefix(".tmp.")
        .or_else(|| name.strip_prefix(".dep."))?;
    let (pid, target) = rest.split_once('.')?;
    if target.is_empty() {
        return None;
    }
    pid.parse().ok()
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return true;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means it exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Tests that change the process working directory must hold this guard;
/// the directory is process-global while tests run on parallel threads.
#[cfg(test)]
pub(crate) fn cwd_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|err| err.into_inner())
}
