/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::env;
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context as _;
use log::{debug, info};

use crate::context::{self, Context};
use crate::cycle;
use crate::depfile::DepWriter;
use crate::dofile;
use crate::error::FatalError;
use crate::lock::{self, LockState};
use crate::paths;
use crate::scheduler::Job;

/// Start the recipe for `target`, holding one job token.
///
/// On return a job has been enrolled: either the recipe child itself or, when
/// another process already holds the target's lock, a wait-job that completes
/// once that builder is done. The working directory is left in the dofile's
/// directory; every caller re-enters directories through the saved handle.
pub fn run_script(ctx: &Context, target: &str, implicit: bool) -> anyhow::Result<Job> {
    let base = paths::enter_target_dir(&ctx.dir, target)?;

    let resolution = match dofile::find_dofile(base) {
        Some(resolution) => resolution,
        None => return Err(FatalError::NoDofile(base.to_owned()).into()),
    };

    info!("redo {}", base);

    let cwd = env::current_dir()
        .map_err(|err| FatalError::Setup(format!("getcwd: {}", err)))?;
    let guard = cycle::guard_name(&cwd, base);
    cycle::check(&guard, target)?;

    paths::check_or_create_dir(paths::REDO_DIR)?;
    if ctx.level == 0 {
        paths::cleanup_stale_temps();
    }

    let lock = match lock::acquire(base)? {
        LockState::Acquired(lock) => lock,
        LockState::Contended(lock) => {
            let pid = lock::fork_waiter(&lock)?;
            debug!("{} wait job {} [{}]", ctx.indent(), target, pid);
            return Ok(Job::waiter(pid, lock, implicit));
        }
    };

    let my_pid = std::process::id();

    let temp_depfile = paths::temp_dep_path(my_pid, base);
    let dep_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&temp_depfile)
        .map_err(|err| {
            FatalError::Setup(format!(
                "could not create temp dep file '{}': {}",
                temp_depfile, err
            ))
        })?;
    let dep_raw = dep_file.as_raw_fd();
    // paths in the target's own dep file are target-dir-relative as written,
    // so this writer carries no up-relative prefix
    let mut deps = DepWriter::new(dep_file, String::new());
    // first line names the dofile; then every candidate probed before it
    deps.record_used(&resolution.dofile)?;
    for miss in &resolution.misses {
        deps.record_absent(miss)?;
    }

    let temp_target = paths::temp_target_path(my_pid, base);
    let target_mode = match fs::metadata(base) {
        Ok(meta) => meta.mode(),
        Err(_) => 0o644,
    };
    let target_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(target_mode)
        .open(&temp_target)
        .map_err(|err| {
            FatalError::Setup(format!(
                "could not create temp target file '{}': {}",
                temp_target, err
            ))
        })?;

    // recipes run from the directory their dofile lives in; the skipped
    // components become REDO_DIRPREFIX so nested invocations can record
    // dep paths relative to the target's directory
    let (dofile, dirprefix) = ascend_to_dofile(&resolution.dofile, &cwd)?;
    env::set_var(context::ENV_DIRPREFIX, &dirprefix);

    let rel_target = prefixed(&dirprefix, base);
    let rel_temp_target = prefixed(&dirprefix, &temp_target);
    let arg2 = dofile::basename(&dofile, &rel_target);

    let mut cmd = if executable(&dofile) {
        let mut cmd = Command::new(format!("./{}", dofile));
        cmd.arg0(&dofile);
        cmd
    } else {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg(if ctx.flags.trace > 0 { "-ex" } else { "-e" })
            .arg(&dofile);
        cmd
    };
    cmd.arg(&rel_target).arg(&arg2).arg(&rel_temp_target);
    cmd.stdout(Stdio::from(target_file));
    cmd.env(context::ENV_DEP_FD, dep_raw.to_string());
    cmd.env(context::ENV_LEVEL, (ctx.level + 1).to_string());

    let old_dep_fd = context::env_int(context::ENV_DEP_FD);
    let guard_env = guard;
    unsafe {
        cmd.pre_exec(move || {
            // the dep channel must survive exec at its advertised number
            if libc::fcntl(dep_raw, libc::F_SETFD, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            // the grandparent's channel is not ours to pass on
            if old_dep_fd >= 0 {
                libc::close(old_dep_fd);
            }
            env::set_var(&guard_env, std::process::id().to_string());
            Ok(())
        });
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            drop(deps);
            paths::enter_target_dir(&ctx.dir, target)?;
            let _ = fs::remove_file(&temp_depfile);
            let _ = fs::remove_file(&temp_target);
            return Err(
                FatalError::RecipeStart(format!("failed to run '{}': {}", dofile, err)).into(),
            );
        }
    };
    drop(deps);

    let pid = child.id() as i32;
    if ctx.flags.verbose > 0 {
        info!(
            "{}redo {} # {} [{}]",
            ctx.indent(),
            target,
            dofile,
            pid
        );
    }
    Ok(Job::recipe(
        pid,
        lock,
        target.to_owned(),
        temp_depfile,
        temp_target,
        implicit,
    ))
}

/// Walk up the `../` prefix of a located dofile by actually changing
/// directory, and return the bare dofile name together with the directory
/// prefix leading back down to the target's directory.
fn ascend_to_dofile(found: &str, cwd: &Path) -> anyhow::Result<(String, String)> {
    let mut rest = found.strip_prefix("./").unwrap_or(found);
    let mut ups = 0;
    while let Some(stripped) = rest.strip_prefix("../") {
        rest = stripped;
        ups += 1;
    }
    if ups > 0 {
        let updirs: PathBuf = (0..ups).map(|_| "..").collect();
        env::set_current_dir(&updirs)
            .with_context(|| format!("failed to enter dofile directory '{}'", updirs.display()))?;
    }
    let mut skipped: Vec<String> = cwd
        .components()
        .rev()
        .take(ups)
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    skipped.reverse();
    Ok((rest.to_owned(), skipped.join("/")))
}

fn prefixed(dirprefix: &str, path: &str) -> String {
    if dirprefix.is_empty() {
        path.to_owned()
    } else {
        format!("{}/{}", dirprefix, path)
    }
}

fn executable(path: &str) -> bool {
    match CString::new(path) {
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 },
        Err(_) => false,
    }
}
