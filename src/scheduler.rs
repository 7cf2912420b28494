/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::RawFd;

use log::{debug, error};

use crate::check;
use crate::context::{self, Context};
use crate::depfile::{self, DepWriter};
use crate::error::FatalError;
use crate::paths;
use crate::runner;

/// Job tokens bounding parallelism across the whole process tree.
///
/// One implicit token belongs to every running invocation; beyond that,
/// tokens are bytes drawn from a pipe shared through inherited descriptors,
/// make-jobserver style. The pipe is created at the top level when `JOBS`
/// asks for more than one job, pre-filled with `JOBS - 1` bytes.
pub struct TokenPool {
    rd: RawFd,
    wr: RawFd,
    implicit: i32,
}

impl TokenPool {
    pub fn create() -> anyhow::Result<TokenPool> {
        let mut rd = context::env_int(context::ENV_RD_FD);
        let mut wr = context::env_int(context::ENV_WR_FD);
        if rd < 0 || wr < 0 {
            let jobs = context::env_int(context::ENV_JOBS);
            if jobs > 1 {
                let mut fds = [0 as libc::c_int; 2];
                if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                    return Err(FatalError::Setup("no pipes for job pool".to_owned()).into());
                }
                rd = fds[0];
                wr = fds[1];
                for _ in 0..jobs - 1 {
                    write_token(wr);
                }
                context::set_env_int(context::ENV_RD_FD, rd);
                context::set_env_int(context::ENV_WR_FD, wr);
            } else {
                rd = -1;
                wr = -1;
            }
        }
        Ok(TokenPool {
            rd,
            wr,
            implicit: 1,
        })
    }

    /// Whether the next token would come from the implicit budget; decides
    /// where the job returns it.
    pub fn implicit_available(&self) -> bool {
        self.implicit > 0
    }

    pub fn try_procure(&mut self) -> bool {
        if self.implicit > 0 {
            self.implicit -= 1;
            return true;
        }
        if self.rd < 0 {
            return false;
        }
        unsafe {
            libc::fcntl(self.rd, libc::F_SETFL, libc::O_NONBLOCK);
        }
        self.read_token()
    }

    pub fn procure(&mut self) -> bool {
        if self.implicit > 0 {
            self.implicit -= 1;
            return true;
        }
        if self.rd < 0 {
            return false;
        }
        unsafe {
            libc::fcntl(self.rd, libc::F_SETFL, 0);
        }
        self.read_token()
    }

    pub fn vacate(&mut self, implicit: bool) {
        if implicit {
            self.implicit += 1;
        } else {
            write_token(self.wr);
        }
    }

    fn read_token(&self) -> bool {
        let mut buf = [0u8; 1];
        unsafe { libc::read(self.rd, buf.as_mut_ptr() as *mut libc::c_void, 1) > 0 }
    }
}

fn write_token(fd: RawFd) {
    let token = [0u8; 1];
    unsafe {
        libc::write(fd, token.as_ptr() as *const libc::c_void, 1);
    }
}

/// A child enrolled in the wait loop: a recipe building a target, or a
/// targetless wait-job blocking on another builder's lock.
pub struct Job {
    pid: i32,
    /// Holds the target's lock descriptor; dropping the job releases it.
    _lock: File,
    target: Option<String>,
    temp_depfile: String,
    temp_target: String,
    implicit: bool,
}

impl Job {
    pub fn recipe(
        pid: i32,
        lock: File,
        target: String,
        temp_depfile: String,
        temp_target: String,
        implicit: bool,
    ) -> Job {
        Job {
            pid,
            _lock: lock,
            target: Some(target),
            temp_depfile,
            temp_target,
            implicit,
        }
    }

    pub fn waiter(pid: i32, lock: File, implicit: bool) -> Job {
        Job {
            pid,
            _lock: lock,
            target: None,
            temp_depfile: String::new(),
            temp_target: String::new(),
            implicit,
        }
    }
}

/// Bring every target up to date, in command-line order, bounded by the
/// token pool. Phase 1 marks the targets that need no work; phase 2
/// dispatches the rest and reaps children until none are left.
pub fn build(ctx: &Context, pool: &mut TokenPool, targets: &[String]) -> anyhow::Result<()> {
    let mut skip = Vec::with_capacity(targets.len());
    for target in targets {
        skip.push(check::check_deps(ctx, &ctx.dir, target)?);
    }

    let mut jobs: Vec<Job> = Vec::new();
    let mut next = 0;
    let mut worst: Option<(i32, i32)> = None;

    loop {
        let mut spawned = false;
        if next < targets.len() {
            if skip[next] {
                next += 1;
                continue;
            }
            let implicit = pool.implicit_available();
            if pool.try_procure() {
                spawned = true;
                let target = &targets[next];
                next += 1;
                match runner::run_script(ctx, target, implicit) {
                    Ok(job) => jobs.push(job),
                    Err(err) => {
                        pool.vacate(implicit);
                        let starting_failure = matches!(
                            err.downcast_ref::<FatalError>(),
                            Some(FatalError::RecipeStart(_))
                        );
                        if starting_failure && ctx.flags.keep_going > 0 {
                            error!("error: {:#}", err);
                            note_failure(&mut worst, 255, 0);
                        } else {
                            return Err(err);
                        }
                    }
                }
            }
        }

        let mut status: libc::c_int = 0;
        let flags = if spawned { libc::WNOHANG } else { 0 };
        let pid = unsafe { libc::waitpid(-1, &mut status, flags) };
        if pid == 0 {
            continue;
        }
        if pid < 0 {
            let no_children =
                io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD);
            if no_children && next < targets.len() {
                continue;
            }
            break;
        }

        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            status
        };

        let slot = match jobs.iter().position(|job| job.pid == pid) {
            Some(slot) => slot,
            None => {
                return Err(FatalError::Setup(format!("reaped unknown child {}", pid)).into())
            }
        };
        let job = jobs.swap_remove(slot);

        if job.target.is_some() {
            finish_job(ctx, &job, code)?;
        }
        debug!(
            "{} finish {} [{}]",
            ctx.indent(),
            job.target.as_deref().unwrap_or("waiting.."),
            pid
        );

        let implicit = job.implicit;
        drop(job); // releases the target's lock
        pool.vacate(implicit);

        if code > 0 {
            if ctx.flags.keep_going > 0 {
                note_failure(&mut worst, code, pid);
            } else {
                return Err(FatalError::RecipeFailed { status: code, pid }.into());
            }
        }
    }

    // under keep-going the worst recipe status surfaces at exit
    match worst {
        Some((status, pid)) => Err(FatalError::RecipeFailed { status, pid }.into()),
        None => Ok(()),
    }
}

fn note_failure(worst: &mut Option<(i32, i32)>, code: i32, pid: i32) {
    if worst.map_or(true, |(status, _)| code > status) {
        *worst = Some((code, pid));
    }
}

/// Publish or discard one finished recipe's results.
fn finish_job(ctx: &Context, job: &Job, status: i32) -> anyhow::Result<()> {
    let target = job.target.as_deref().unwrap();
    let base = paths::enter_target_dir(&ctx.dir, target)?;

    if status > 0 {
        // failed: leave the old target and dep file untouched
        remove_temp(&job.temp_depfile);
        remove_temp(&job.temp_target);
        return Ok(());
    }

    let file = OpenOptions::new()
        .append(true)
        .open(&job.temp_depfile)
        .map_err(|err| {
            FatalError::Filesystem(format!(
                "failed to reopen '{}': {}",
                job.temp_depfile, err
            ))
        })?;
    let mut deps = DepWriter::new(file, String::new());

    match fs::metadata(&job.temp_target) {
        Err(err) => {
            error!("error: {}: {}", job.temp_target, err);
            let _ = fs::remove_file(&job.temp_target);
            // leave the old target alone; invalidate once it shows up
            deps.record_absent(base)?;
        }
        Ok(meta) if meta.len() > 0 => {
            rename_temp(&job.temp_target, base);
            deps.record_used(base)?;
        }
        Ok(_) => {
            // empty output means "no new contents"; rebuild next time
            remove_temp(&job.temp_target);
            deps.record_always()?;
        }
    }

    drop(deps);
    rename_temp(&job.temp_depfile, &paths::dep_path(base));
    remove_temp(&paths::lock_path(base));
    Ok(())
}

/// After a conditional build, report each named target to the parent
/// recipe's dep channel so the parent is invalidated when they change.
pub fn record_deps(ctx: &Context, targets: &[String]) -> anyhow::Result<()> {
    let mut writer = match depfile::writer_from_env(ctx.uprel.clone()) {
        Some(writer) => writer,
        None => return Ok(()),
    };
    ctx.dir.chdir()?;
    for target in targets {
        writer.record_used(target)?;
    }
    Ok(())
}

fn remove_temp(path: &str) {
    if let Err(err) = fs::remove_file(path) {
        error!("error: remove {}: {}", path, err);
    }
}

fn rename_temp(old: &str, new: &str) {
    if let Err(err) = fs::rename(old, new) {
        error!("error: rename {} {}: {}", old, new, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implicit_token_cycle() {
        let mut pool = TokenPool {
            rd: -1,
            wr: -1,
            implicit: 1,
        };
        assert!(pool.implicit_available());
        assert!(pool.try_procure());
        // budget exhausted and no pipe inherited
        assert!(!pool.implicit_available());
        assert!(!pool.try_procure());
        assert!(!pool.procure());
        pool.vacate(true);
        assert!(pool.try_procure());
    }

    #[test]
    fn test_pipe_tokens() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        let mut pool = TokenPool {
            rd: fds[0],
            wr: fds[1],
            implicit: 1,
        };
        write_token(pool.wr);
        write_token(pool.wr);
        assert!(pool.try_procure()); // implicit
        assert!(pool.try_procure()); // pipe
        assert!(pool.try_procure()); // pipe
        assert!(!pool.try_procure()); // drained
        pool.vacate(false);
        assert!(pool.try_procure());
        pool.vacate(true);
        assert!(pool.implicit_available());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
