/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::env;

use crate::paths::DirHandle;

pub const ENV_LEVEL: &str = "REDO_LEVEL";
pub const ENV_DEP_FD: &str = "REDO_DEP_FD";
pub const ENV_RD_FD: &str = "REDO_RD_FD";
pub const ENV_WR_FD: &str = "REDO_WR_FD";
pub const ENV_DIRPREFIX: &str = "REDO_DIRPREFIX";
pub const ENV_FORCE: &str = "REDO_FORCE";
pub const ENV_KEEP_GOING: &str = "REDO_KEEP_GOING";
pub const ENV_DEBUG: &str = "REDO_DEBUG";
pub const ENV_TRACE: &str = "REDO_TRACE";
pub const ENV_VERBOSE: &str = "REDO_VERBOSE";
pub const ENV_JOBS: &str = "JOBS";

/// Small integer stored in an environment variable, -1 when unset or out of
/// the 0..=255 range (the variables carry flags, levels and descriptors).
pub fn env_int(name: &str) -> i32 {
    let value = match env::var(name) {
        Ok(v) => v,
        Err(_) => return -1,
    };
    match value.parse::<i64>() {
        Ok(n) if (0..=255).contains(&n) => n as i32,
        _ => -1,
    }
}

pub fn set_env_int(name: &str, value: i32) {
    env::set_var(name, value.to_string());
}

/// Effective flag state, re-read from the environment so that a child
/// invocation inherits whatever the top level exported. The debug flag is
/// consumed by the logger setup instead, as its filter level.
pub struct Flags {
    /// Tri-state like the others: -1 unset, 0 disabled, positive enabled.
    pub force: i32,
    pub keep_going: i32,
    pub trace: i32,
    pub verbose: i32,
}

impl Flags {
    pub fn from_env() -> Flags {
        Flags {
            force: env_int(ENV_FORCE),
            keep_going: env_int(ENV_KEEP_GOING),
            trace: env_int(ENV_TRACE).max(0),
            verbose: env_int(ENV_VERBOSE).max(0),
        }
    }
}

/// Per-process state threaded through the core: the directory handle all
/// target paths are resolved against, the recursion level and the up-relative
/// prefix used when recording dependency paths for the parent recipe.
pub struct Context {
    pub dir: DirHandle,
    pub flags: Flags,
    pub level: i32,
    pub uprel: String,
}

impl Context {
    pub fn init() -> anyhow::Result<Context> {
        Ok(Context {
            dir: DirHandle::open_cwd()?,
            flags: Flags::from_env(),
            level: env_int(ENV_LEVEL).max(0),
            uprel: String::new(),
        })
    }

    /// Recursion-depth indent for trace messages.
    pub fn indent(&self) -> String {
        " ".repeat(self.level as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_int_range() {
        env::set_var("REDO_TEST_ENV_INT", "17");
        assert_eq!(17, env_int("REDO_TEST_ENV_INT"));
        env::set_var("REDO_TEST_ENV_INT", "256");
        assert_eq!(-1, env_int("REDO_TEST_ENV_INT"));
        env::set_var("REDO_TEST_ENV_INT", "-3");
        assert_eq!(-1, env_int("REDO_TEST_ENV_INT"));
        env::set_var("REDO_TEST_ENV_INT", "junk");
        assert_eq!(-1, env_int("REDO_TEST_ENV_INT"));
        env::remove_var("REDO_TEST_ENV_INT");
        assert_eq!(-1, env_int("REDO_TEST_ENV_INT"));
    }
}
