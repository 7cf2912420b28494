/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::env;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use crate::context::{
    set_env_int, ENV_DEBUG, ENV_FORCE, ENV_JOBS, ENV_KEEP_GOING, ENV_TRACE, ENV_VERBOSE,
};

/// Flag surface shared by every alias. Each flag is reflected into the
/// environment so recipes and their nested invocations inherit it.
#[derive(Parser, Debug)]
#[command(about = "Incremental rebuild engine of the redo family", long_about = None)]
#[command(disable_version_flag = true)]
pub struct Args {
    /// Explain every rebuild decision
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Rebuild targets even when they are up to date
    #[arg(short = 'f')]
    pub force: bool,

    /// Continue with remaining targets after a recipe fails
    #[arg(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Trace dispatched recipes
    #[arg(short = 'v', long = "verbose", alias = "print")]
    pub verbose: bool,

    /// Operate quietly
    #[arg(short = 'V', long = "quiet", alias = "silent")]
    pub quiet: bool,

    /// Run shell recipes with tracing (-x)
    #[arg(short = 'x')]
    pub trace: bool,

    /// Turn shell tracing off again
    #[arg(short = 'X')]
    pub no_trace: bool,

    /// Allow N jobs to run in parallel
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    pub jobs: Option<u32>,

    /// Change to directory before doing anything
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Targets to bring up to date
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub targets: Vec<String>,
}

impl Args {
    /// Push the parsed flags into the environment and honor `-C`.
    pub fn apply(&self) -> anyhow::Result<()> {
        if self.debug {
            set_env_int(ENV_DEBUG, 1);
        }
        if self.force {
            set_env_int(ENV_FORCE, 1);
        }
        if self.keep_going {
            set_env_int(ENV_KEEP_GOING, 1);
        }
        if self.verbose {
            set_env_int(ENV_VERBOSE, 1);
        }
        if self.quiet {
            set_env_int(ENV_VERBOSE, 0);
            set_env_int(ENV_DEBUG, 0);
        }
        if self.trace {
            set_env_int(ENV_TRACE, 1);
        }
        if self.no_trace {
            set_env_int(ENV_TRACE, 0);
        }
        if let Some(jobs) = self.jobs {
            env::set_var(ENV_JOBS, jobs.to_string());
        }
        if let Some(dir) = &self.directory {
            env::set_current_dir(dir)
                .with_context(|| format!("failed to change directory to '{}'", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from(["redo", "-d", "-k", "-j", "4", "a", "b"]);
        assert!(args.debug);
        assert!(args.keep_going);
        assert!(!args.force);
        assert_eq!(Some(4), args.jobs);
        assert_eq!(vec!["a".to_owned(), "b".to_owned()], args.targets);
    }

    #[test]
    fn test_long_forms() {
        let args = Args::parse_from(["redo", "--keep-going", "--silent", "--jobs", "2", "all"]);
        assert!(args.keep_going);
        assert!(args.quiet);
        assert_eq!(Some(2), args.jobs);
        assert_eq!(vec!["all".to_owned()], args.targets);
    }

    #[test]
    fn test_options_stop_at_first_target() {
        let args = Args::parse_from(["redo-ifchange", "target", "-d"]);
        assert!(!args.debug);
        assert_eq!(vec!["target".to_owned(), "-d".to_owned()], args.targets);
    }
}
