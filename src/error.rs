/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use thiserror::Error;

/// Failures that carry an exit-status policy. Everything else travels as a
/// plain `anyhow` chain and exits 1.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("no dofile for {0}")]
    NoDofile(String),
    #[error("cyclic dependency {target} [{pid}]")]
    CyclicDependency { target: String, pid: String },
    #[error("{0} must be invoked from within a .do file")]
    OutsideRecipe(&'static str),
    #[error("not implemented {0}")]
    UnknownAlias(String),
    /// Could not start a recipe process; behaves like a failed recipe.
    #[error("{0}")]
    RecipeStart(String),
    #[error("failed with status {status} [{pid}]")]
    RecipeFailed { status: i32, pid: i32 },
    #[error("{0}")]
    Setup(String),
    #[error("{0}")]
    Filesystem(String),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::NoDofile(_) => 1,
            FatalError::OutsideRecipe(_) => 1,
            FatalError::UnknownAlias(_) => 1,
            FatalError::CyclicDependency { .. } => 255,
            FatalError::RecipeStart(_) => 255,
            FatalError::RecipeFailed { status, .. } => *status,
            FatalError::Setup(_) => 100,
            FatalError::Filesystem(_) => 111,
        }
    }
}

/// Exit status for a failed invocation, 1 unless a `FatalError` says otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<FatalError>() {
        Some(fatal) => fatal.exit_code(),
        None => 1,
    }
}
