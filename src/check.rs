/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::debug;

use crate::context::Context;
use crate::depfile::DepEntry;
use crate::dofile;
use crate::hash;
use crate::paths::{self, DirHandle};

/// Whether `target`, resolved against `dir`, is already up to date.
///
/// Recurses through the recorded dependencies; each level enters the
/// dependency's directory and restores it afterwards through a directory
/// handle opened for that level. Any unreadable or malformed state means
/// "rebuild", since the build will recreate it.
pub fn check_deps(ctx: &Context, dir: &DirHandle, target: &str) -> anyhow::Result<bool> {
    let base = paths::enter_target_dir(dir, target)?;

    if is_source(ctx, base) {
        debug!("not rebuilt, is source file: {}", base);
        return Ok(true);
    }
    if ctx.flags.force > 0 {
        debug!("rebuild, force flag active: {}", base);
        return Ok(false);
    }

    let depfile = paths::dep_path(base);
    let file = match File::open(&depfile) {
        Ok(file) => file,
        Err(_) => {
            debug!("rebuild, dep file cannot be opened: {}", base);
            return Ok(false);
        }
    };

    let here = DirHandle::open_cwd()?;
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => {
                debug!("rebuild, error while reading dep file: {}", base);
                return Ok(false);
            }
        };
        match DepEntry::parse(&line) {
            Err(_) => {
                debug!("rebuild, invalid dep file line: {}", base);
                return Ok(false);
            }
            Ok(DepEntry::Absent { path }) => {
                if Path::new(&path).exists() {
                    debug!("rebuild, dependency {} must not exist: {}", path, base);
                    return Ok(false);
                }
            }
            Ok(DepEntry::Always) => {
                debug!("rebuild, forced by ! line: {}", base);
                return Ok(false);
            }
            Ok(DepEntry::Used {
                hash: want_hash,
                stamp: want_stamp,
                path,
            }) => {
                let mut file = match File::open(&path) {
                    Ok(file) => file,
                    Err(_) => {
                        debug!("rebuild, cannot open dependency {}: {}", path, base);
                        return Ok(false);
                    }
                };
                let meta = match file.metadata() {
                    Ok(meta) => meta,
                    Err(_) => {
                        debug!("rebuild, cannot stat dependency {}: {}", path, base);
                        return Ok(false);
                    }
                };
                if hash::stamp(&meta) != want_stamp {
                    debug!("rebuild, timestamp mismatch for {}: {}", path, base);
                    return Ok(false);
                }
                let current = match hash::hash_file(&mut file) {
                    Ok(current) => current,
                    Err(_) => {
                        debug!("rebuild, cannot read dependency {}: {}", path, base);
                        return Ok(false);
                    }
                };
                if hash::hex(&current) != want_hash {
                    debug!("rebuild, hash mismatch for {}: {}", path, base);
                    return Ok(false);
                }
                // a self entry is only stamped, never traversed
                if path != base {
                    let ok = check_deps(ctx, &here, &path)?;
                    here.chdir()?;
                    if !ok {
                        debug!("rebuild, dependency needs rebuild for {}: {}", path, base);
                        return Ok(false);
                    }
                }
            }
        }
    }

    debug!("not rebuilt, already up to date: {}", base);
    Ok(true)
}

/// A target with no dep file was never built by us. With the force flag unset
/// it is a source exactly when the file exists; with it set, exactly when no
/// dofile can be found for it (a missing file with no dofile surfaces as an
/// error at build time instead).
fn is_source(ctx: &Context, base: &str) -> bool {
    if Path::new(&paths::dep_path(base)).exists() {
        return false;
    }
    if ctx.flags.force < 0 {
        return Path::new(base).exists();
    }
    dofile::find_dofile(base).is_none()
}
