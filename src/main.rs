/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::env;
use std::io::{self, Write as _};
use std::process;

use clap::Parser;
use log::{error, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use args::Args;
use context::Context;
use depfile::DepWriter;
use error::FatalError;
use scheduler::TokenPool;

mod args;
mod check;
mod context;
mod cycle;
mod depfile;
mod dofile;
mod error;
mod hash;
mod lock;
mod paths;
mod runner;
mod scheduler;

fn main() {
    let program = program_name();
    let args = Args::parse();
    if let Err(err) = args.apply() {
        eprintln!("error: {:#}", err);
        process::exit(100);
    }
    init_logger();

    if let Err(err) = run(&program, &args.targets) {
        error!("error: {:#}", err);
        process::exit(error::exit_code(&err));
    }
}

/// The verb is the basename the binary was invoked under; installations
/// symlink the aliases onto one executable.
fn program_name() -> String {
    let arg0 = env::args().next().unwrap_or_default();
    match arg0.rfind('/') {
        Some(pos) => arg0[pos + 1..].to_owned(),
        None => arg0,
    }
}

fn init_logger() {
    let level = if context::env_int(context::ENV_DEBUG) > 0 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .expect("logger config");
    log4rs::init_config(config).expect("failed to init logger");
}

fn run(program: &str, targets: &[String]) -> anyhow::Result<()> {
    let mut ctx = Context::init()?;

    match program {
        "redo" => {
            // unconditional rebuild of the named targets, but not of their
            // recursively checked dependencies in child invocations
            ctx.flags.force = 1;
            let targets = if targets.is_empty() {
                vec!["all".to_owned()]
            } else {
                targets.to_vec()
            };
            let mut pool = TokenPool::create()?;
            scheduler::build(&ctx, &mut pool, &targets)?;
            pool.procure();
        }
        "redo-ifchange" => {
            ctx.uprel = depfile::uprel(&env::var(context::ENV_DIRPREFIX).unwrap_or_default());
            let mut pool = TokenPool::create()?;
            scheduler::build(&ctx, &mut pool, targets)?;
            scheduler::record_deps(&ctx, targets)?;
            pool.procure();
        }
        "redo-ifcreate" => {
            let mut writer = match depfile::writer_from_env(String::new()) {
                Some(writer) => writer,
                None => return Err(FatalError::OutsideRecipe("redo-ifcreate").into()),
            };
            for target in targets {
                writer.record_absent(target)?;
            }
        }
        "redo-always" => {
            let mut writer = match depfile::writer_from_env(String::new()) {
                Some(writer) => writer,
                None => return Err(FatalError::OutsideRecipe("redo-always").into()),
            };
            writer.record_always()?;
        }
        "redo-hash" => {
            let stdout = io::stdout();
            let mut writer = DepWriter::new(stdout.lock(), String::new());
            for target in targets {
                writer.record_used(target)?;
            }
            io::stdout().flush().ok();
        }
        other => return Err(FatalError::UnknownAlias(other.to_owned()).into()),
    }
    Ok(())
}
