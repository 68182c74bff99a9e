// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Arg, ArgAction, Command};
use thiserror::Error;

mod sync;
mod version;

/// Generate the CLI command structure
fn command() -> Command {
    Command::new("rpmsync")
        .about("Mirror and version YUM repositories")
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .global(true)
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg_required_else_help(true)
        .subcommand(sync::command())
        .subcommand(version::command())
}

/// Process all CLI arguments
pub async fn process() -> Result<(), Error> {
    let matches = command().get_matches();

    install_logger(matches.get_flag("verbose"));

    if matches.get_flag("version") {
        version::print();
        return Ok(());
    }

    match matches.subcommand() {
        Some(("sync", args)) => sync::handle(args).await.map_err(Error::Sync),
        Some(("version", _)) => {
            version::print();
            Ok(())
        }
        _ => unreachable!(),
    }
}

fn install_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    if log::set_boxed_logger(Box::new(Logger)).is_ok() {
        log::set_max_level(level);
    }
}

/// Plain stderr logger, progress rendering owns stdout
struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("{}: {}", record.level().to_string().to_lowercase(), record.args());
        }
    }

    fn flush(&self) {}
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("sync: {0}")]
    Sync(#[from] sync::Error),
}
