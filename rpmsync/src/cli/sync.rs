// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{arg, value_parser, ArgMatches, Command};
use crossterm::style::Stylize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use thiserror::Error;

use rpmsync::environment;
use rpmsync::package::fetch::HttpFetcher;
use rpmsync::progress::{Aggregate, Event, MetadataState, Report, Sink};
use rpmsync::sync::Outcome;
use rpmsync::{config, repository, sync, util, Engine};

pub fn command() -> Command {
    Command::new("sync")
        .about("Mirror the configured repositories")
        .arg(
            arg!(-c --config <CONFIG> "repository configuration file")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-d --dest <DIR> "base output directory")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-w --workers <N> "downloads and header parses per repository")
                .default_value(environment::DEFAULT_WORKERS.to_string())
                .value_parser(value_parser!(usize)),
        )
        .arg(
            arg!(-p --parallel <N> "repositories synced at once")
                .default_value(environment::DEFAULT_REPO_CONCURRENCY.to_string())
                .value_parser(value_parser!(usize)),
        )
}

pub async fn handle(args: &ArgMatches) -> Result<(), Error> {
    let config = args.get_one::<PathBuf>("config").unwrap();
    let base_dir = args.get_one::<PathBuf>("dest").unwrap();
    let workers = *args.get_one::<usize>("workers").unwrap();
    let parallel = *args.get_one::<usize>("parallel").unwrap();

    let repos = config::load(config)?;

    util::ensure_dir(base_dir)?;
    let base_dir = base_dir.canonicalize().map_err(util::Error::from)?;

    let engines = repos
        .into_iter()
        .map(|repo| Engine::new(repo, &base_dir))
        .collect::<Result<Vec<_>, _>>()?;

    let mut console = Console::new(&engines);
    let outcome = sync::run(engines, Arc::new(HttpFetcher), &mut console, workers, parallel).await?;
    console.finish(&outcome);

    if outcome.is_success() {
        Ok(())
    } else {
        Err(Error::Failed {
            errors: outcome.error_count,
            cancelled: outcome.cancelled,
        })
    }
}

/// Terminal rendering of the aggregated progress
struct Console {
    multi: MultiProgress,
    repos: HashMap<repository::Id, ProgressBar>,
    total: ProgressBar,
}

impl Console {
    fn new(engines: &[Engine]) -> Self {
        let multi = MultiProgress::new();

        let repos = engines
            .iter()
            .map(|engine| {
                let bar = multi.add(
                    ProgressBar::new_spinner()
                        .with_style(spinner_style())
                        .with_prefix(engine.id().friendly()),
                );
                bar.enable_steady_tick(Duration::from_millis(150));
                (engine.id().clone(), bar)
            })
            .collect();

        let total = multi.add(
            ProgressBar::new(0).with_style(
                ProgressStyle::with_template("\n|{bar:20.cyan/blue}| {pos}/{len}")
                    .unwrap()
                    .progress_chars("■≡=- "),
            ),
        );
        total.tick();

        Self {
            multi,
            repos,
            total,
        }
    }

    fn finish(&self, outcome: &Outcome) {
        self.multi.clear().ok();

        let elapsed = outcome.elapsed.as_secs();
        let summary = format!(
            "{} repositories, {} errors, {}m{:02}s",
            outcome.repo_count,
            outcome.error_count,
            elapsed / 60,
            elapsed % 60,
        );

        if outcome.cancelled {
            println!("{} {summary}", "Cancelled".red());
        } else if outcome.error_count > 0 {
            println!("{} {summary}", "Finished".yellow());
        } else {
            println!("{} {summary}", "Synced".green());
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(" {spinner} {prefix:.bold} {wide_msg}")
        .unwrap()
        .tick_chars("--=≡■≡=--")
}

impl Sink for Console {
    fn handle(&mut self, report: &Report, totals: &Aggregate) {
        let Some(bar) = self.repos.get(&report.repo) else {
            return;
        };

        match &report.event {
            Event::RepoInit { total, is_local } => {
                self.total.set_length(totals.total_pkgs as u64);
                let origin = if *is_local { "local" } else { "remote" };
                bar.set_message(format!("{total} packages ({origin})"));
            }
            Event::DownloadStart { name, .. } => {
                bar.set_message(format!("{} {name}", "Fetching".blue()));
            }
            Event::DownloadEnd { name } => {
                bar.set_message(format!("{} {name}", "Fetched".green()));
                self.total.inc(1);
            }
            Event::PackageExists { .. } | Event::LinkLocalPackage { .. } => {
                self.total.inc(1);
            }
            Event::DeletePackage { name } => {
                bar.set_message(format!("{} {name}", "Pruned".yellow()));
            }
            Event::GpgKeyDownload { name } | Event::GpgKeyExists { name } => {
                bar.set_message(format!("{} {name}", "Key".blue()));
            }
            Event::GpgKeyError { message } => {
                bar.set_message(format!("{} {message}", "Key".red()));
            }
            Event::Metadata(state) => match state {
                MetadataState::Building => bar.set_message("building metadata"),
                MetadataState::Progress(pct) => bar.set_message(format!("metadata {pct}%")),
                MetadataState::Complete => bar.set_message("metadata complete"),
            },
            Event::GroupData { available } => {
                if *available {
                    bar.set_message("group data available");
                }
            }
            Event::LinkSet { label, target } => {
                bar.set_message(format!("{label} -> {target}"));
            }
            Event::RepoComplete => {
                bar.set_message(format!("{}", "packages complete".green()));
            }
            Event::RepoError { message } => {
                bar.finish_with_message(format!("{}", message.clone().red()));
            }
            Event::DownloadUpdate { .. } => {}
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("invalid repository: {0}")]
    Repository(#[from] repository::Error),
    #[error(transparent)]
    Orchestrator(#[from] sync::Error),
    #[error("filesystem: {0}")]
    Fs(#[from] util::Error),
    #[error("{errors} repositories failed (cancelled: {cancelled})")]
    Failed { errors: usize, cancelled: bool },
}
