// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Progress event vocabulary. Engines emit [`Event`]s through a
//! channel handle, a single aggregator folds them into [`Aggregate`]
//! counters and forwards them to whatever [`Sink`] the frontend
//! provides.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::repository;

/// State of a repository's metadata generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum MetadataState {
    #[strum(serialize = "building")]
    Building,
    /// Percentage of package headers folded into the indexes
    #[strum(to_string = "{0}%")]
    Progress(u8),
    #[strum(serialize = "complete")]
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Package enumeration finished, `total` candidates known
    RepoInit { total: usize, is_local: bool },
    DownloadStart { name: String, size: Option<u64> },
    DownloadUpdate { name: String, bytes: u64 },
    DownloadEnd { name: String },
    /// A candidate already exists on disk and validated
    PackageExists { name: String },
    /// A local package was newly linked into the repository
    LinkLocalPackage { name: String, size: u64 },
    /// An orphan was pruned
    DeletePackage { name: String },
    GpgKeyDownload { name: String },
    GpgKeyExists { name: String },
    GpgKeyError { message: String },
    Metadata(MetadataState),
    GroupData { available: bool },
    /// A `latest`/`stable`/label symlink was (re)pointed
    LinkSet { label: String, target: String },
    RepoComplete,
    RepoError { message: String },
}

/// An [`Event`] stamped with its originating repository
#[derive(Debug, Clone)]
pub struct Report {
    pub repo: repository::Id,
    pub event: Event,
}

/// Consumer of aggregated progress, implemented by frontends
pub trait Sink {
    fn handle(&mut self, report: &Report, totals: &Aggregate);
}

/// A no-op sink for headless use
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Sink for Discard {
    fn handle(&mut self, _report: &Report, _totals: &Aggregate) {}
}

/// Message-only handle engines use to report progress. Holding one does
/// not keep the aggregator alive.
#[derive(Debug, Clone)]
pub struct Reporter {
    repo: repository::Id,
    sender: mpsc::UnboundedSender<Report>,
}

impl Reporter {
    pub fn new(repo: repository::Id, sender: mpsc::UnboundedSender<Report>) -> Self {
        Self { repo, sender }
    }

    /// Send an event. Delivery is best-effort: once the aggregator is
    /// gone (shutdown) events are dropped silently.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(Report {
            repo: self.repo.clone(),
            event,
        });
    }
}

/// Per-repository tallies
#[derive(Debug, Clone, Default)]
pub struct RepoTotals {
    pub total_pkgs: usize,
    pub done_pkgs: usize,
    pub metadata: Option<MetadataState>,
    pub failed: bool,
}

/// The single-owner fold over every repository's events
#[derive(Debug, Default)]
pub struct Aggregate {
    pub repos: HashMap<repository::Id, RepoTotals>,
    pub total_pkgs: usize,
    pub done_pkgs: usize,
    pub md_total: usize,
    pub md_done: usize,
    pub errors: Vec<(repository::Id, String)>,
}

impl Aggregate {
    pub fn new(repos: impl IntoIterator<Item = repository::Id>) -> Self {
        let repos: HashMap<_, _> = repos
            .into_iter()
            .map(|id| (id, RepoTotals::default()))
            .collect();

        Self {
            md_total: repos.len(),
            repos,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, report: &Report) {
        let entry = self.repos.entry(report.repo.clone()).or_default();

        match &report.event {
            Event::RepoInit { total, .. } => {
                entry.total_pkgs = *total;
                self.total_pkgs = self.repos.values().map(|r| r.total_pkgs).sum();
            }
            Event::DownloadEnd { .. }
            | Event::PackageExists { .. }
            | Event::LinkLocalPackage { .. } => {
                entry.done_pkgs += 1;
                self.done_pkgs += 1;
            }
            Event::Metadata(state) => {
                entry.metadata = Some(*state);
                if *state == MetadataState::Complete {
                    self.md_done += 1;
                }
            }
            Event::RepoError { message } => {
                entry.failed = true;
                self.errors.push((report.repo.clone(), message.clone()));
            }
            _ => {}
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(s: &str) -> repository::Id {
        repository::Id::new(s)
    }

    #[test]
    fn aggregate_counts_packages_and_errors() {
        let mut agg = Aggregate::new([id("a"), id("b")]);
        assert_eq!(agg.md_total, 2);

        agg.apply(&Report {
            repo: id("a"),
            event: Event::RepoInit {
                total: 3,
                is_local: false,
            },
        });
        agg.apply(&Report {
            repo: id("b"),
            event: Event::RepoInit {
                total: 2,
                is_local: true,
            },
        });
        assert_eq!(agg.total_pkgs, 5);

        agg.apply(&Report {
            repo: id("a"),
            event: Event::PackageExists { name: "x".into() },
        });
        agg.apply(&Report {
            repo: id("a"),
            event: Event::DownloadEnd { name: "y".into() },
        });
        assert_eq!(agg.done_pkgs, 2);

        agg.apply(&Report {
            repo: id("b"),
            event: Event::RepoError {
                message: "unreachable".into(),
            },
        });
        assert_eq!(agg.error_count(), 1);
        assert!(agg.repos[&id("b")].failed);
    }

    #[test]
    fn metadata_state_formatting() {
        assert_eq!(MetadataState::Building.to_string(), "building");
        assert_eq!(MetadataState::Progress(40).to_string(), "40%");
        assert_eq!(MetadataState::Complete.to_string(), "complete");
    }
}
