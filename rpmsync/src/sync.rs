// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Fan-out over repositories: a bounded pool of engine tasks feeding
//! one event channel, drained by the single aggregator that owns the
//! counters. Interrupt and termination signals cancel in-flight work
//! cooperatively, then force shutdown after a short grace window.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use log::warn;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::environment;
use crate::package::Fetcher;
use crate::progress::{Aggregate, Report, Reporter, Sink};

/// The result of a full sync run
#[derive(Debug)]
pub struct Outcome {
    pub repo_count: usize,
    pub error_count: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.error_count == 0 && !self.cancelled
    }
}

/// Run every engine to completion, with at most `parallelism` repos in
/// flight and `workers` inner tasks per repo
pub async fn run(
    engines: Vec<Engine>,
    fetcher: Arc<dyn Fetcher>,
    sink: &mut dyn Sink,
    workers: usize,
    parallelism: usize,
) -> Result<Outcome, Error> {
    let started = Instant::now();
    let repo_count = engines.len();

    ensure_distinct(&engines)?;

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone());

    let (sender, mut receiver) = mpsc::unbounded_channel::<Report>();
    let mut aggregate = Aggregate::new(engines.iter().map(|e| e.id().clone()));

    let jobs: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            let sender = sender.clone();
            let cancel = cancel.clone();
            let fetcher = Arc::clone(&fetcher);

            async move {
                let reporter = Reporter::new(engine.id().clone(), sender);
                engine
                    .sync(fetcher.as_ref(), &reporter, workers, &cancel)
                    .await
            }
        })
        .collect();
    // The channel closes once every task reporter is gone
    drop(sender);

    let mut tasks = stream::iter(jobs).buffer_unordered(parallelism.max(1));

    let drive = async {
        let mut tasks_done = false;

        loop {
            tokio::select! {
                report = receiver.recv() => match report {
                    Some(report) => {
                        aggregate.apply(&report);
                        sink.handle(&report, &aggregate);
                    }
                    None => break,
                },
                result = tasks.next(), if !tasks_done => {
                    if result.is_none() {
                        tasks_done = true;
                    }
                },
            }
        }
    };

    // A cancelled run gets a grace window for cooperative shutdown,
    // after which the remaining futures are dropped outright
    let forced = {
        let cancel = cancel.clone();
        async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(environment::SHUTDOWN_GRACE_MS)).await;
        }
    };

    tokio::select! {
        () = drive => {}
        () = forced => {
            warn!("shutdown grace expired, aborting in-flight repositories");
        }
    }

    Ok(Outcome {
        repo_count,
        error_count: aggregate.error_count(),
        elapsed: started.elapsed(),
        cancelled: cancel.is_cancelled(),
    })
}

/// Two repositories flattening to the same directory would trample
/// each other, reject the configuration outright
fn ensure_distinct(engines: &[Engine]) -> Result<(), Error> {
    let mut seen = HashSet::new();

    for engine in engines {
        let friendly = engine.id().friendly();
        if !seen.insert(friendly.clone()) {
            return Err(Error::DuplicateId(friendly));
        }
    }

    Ok(())
}

/// Cancel the run on SIGINT or SIGTERM
fn watch_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let interrupted = tokio::signal::ctrl_c();
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(error) => {
                warn!("cannot install SIGTERM handler: {error}");
                let _ = interrupted.await;
                cancel.cancel();
                return;
            }
        };

        tokio::select! {
            _ = interrupted => {}
            _ = terminate.recv() => {}
        }

        cancel.cancel();
    });
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate repository id {0:?}")]
    DuplicateId(String),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::Path;

    use crate::package::fetch::HttpFetcher;
    use crate::progress::Discard;
    use crate::repository::{ChecksumKind, Id, LinkType, Repository, Source};

    use super::*;

    fn write_rpm(dir: &Path, name: &str) {
        let bytes = rpm::Builder::new(name, "1.0", "1", "x86_64").build().unwrap();
        std::fs::write(dir.join(format!("{name}-1.0-1.x86_64.rpm")), bytes).unwrap();
    }

    fn local_repo(id: &str, source: &Path) -> Repository {
        Repository {
            id: Id::new(id),
            source: Source::LocalDir(vec![source.to_owned()]),
            include: vec![],
            exclude: vec![],
            checksum: ChecksumKind::default(),
            link_type: LinkType::Hardlink,
            delete: false,
            combined_metadata: false,
            version_template: None,
            stable: None,
            labels: BTreeMap::new(),
            newest_only: false,
            src_pkgs: false,
            gpgkeys: vec![],
        }
    }

    #[tokio::test]
    async fn syncs_repositories_in_parallel() {
        let source = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        write_rpm(source.path(), "foo");

        let engines = vec![
            Engine::new(local_repo("a", source.path()), base.path()).unwrap(),
            Engine::new(local_repo("b", source.path()), base.path()).unwrap(),
        ];

        let outcome = run(engines, Arc::new(HttpFetcher), &mut Discard, 2, 2)
            .await
            .unwrap();

        assert_eq!(outcome.repo_count, 2);
        assert_eq!(outcome.error_count, 0);
        assert!(outcome.is_success());
        assert!(base.path().join("a/repodata/repomd.xml").exists());
        assert!(base.path().join("b/repodata/repomd.xml").exists());
    }

    #[tokio::test]
    async fn failed_repo_does_not_fail_the_rest() {
        let source = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        write_rpm(source.path(), "foo");

        let engines = vec![
            Engine::new(local_repo("good", source.path()), base.path()).unwrap(),
            Engine::new(local_repo("broken", Path::new("/nonexistent/path")), base.path())
                .unwrap(),
        ];

        let outcome = run(engines, Arc::new(HttpFetcher), &mut Discard, 2, 2)
            .await
            .unwrap();

        assert_eq!(outcome.error_count, 1);
        assert!(!outcome.is_success());
        assert!(base.path().join("good/repodata/repomd.xml").exists());
    }

    #[tokio::test]
    async fn duplicate_friendly_ids_are_rejected() {
        let source = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();

        let engines = vec![
            Engine::new(local_repo("el/9", source.path()), base.path()).unwrap(),
            Engine::new(local_repo("el_9", source.path()), base.path()).unwrap(),
        ];

        assert!(matches!(
            run(engines, Arc::new(HttpFetcher), &mut Discard, 2, 2).await,
            Err(Error::DuplicateId(_))
        ));
    }
}
