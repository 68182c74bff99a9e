// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-repository sync engine: materializes directories, stages
//! packages, generates metadata and maintains the version links.

use std::path::{Path, PathBuf};

use chrono::Local;
use itertools::Itertools;
use log::debug;
use thiserror::Error;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::metadata::{self, Passthrough};
use crate::package::{Fetcher, Origin, Package};
use crate::progress::{Event, Reporter};
use crate::repository::{self, Layout, LinkType, Repository, Source};
use crate::stager::{self, Stager};
use crate::{request, source, util};

pub struct Engine {
    repo: Repository,
    layout: Layout,
}

impl Engine {
    /// Validate the repository configuration and derive the on-disk
    /// layout. The version template renders exactly once, here.
    pub fn new(repo: Repository, base_dir: &Path) -> Result<Self, repository::Error> {
        repo.validate()?;
        let layout = Layout::derive(base_dir, &repo, Local::now())?;

        Ok(Self { repo, layout })
    }

    pub fn id(&self) -> &repository::Id {
        &self.repo.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run the full sync. Every failure surfaces as exactly one
    /// `RepoError` event; cancellation surfaces as the `Cancelled`
    /// error alone.
    pub async fn sync(
        &self,
        fetcher: &dyn Fetcher,
        reporter: &Reporter,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match self.run(fetcher, reporter, workers, cancel).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(error) => {
                reporter.emit(Event::RepoError {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        fetcher: &dyn Fetcher,
        reporter: &Reporter,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.setup_directories().await?;
        self.download_gpgkeys(reporter).await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (candidates, group) = source::enumerate(&self.repo).await?;

        let stager = Stager {
            repo: &self.repo,
            layout: &self.layout,
            fetcher,
            reporter,
            workers,
            cancel,
        };
        let effective = stager.run(candidates).await.map_err(|error| match error {
            stager::Error::Cancelled => Error::Cancelled,
            other => Error::Stage(other),
        })?;

        reporter.emit(Event::RepoComplete);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let passthrough = self.fetch_group_data(group, reporter).await;
        self.prepare_metadata(&effective, passthrough, reporter, workers)
            .await?;
        self.write_filelist(&effective)?;
        self.create_links(reporter)?;

        Ok(())
    }

    /// Materialize `packages/` and the versioned tree per link type,
    /// replacing stale links or directories from earlier runs with a
    /// different configuration
    async fn setup_directories(&self) -> Result<(), Error> {
        let repo = self.repo.clone();
        let layout = self.layout.clone();

        task::spawn_blocking(move || {
            let package_dir = &layout.package_dir;

            if let (Source::LocalDir(paths), LinkType::Symlink) = (&repo.source, repo.link_type) {
                let is_link = package_dir.symlink_metadata().is_ok_and(|m| m.is_symlink());
                if !is_link && package_dir.is_dir() {
                    util::remove_dir_all(package_dir)?;
                }

                if let [path] = paths.as_slice() {
                    util::place_symlink(package_dir, path)?;
                } else {
                    util::ensure_dir(package_dir)?;
                    for (index, path) in paths.iter().enumerate() {
                        util::place_symlink(&package_dir.join(format!("repo_{index}")), path)?;
                    }
                }
            } else {
                if package_dir.symlink_metadata().is_ok_and(|m| m.is_symlink()) {
                    util::remove_link(package_dir)?;
                }
                util::ensure_dir(package_dir)?;
            }

            let (Some(version_dir), Some(version_package_dir)) =
                (&layout.version_dir, &layout.version_package_dir)
            else {
                return Ok(());
            };

            // The versioned tree is rebuilt from scratch every run
            let meta = version_package_dir.symlink_metadata();
            if meta.as_ref().is_ok_and(|m| m.is_symlink() || m.is_file()) {
                util::remove_link(version_package_dir)?;
            } else if meta.is_ok_and(|m| m.is_dir()) {
                util::remove_dir_all(version_package_dir)?;
            }

            if repo.link_type == LinkType::Symlink {
                let target = util::relative_path(&layout.package_dir, version_dir);
                util::place_symlink(version_package_dir, &target)?;
            } else {
                util::ensure_dir(version_package_dir)?;
            }

            Ok(())
        })
        .await
        .expect("join directory setup")
    }

    /// Fetch any missing gpg keys next to the repository. Key failures
    /// never fail the sync.
    async fn download_gpgkeys(&self, reporter: &Reporter) {
        for url in &self.repo.gpgkeys {
            let name = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or("gpgkey")
                .to_owned();
            let dest = self.layout.dir.join(&name);

            if dest.exists() {
                reporter.emit(Event::GpgKeyExists { name });
                continue;
            }

            let fetched: Result<(), Error> = async {
                let bytes = request::get_bytes(url.clone()).await?;
                util::ensure_dir(&self.layout.dir)?;
                std::fs::write(&dest, bytes).map_err(util::Error::from)?;
                Ok(())
            }
            .await;

            match fetched {
                Ok(()) => reporter.emit(Event::GpgKeyDownload { name }),
                Err(error) => reporter.emit(Event::GpgKeyError {
                    message: format!("{name}: {error}"),
                }),
            }
        }
    }

    /// Retrieve upstream group data when the sack advertised some
    async fn fetch_group_data(
        &self,
        group: Option<url::Url>,
        reporter: &Reporter,
    ) -> Vec<Passthrough> {
        let Some(url) = group else {
            reporter.emit(Event::GroupData { available: false });
            return vec![];
        };

        match request::get_bytes(url.clone()).await {
            Ok(content) => {
                reporter.emit(Event::GroupData { available: true });

                vec![Passthrough {
                    kind: "group".into(),
                    filename: "comps.xml".into(),
                    content,
                }]
            }
            Err(error) => {
                debug!("group data at {url} unavailable: {error}");
                reporter.emit(Event::GroupData { available: false });
                vec![]
            }
        }
    }

    /// Build repodata in staging, then publish it into the versioned
    /// tree and/or the repository root
    async fn prepare_metadata(
        &self,
        effective: &[Package],
        passthrough: Vec<Passthrough>,
        reporter: &Reporter,
        workers: usize,
    ) -> Result<(), Error> {
        let builder = metadata::Builder {
            packages: self.staged_paths(effective),
            checksum: self.repo.checksum,
            workers,
            passthrough,
        };

        let progress = reporter.clone();
        let staging = task::spawn_blocking(move || {
            builder.build(&move |state| progress.emit(Event::Metadata(state)))
        })
        .await
        .expect("join metadata build")?;

        let combined = self.repo.combined_metadata;
        let root_repodata = self.layout.repodata_dir();

        match self.layout.version_repodata_dir() {
            Some(version_repodata) => {
                util::copy_dir(&staging.repodata(), &version_repodata)?;

                // Combined metadata is always rewritten when enabled
                // and always dropped when not, stale copies included
                if combined {
                    util::copy_dir(&staging.repodata(), &root_repodata)?;
                } else {
                    util::remove_dir_all(&root_repodata)?;
                }
            }
            None => {
                util::copy_dir(&staging.repodata(), &root_repodata)?;
            }
        }

        Ok(())
    }

    /// Readable path and repo relative href for every effective
    /// package, honoring the symlinked local layouts
    fn staged_paths(&self, effective: &[Package]) -> Vec<(PathBuf, String)> {
        effective
            .iter()
            .map(|package| {
                let filename = package.filename();

                if let (Source::LocalDir(paths), LinkType::Symlink, Origin::Local(src)) =
                    (&self.repo.source, self.repo.link_type, &package.origin)
                {
                    if let Some(href) = symlinked_href(paths, &self.layout.package_dir, src) {
                        return (src.clone(), href);
                    }
                }

                (
                    self.layout.package_dir.join(&filename),
                    format!("packages/{filename}"),
                )
            })
            .collect()
    }

    /// Write the plain text manifest of repo relative package paths
    fn write_filelist(&self, effective: &[Package]) -> Result<(), Error> {
        let manifest = self
            .staged_paths(effective)
            .into_iter()
            .map(|(_, href)| href)
            .join("\n");

        std::fs::write(self.layout.log_dir().join("filelist"), manifest + "\n")
            .map_err(util::Error::from)?;

        Ok(())
    }

    /// Maintain `latest`, `stable` and the custom labels
    fn create_links(&self, reporter: &Reporter) -> Result<(), Error> {
        let dir = &self.layout.dir;

        let Some(version) = &self.layout.version else {
            util::remove_link(&dir.join("latest"))?;
            util::remove_link(&dir.join("stable"))?;
            return Ok(());
        };

        util::place_symlink(&dir.join("latest"), Path::new(version))?;
        reporter.emit(Event::LinkSet {
            label: "latest".into(),
            target: version.clone(),
        });

        match &self.repo.stable {
            Some(stable) => {
                util::place_symlink(&dir.join("stable"), Path::new(stable))?;
                reporter.emit(Event::LinkSet {
                    label: "stable".into(),
                    target: stable.clone(),
                });
            }
            None => {
                util::remove_link(&dir.join("stable"))?;
            }
        }

        for (label, target) in &self.repo.labels {
            util::place_symlink(&dir.join(label), Path::new(target))?;
            reporter.emit(Event::LinkSet {
                label: label.clone(),
                target: target.clone(),
            });
        }

        Ok(())
    }
}

/// Href of a package reachable through a symlinked `packages` tree:
/// its path relative to whichever source root (or the package dir
/// itself) contains it
fn symlinked_href(paths: &[PathBuf], package_dir: &Path, src: &Path) -> Option<String> {
    if let Ok(rel) = src.strip_prefix(package_dir) {
        return Some(format!("packages/{}", rel.display()));
    }

    if let [root] = paths {
        let rel = src.strip_prefix(root).ok()?;
        return Some(format!("packages/{}", rel.display()));
    }

    paths.iter().enumerate().find_map(|(index, root)| {
        let rel = src.strip_prefix(root).ok()?;
        Some(format!("packages/repo_{index}/{}", rel.display()))
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("enumerate packages: {0}")]
    Source(#[from] source::Error),
    #[error(transparent)]
    Stage(stager::Error),
    #[error("build metadata: {0}")]
    Metadata(#[from] metadata::Error),
    #[error(transparent)]
    Fs(#[from] util::Error),
    #[error("fetch: {0}")]
    Request(#[from] request::Error),
    #[error("cancelled")]
    Cancelled,
}
