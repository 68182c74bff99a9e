// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Package staging: makes the candidate list real on disk. Remote
//! candidates are validated or fetched, local ones are linked, orphans
//! are pruned or adopted, and the versioned tree is populated.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt, TryStreamExt};
use log::debug;
use thiserror::Error;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::package::{fetch, Evr, Fetcher, Origin, Package};
use crate::progress::{Event, Reporter};
use crate::repository::{ChecksumKind, Layout, LinkType, Repository};
use crate::{metadata, util};

pub struct Stager<'a> {
    pub repo: &'a Repository,
    pub layout: &'a Layout,
    pub fetcher: &'a dyn Fetcher,
    pub reporter: &'a Reporter,
    pub workers: usize,
    pub cancel: &'a CancellationToken,
}

impl Stager<'_> {
    /// Drive staging to completion: returns the effective package list
    /// in metadata order.
    pub async fn run(&self, candidates: Vec<Package>) -> Result<Vec<Package>, Error> {
        self.reporter.emit(Event::RepoInit {
            total: candidates.len(),
            is_local: self.repo.is_local(),
        });

        if self.repo.is_local() {
            self.stage_local(candidates.clone()).await?;
        } else {
            self.stage_remote(&candidates).await?;
        }

        let effective = self.prune(candidates).await?;
        self.version_link(effective).await
    }

    /// Parallel download / revalidation of remote candidates
    async fn stage_remote(&self, candidates: &[Package]) -> Result<(), Error> {
        stream::iter(candidates.iter().map(|package| self.stage_one(package)))
            .buffer_unordered(self.workers.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        Ok(())
    }

    async fn stage_one(&self, package: &Package) -> Result<(), Error> {
        let Origin::Remote(url) = &package.origin else {
            return Ok(());
        };

        let name = package.filename();
        let dest = self.layout.package_dir.join(&name);

        if dest.exists() {
            let check = package.clone();
            let check_dest = dest.clone();
            let valid = task::spawn_blocking(move || validate_existing(&check_dest, &check))
                .await
                .expect("join validation task");

            if valid {
                self.reporter.emit(Event::PackageExists { name });
                return Ok(());
            }
        }

        self.reporter.emit(Event::DownloadStart {
            name: name.clone(),
            size: package.size,
        });

        let reporter = self.reporter.clone();
        let progress_name = name.clone();
        let on_progress = move |progress: fetch::Progress| {
            reporter.emit(Event::DownloadUpdate {
                name: progress_name.clone(),
                bytes: progress.delta,
            });
        };

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.fetcher.fetch(url, &dest, package.size, &on_progress) => {
                result.map_err(|source| Error::Download {
                    name: name.clone(),
                    source,
                })
            }
        };

        if let Err(error) = fetched {
            // Never leave a partial rpm where the next run would trust it
            let _ = std::fs::remove_file(&dest);
            return Err(error);
        }

        self.reporter.emit(Event::DownloadEnd { name });

        Ok(())
    }

    /// Link or account for local candidates
    async fn stage_local(&self, candidates: Vec<Package>) -> Result<(), Error> {
        let link_type = self.repo.link_type;
        let package_dir = self.layout.package_dir.clone();
        let reporter = self.reporter.clone();

        task::spawn_blocking(move || {
            for package in candidates {
                let Origin::Local(source) = &package.origin else {
                    continue;
                };
                let name = package.filename();
                let dest = package_dir.join(&name);

                match link_type {
                    LinkType::Hardlink => {
                        if util::place_hardlink(source, &dest)? {
                            reporter.emit(Event::LinkLocalPackage {
                                name,
                                size: package.size.unwrap_or_default(),
                            });
                        } else {
                            reporter.emit(Event::PackageExists { name });
                        }
                    }
                    LinkType::IndividualSymlink => {
                        util::place_symlink(&dest, source)?;
                        reporter.emit(Event::PackageExists { name });
                    }
                    // The whole package_dir is one symlink, nothing to place
                    LinkType::Symlink => {
                        reporter.emit(Event::PackageExists { name });
                    }
                }
            }

            Ok(())
        })
        .await
        .expect("join staging task")
    }

    /// Remove orphans, or adopt them into the effective list when
    /// pruning is off. Returns the effective list sorted by filename.
    async fn prune(&self, candidates: Vec<Package>) -> Result<Vec<Package>, Error> {
        let package_dir = self.layout.package_dir.clone();
        let reporter = self.reporter.clone();
        // Pruning through a whole-directory symlink would delete the
        // local source tree itself
        let prune = self.repo.effective_delete()
            && !(self.repo.is_local() && self.repo.link_type == LinkType::Symlink);
        let adopt = !self.repo.delete;

        task::spawn_blocking(move || {
            let mut effective = candidates;
            let known: Vec<String> = effective.iter().map(Package::filename).collect();

            for entry in std::fs::read_dir(&package_dir).map_err(util::Error::from)? {
                let entry = entry.map_err(util::Error::from)?;
                let file_name = entry.file_name().to_string_lossy().into_owned();

                if known.contains(&file_name) {
                    continue;
                }

                if prune {
                    util::remove_link(&entry.path())?;
                    reporter.emit(Event::DeletePackage { name: file_name });
                } else if adopt {
                    // Surviving historical packages stay indexed
                    if let Some(package) = adopt_existing(&entry.path()) {
                        effective.push(package);
                    }
                }
            }

            effective.sort_by(|a, b| a.filename().cmp(&b.filename()));
            effective.dedup_by_key(|p| p.filename());

            Ok(effective)
        })
        .await
        .expect("join prune task")
    }

    /// Populate the versioned package tree per link type
    async fn version_link(&self, effective: Vec<Package>) -> Result<Vec<Package>, Error> {
        let Some(version_package_dir) = self.layout.version_package_dir.clone() else {
            return Ok(effective);
        };

        let package_dir = self.layout.package_dir.clone();
        let link_type = self.repo.link_type;
        let prune_dangling = self.repo.effective_delete();
        let reporter = self.reporter.clone();

        task::spawn_blocking(move || {
            match link_type {
                LinkType::Hardlink => {
                    for package in &effective {
                        let name = package.filename();
                        util::place_hardlink(
                            &package_dir.join(&name),
                            &version_package_dir.join(&name),
                        )?;
                    }
                }
                LinkType::IndividualSymlink => {
                    for package in &effective {
                        let name = package.filename();
                        let target =
                            util::relative_path(&package_dir.join(&name), &version_package_dir);
                        util::place_symlink(&version_package_dir.join(&name), &target)?;
                    }

                    if prune_dangling {
                        prune_dangling_links(&version_package_dir, &reporter)?;
                    }
                }
                // One `packages -> ../packages` symlink covers the tree
                LinkType::Symlink => {}
            }

            Ok(effective)
        })
        .await
        .expect("join version link task")
    }
}

/// An already-downloaded file counts when its header parses and its
/// size and digest agree with upstream
fn validate_existing(path: &Path, package: &Package) -> bool {
    if rpm::read_path(path).is_err() {
        debug!("{path:?} exists but does not parse, refetching");
        return false;
    }

    if let (Some(expected), Ok(meta)) = (package.size, path.metadata()) {
        if meta.len() != expected {
            debug!("{path:?} size mismatch, refetching");
            return false;
        }
    }

    if let Some(digest) = &package.digest {
        let kind = match digest.kind.as_str() {
            "sha" | "sha1" => ChecksumKind::Sha1,
            "sha256" => ChecksumKind::Sha256,
            // Unknown algorithm upstream, size + header must do
            _ => return true,
        };

        match metadata::hash_file(kind, path) {
            Ok((hex, _)) if hex == digest.hex => {}
            _ => {
                debug!("{path:?} digest mismatch, refetching");
                return false;
            }
        }
    }

    true
}

/// Fold an unexpected but valid rpm back into the effective list
fn adopt_existing(path: &Path) -> Option<Package> {
    let rpm = rpm::read_path(path).ok()?;
    let meta = rpm::Metadata::from_rpm(&rpm).ok()?;
    let size = path.metadata().ok().map(|m| m.len());

    Some(Package {
        name: meta.name.clone(),
        evr: Evr::new(meta.epoch, &meta.version, &meta.release),
        arch: meta.arch.clone(),
        size,
        origin: Origin::Local(path.to_owned()),
        digest: None,
    })
}

/// Drop versioned symlinks whose sources vanished
fn prune_dangling_links(dir: &Path, reporter: &Reporter) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir).map_err(util::Error::from)? {
        let entry = entry.map_err(util::Error::from)?;
        let path = entry.path();

        let is_link = path.symlink_metadata().is_ok_and(|m| m.is_symlink());
        if is_link && path.metadata().is_err() {
            util::remove_link(&path)?;
            reporter.emit(Event::DeletePackage {
                name: entry.file_name().to_string_lossy().into_owned(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("download {name}: {source}")]
    Download {
        name: String,
        source: fetch::Error,
    },
    #[error(transparent)]
    Fs(#[from] util::Error),
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::os::unix::fs::MetadataExt;

    use chrono::Local;
    use tokio::sync::mpsc;

    use crate::repository::{ChecksumKind, Id, Source};

    use super::*;

    struct PanicFetcher;

    impl Fetcher for PanicFetcher {
        fn fetch<'a>(
            &'a self,
            _url: &'a url::Url,
            _dest: &'a Path,
            _expected_size: Option<u64>,
            _on_progress: &'a (dyn Fn(fetch::Progress) + Send + Sync),
        ) -> futures::future::BoxFuture<'a, Result<(), fetch::Error>> {
            panic!("local staging must not fetch");
        }
    }

    fn write_rpm(dir: &Path, name: &str, version: &str) -> PathBuf {
        let bytes = rpm::Builder::new(name, version, "1", "x86_64").build().unwrap();
        let path = dir.join(format!("{name}-{version}-1.x86_64.rpm"));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn local_repo(source: &Path, link_type: LinkType, delete: bool) -> Repository {
        Repository {
            id: Id::new("stage"),
            source: Source::LocalDir(vec![source.to_owned()]),
            include: vec![],
            exclude: vec![],
            checksum: ChecksumKind::default(),
            link_type,
            delete,
            combined_metadata: false,
            version_template: None,
            stable: None,
            labels: BTreeMap::new(),
            newest_only: false,
            src_pkgs: false,
            gpgkeys: vec![],
        }
    }

    async fn run_stager(
        repo: &Repository,
        layout: &Layout,
        candidates: Vec<Package>,
    ) -> Result<Vec<Package>, Error> {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let reporter = Reporter::new(repo.id.clone(), sender);
        let cancel = CancellationToken::new();

        let stager = Stager {
            repo,
            layout,
            fetcher: &PanicFetcher,
            reporter: &reporter,
            workers: 2,
            cancel: &cancel,
        };

        stager.run(candidates).await
    }

    #[tokio::test]
    async fn hardlinks_local_candidates() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src_path = write_rpm(source.path(), "foo", "1.0");

        let repo = local_repo(source.path(), LinkType::Hardlink, false);
        let layout = Layout::derive(out.path(), &repo, Local::now()).unwrap();
        util::ensure_dir(&layout.package_dir).unwrap();

        let candidates = crate::source::local::scan(&repo).unwrap();
        let effective = run_stager(&repo, &layout, candidates).await.unwrap();

        assert_eq!(effective.len(), 1);

        let staged = layout.package_dir.join("foo-1.0-1.x86_64.rpm");
        assert_eq!(
            staged.metadata().unwrap().ino(),
            src_path.metadata().unwrap().ino()
        );
    }

    #[tokio::test]
    async fn prune_removes_orphans() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_rpm(source.path(), "keep", "1.0");

        let repo = local_repo(source.path(), LinkType::Hardlink, true);
        let layout = Layout::derive(out.path(), &repo, Local::now()).unwrap();
        util::ensure_dir(&layout.package_dir).unwrap();

        // An orphan from an earlier run
        write_rpm(&layout.package_dir, "orphan", "0.9");

        let candidates = crate::source::local::scan(&repo).unwrap();
        let effective = run_stager(&repo, &layout, candidates).await.unwrap();

        assert_eq!(effective.len(), 1);
        assert!(!layout.package_dir.join("orphan-0.9-1.x86_64.rpm").exists());
    }

    #[tokio::test]
    async fn without_delete_orphans_are_adopted() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_rpm(source.path(), "keep", "1.0");

        let repo = local_repo(source.path(), LinkType::Hardlink, false);
        let layout = Layout::derive(out.path(), &repo, Local::now()).unwrap();
        util::ensure_dir(&layout.package_dir).unwrap();

        write_rpm(&layout.package_dir, "historic", "0.9");
        // Junk never gets adopted
        std::fs::write(layout.package_dir.join("junk.rpm"), b"junk").unwrap();

        let candidates = crate::source::local::scan(&repo).unwrap();
        let effective = run_stager(&repo, &layout, candidates).await.unwrap();

        let names: Vec<_> = effective.iter().map(Package::filename).collect();
        assert_eq!(
            names,
            vec!["historic-0.9-1.x86_64.rpm", "keep-1.0-1.x86_64.rpm"]
        );
    }

    #[tokio::test]
    async fn versioned_hardlinks_share_inodes() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_rpm(source.path(), "foo", "1.0");

        let mut repo = local_repo(source.path(), LinkType::Hardlink, false);
        repo.version_template = Some("2024/01/02".into());

        let layout = Layout::derive(out.path(), &repo, Local::now()).unwrap();
        util::ensure_dir(&layout.package_dir).unwrap();
        util::ensure_dir(layout.version_package_dir.as_ref().unwrap()).unwrap();

        let candidates = crate::source::local::scan(&repo).unwrap();
        run_stager(&repo, &layout, candidates).await.unwrap();

        let name = "foo-1.0-1.x86_64.rpm";
        assert_eq!(
            layout.package_dir.join(name).metadata().unwrap().ino(),
            layout
                .version_package_dir
                .as_ref()
                .unwrap()
                .join(name)
                .metadata()
                .unwrap()
                .ino()
        );
    }

    #[tokio::test]
    async fn individual_symlinks_point_relatively() {
        let source = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_rpm(source.path(), "foo", "1.0");

        let mut repo = local_repo(source.path(), LinkType::IndividualSymlink, false);
        repo.version_template = Some("2024/01/02".into());

        let layout = Layout::derive(out.path(), &repo, Local::now()).unwrap();
        util::ensure_dir(&layout.package_dir).unwrap();
        util::ensure_dir(layout.version_package_dir.as_ref().unwrap()).unwrap();

        let candidates = crate::source::local::scan(&repo).unwrap();
        run_stager(&repo, &layout, candidates).await.unwrap();

        let name = "foo-1.0-1.x86_64.rpm";
        let versioned = layout.version_package_dir.as_ref().unwrap().join(name);

        assert_eq!(
            std::fs::read_link(&versioned).unwrap(),
            Path::new("../../../../packages").join(name)
        );
        // The link resolves through to the staged package
        assert!(versioned.metadata().is_ok());
    }
}
