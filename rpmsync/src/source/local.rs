// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::Path;

use log::debug;
use thiserror::Error;

use crate::package::{Evr, Origin, Package};
use crate::repository::{Repository, Source};
use crate::util;

use super::Filters;

/// Scan the configured local directories for valid rpm files.
///
/// Walks recursively following symlinks, applies the filename filters
/// and silently drops anything whose header does not parse. The result
/// is sorted by filename for deterministic metadata.
pub fn scan(repo: &Repository) -> Result<Vec<Package>, Error> {
    let Source::LocalDir(dirs) = &repo.source else {
        return Ok(vec![]);
    };

    let filters = Filters::compile(repo)?;

    let mut paths = vec![];
    for dir in dirs {
        paths.extend(util::enumerate_files(dir, |path| {
            path.extension().and_then(|e| e.to_str()) == Some("rpm")
                && filename(path).is_some_and(|name| filters.accepts(name))
        })?);
    }

    let mut packages: Vec<Package> = paths
        .into_iter()
        .filter_map(|path| {
            let rpm = match rpm::read_path(&path) {
                Ok(rpm) => rpm,
                Err(error) => {
                    debug!("skipping {path:?}, not a valid rpm: {error}");
                    return None;
                }
            };
            let meta = match rpm::Metadata::from_rpm(&rpm) {
                Ok(meta) => meta,
                Err(error) => {
                    debug!("skipping {path:?}, incomplete header: {error}");
                    return None;
                }
            };

            let size = path.metadata().ok().map(|m| m.len());

            Some(Package {
                name: meta.name,
                evr: Evr::new(meta.epoch, meta.version, meta.release),
                arch: meta.arch,
                size,
                origin: Origin::Local(path),
                digest: None,
            })
        })
        .collect();

    packages.sort_by(|a, b| a.filename().cmp(&b.filename()));

    Ok(packages)
}

fn filename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad filter pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("scan directory")]
    Walk(#[from] util::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use crate::repository::{ChecksumKind, Id, LinkType};

    use super::*;

    fn write_rpm(dir: &Path, name: &str) -> PathBuf {
        let bytes = rpm::Builder::new(name, "1.0", "1", "x86_64").build().unwrap();
        let path = dir.join(format!("{name}-1.0-1.x86_64.rpm"));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn local_repo(dir: &Path, include: &[&str], exclude: &[&str]) -> Repository {
        Repository {
            id: Id::new("local"),
            source: Source::LocalDir(vec![dir.to_owned()]),
            include: include.iter().map(|s| (*s).to_owned()).collect(),
            exclude: exclude.iter().map(|s| (*s).to_owned()).collect(),
            checksum: ChecksumKind::default(),
            link_type: LinkType::default(),
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

    #[test]
    fn scans_recursively_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("extra");
        std::fs::create_dir(&nested).unwrap();

        write_rpm(dir.path(), "zsh");
        write_rpm(&nested, "acl");

        let packages = scan(&local_repo(dir.path(), &[], &[])).unwrap();

        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["acl", "zsh"]);
    }

    #[test]
    fn invalid_rpms_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_rpm(dir.path(), "good");
        std::fs::write(dir.path().join("junk-1.0-1.x86_64.rpm"), b"not an rpm").unwrap();

        let packages = scan(&local_repo(dir.path(), &[], &[])).unwrap();

        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "good");
    }

    #[test]
    fn include_exclude_filtering() {
        let dir = tempfile::tempdir().unwrap();
        write_rpm(dir.path(), "good");
        write_rpm(dir.path(), "bad");

        let packages = scan(&local_repo(dir.path(), &["good-*"], &["bad-*"])).unwrap();

        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].filename(), "good-1.0-1.x86_64.rpm");
    }

    #[test]
    fn follows_symlinked_directories() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        write_rpm(&real, "linked");

        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let packages = scan(&local_repo(&link, &[], &[])).unwrap();
        assert_eq!(packages.len(), 1);
    }
}
