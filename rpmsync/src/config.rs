// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration loading: a YAML mapping of repository ids to their
//! mirroring options, translated into validated [`Repository`] values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::repository::{self, ChecksumKind, Id, LinkType, Repository, Source};

/// Default version template, one directory level per date component
const DEFAULT_VERSION: &str = "%Y/%m/%d";

#[derive(Debug, Deserialize)]
struct File {
    repos: BTreeMap<String, Entry>,
}

/// Accepts a single value where a list is allowed
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Entry {
    #[serde(default)]
    baseurl: Option<Url>,
    #[serde(default)]
    mirrorlist: Option<Url>,
    #[serde(default)]
    local_dir: Option<OneOrMany<PathBuf>>,
    #[serde(default)]
    includepkgs: Vec<String>,
    #[serde(default)]
    excludepkgs: Vec<String>,
    #[serde(default)]
    checksum: ChecksumKind,
    #[serde(default)]
    link_type: LinkType,
    #[serde(default)]
    delete: bool,
    #[serde(default)]
    combined_metadata: bool,
    /// strftime template; explicit `""` or `null` disables versioning
    #[serde(default = "default_version")]
    version: Option<String>,
    #[serde(default)]
    stable: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    newest_only: bool,
    #[serde(default)]
    srcpkgs: bool,
    #[serde(default)]
    gpgkey: Option<OneOrMany<Url>>,
}

fn default_version() -> Option<String> {
    Some(DEFAULT_VERSION.to_owned())
}

/// Load and validate every repository from a configuration file
pub fn load(path: &Path) -> Result<Vec<Repository>, Error> {
    let bytes = fs::read(path)?;
    parse(&bytes)
}

fn parse(bytes: &[u8]) -> Result<Vec<Repository>, Error> {
    let file: File = serde_yaml::from_slice(bytes)?;

    file.repos
        .into_iter()
        .map(|(id, entry)| {
            let id = Id::new(&id);
            let repo = entry.into_repository(id.clone())?;
            repo.validate()?;
            Ok(repo)
        })
        .collect()
}

impl Entry {
    fn into_repository(self, id: Id) -> Result<Repository, Error> {
        let source = match (self.baseurl, self.mirrorlist, self.local_dir) {
            (Some(url), None, None) => Source::BaseUrl(url),
            (None, Some(url), None) => Source::MirrorList(url),
            (None, None, Some(paths)) => Source::LocalDir(paths.into()),
            _ => return Err(Error::AmbiguousSource(id)),
        };

        Ok(Repository {
            id,
            source,
            include: self.includepkgs,
            exclude: self.excludepkgs,
            checksum: self.checksum,
            link_type: self.link_type,
            delete: self.delete,
            combined_metadata: self.combined_metadata,
            version_template: self.version.filter(|v| !v.is_empty()),
            stable: self.stable,
            labels: self.labels,
            newest_only: self.newest_only,
            src_pkgs: self.srcpkgs,
            gpgkeys: self.gpgkey.map(Vec::from).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("read config")]
    Io(#[from] std::io::Error),
    #[error("parse config")]
    Yaml(#[from] serde_yaml::Error),
    #[error("exactly one of baseurl, mirrorlist or local_dir required for {0}")]
    AmbiguousSource(Id),
    #[error(transparent)]
    Repository(#[from] repository::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_example() {
        let repos = parse(
            br#"
repos:
  centos/9/os:
    baseurl: https://mirror.example.com/centos/9/os/x86_64
    checksum: sha
    link_type: hardlink
    delete: true
    combined_metadata: true
    stable: 2024/01/01
    labels:
      prod: 2024/01/01
    newest_only: true
    gpgkey: https://mirror.example.com/RPM-GPG-KEY-9
  local:
    local_dir:
      - /srv/rpms/a
      - /srv/rpms/b
    version: ""
    includepkgs:
      - "good-*"
    excludepkgs:
      - "bad-*"
"#,
        )
        .unwrap();

        assert_eq!(repos.len(), 2);

        let centos = &repos[0];
        assert_eq!(centos.id.friendly(), "centos_9_os");
        assert_eq!(centos.checksum, ChecksumKind::Sha1);
        assert_eq!(centos.link_type, LinkType::Hardlink);
        assert_eq!(centos.version_template.as_deref(), Some(DEFAULT_VERSION));
        assert!(centos.newest_only);
        assert_eq!(centos.gpgkeys.len(), 1);

        let local = &repos[1];
        assert!(matches!(&local.source, Source::LocalDir(paths) if paths.len() == 2));
        assert!(!local.is_versioned());
        assert_eq!(local.include, vec!["good-*"]);
    }

    #[test]
    fn rejects_two_sources() {
        let result = parse(
            br#"
repos:
  broken:
    baseurl: https://mirror.example.com/a
    local_dir: /srv/rpms
"#,
        );

        assert!(matches!(result, Err(Error::AmbiguousSource(_))));
    }

    #[test]
    fn rejects_unknown_link_type() {
        let result = parse(
            br#"
repos:
  broken:
    baseurl: https://mirror.example.com/a
    link_type: reflink
"#,
        );

        assert!(matches!(result, Err(Error::Yaml(_))));
    }

    #[test]
    fn rejects_bad_url_scheme() {
        let result = parse(
            br#"
repos:
  broken:
    baseurl: ftp://mirror.example.com/a
"#,
        );

        assert!(matches!(
            result,
            Err(Error::Repository(repository::Error::UnsupportedUrl(_)))
        ));
    }
}
