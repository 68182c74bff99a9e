// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use self::layout::Layout;

pub mod layout;

/// Symlink names the engine manages itself, never usable as labels or
/// rendered versions
pub const RESERVED_LINKS: [&str; 2] = ["latest", "stable"];

/// A unique repository identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Display)]
#[serde(from = "String")]
pub struct Id(String);

impl Id {
    pub fn new(identifier: impl ToString) -> Self {
        Self(identifier.to_string())
    }

    /// The on-disk directory name: surrounding whitespace and slashes
    /// stripped, inner slashes flattened to underscores
    pub fn friendly(&self) -> String {
        self.0
            .trim()
            .trim_matches('/')
            .replace('/', "_")
    }
}

/// Where a repository's packages come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// A remote YUM repository root
    BaseUrl(Url),
    /// A text resource listing candidate base urls
    MirrorList(Url),
    /// One or more local directories of `.rpm` files
    LocalDir(Vec<PathBuf>),
}

/// Checksum algorithm stamped through the generated metadata
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumKind {
    /// Accepts the historical `sha` sumtype spelling
    #[serde(alias = "sha")]
    Sha1,
    #[default]
    Sha256,
}

/// How packages are materialized in the repository tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Symlink,
    Hardlink,
    IndividualSymlink,
}

/// Immutable configuration of one mirrored repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: Id,
    pub source: Source,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub checksum: ChecksumKind,
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub combined_metadata: bool,
    /// strftime-style template, empty or absent means unversioned
    #[serde(default)]
    pub version_template: Option<String>,
    #[serde(default)]
    pub stable: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub newest_only: bool,
    #[serde(default)]
    pub src_pkgs: bool,
    #[serde(default)]
    pub gpgkeys: Vec<Url>,
}

impl Repository {
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.friendly().is_empty() {
            return Err(Error::EmptyId);
        }

        match &self.source {
            Source::BaseUrl(url) => validate_url(url)?,
            Source::MirrorList(url) => {
                validate_url(url)?;
                if url.scheme() == "file" {
                    return Err(Error::FileMirrorList(url.clone()));
                }
            }
            Source::LocalDir(paths) => {
                if paths.is_empty() {
                    return Err(Error::EmptyLocalDir(self.id.clone()));
                }
            }
        }

        for key in &self.gpgkeys {
            validate_url(key)?;
        }

        for label in self.labels.keys() {
            if RESERVED_LINKS.contains(&label.as_str()) {
                return Err(Error::ReservedLabel(label.clone()));
            }
        }

        Ok(())
    }

    pub fn is_versioned(&self) -> bool {
        self.version_template
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    pub fn is_local(&self) -> bool {
        matches!(self.source, Source::LocalDir(_))
    }

    /// Whether pruning actually runs. A versioned symlinked repository
    /// shares one `packages` tree across all versions, deleting from it
    /// would rewrite history.
    pub fn effective_delete(&self) -> bool {
        self.delete && !(self.is_versioned() && self.link_type == LinkType::Symlink)
    }
}

fn validate_url(url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "http" | "https" | "file" => Ok(()),
        _ => Err(Error::UnsupportedUrl(url.clone())),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("repository id is empty")]
    EmptyId,
    #[error("unsupported url format {0}")]
    UnsupportedUrl(Url),
    #[error("mirror list cannot be a file:// url: {0}")]
    FileMirrorList(Url),
    #[error("local_dir requires at least one path for {0}")]
    EmptyLocalDir(Id),
    #[error("label {0:?} is reserved")]
    ReservedLabel(String),
    #[error("rendered version {0:?} collides with a managed link name")]
    VersionCollision(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn base(id: &str) -> Repository {
        Repository {
            id: Id::new(id),
            source: Source::BaseUrl("https://mirror.example.com/el9".parse().unwrap()),
            include: vec![],
            exclude: vec![],
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
    fn friendly_ids() {
        assert_eq!(Id::new("centos/9/x86_64").friendly(), "centos_9_x86_64");
        assert_eq!(Id::new("  /epel/  ").friendly(), "epel");
        assert_eq!(Id::new("plain").friendly(), "plain");
    }

    #[test]
    fn mirror_list_rejects_file_urls() {
        let mut repo = base("el9");
        repo.source = Source::MirrorList("file:///srv/mirrors.txt".parse().unwrap());

        assert!(matches!(repo.validate(), Err(Error::FileMirrorList(_))));
    }

    #[test]
    fn reserved_labels_rejected() {
        let mut repo = base("el9");
        repo.labels = [("stable".to_owned(), "2024/01/01".to_owned())].into();

        assert!(matches!(repo.validate(), Err(Error::ReservedLabel(_))));
    }

    #[test]
    fn versioned_symlink_never_deletes() {
        let mut repo = base("el9");
        repo.delete = true;
        repo.version_template = Some("%Y/%m/%d".into());

        assert!(!repo.effective_delete());

        repo.link_type = LinkType::Hardlink;
        assert!(repo.effective_delete());

        repo.link_type = LinkType::Symlink;
        repo.version_template = None;
        assert!(repo.effective_delete());
    }
}
