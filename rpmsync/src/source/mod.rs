// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Package enumeration: the remote sack consumed from upstream
//! repodata, or a scan over local directories. Either way the result
//! is an ordered candidate list of [`Package`] identities.

use thiserror::Error;
use tokio::task;
use url::Url;

use crate::package::Package;
use crate::repository::{Repository, Source};

pub mod local;
pub mod remote;

/// Compiled include/exclude filename filters
pub struct Filters {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl Filters {
    pub fn compile(repo: &Repository) -> Result<Self, glob::PatternError> {
        let compile = |globs: &[String]| {
            globs
                .iter()
                .map(|g| glob::Pattern::new(g))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            include: compile(&repo.include)?,
            exclude: compile(&repo.exclude)?,
        })
    }

    /// An exclude match always wins; with no includes configured
    /// everything else passes
    pub fn accepts(&self, filename: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(filename)) {
            return false;
        }

        self.include.is_empty() || self.include.iter().any(|p| p.matches(filename))
    }
}

/// Enumerate the candidate packages for a repository, along with the
/// upstream group data location when one is advertised
pub async fn enumerate(repo: &Repository) -> Result<(Vec<Package>, Option<Url>), Error> {
    match &repo.source {
        Source::LocalDir(_) => {
            let repo = repo.clone();
            let packages = task::spawn_blocking(move || local::scan(&repo))
                .await
                .expect("join enumeration task")?;

            Ok((packages, None))
        }
        Source::BaseUrl(_) | Source::MirrorList(_) => {
            let sack = remote::fetch_sack(repo).await?;

            Ok((sack.packages, sack.group))
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Local(#[from] local::Error),
    #[error(transparent)]
    Remote(#[from] remote::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::BTreeMap;

    use crate::repository::{ChecksumKind, Id, LinkType};

    fn repo(include: &[&str], exclude: &[&str]) -> Repository {
        Repository {
            id: Id::new("filters"),
            source: Source::LocalDir(vec!["/srv/in".into()]),
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
    fn exclude_wins_over_include() {
        let filters = Filters::compile(&repo(&["bad-*"], &["bad-*"])).unwrap();
        assert!(!filters.accepts("bad-1-1.x86_64.rpm"));
    }

    #[test]
    fn empty_include_passes_everything() {
        let filters = Filters::compile(&repo(&[], &["bad-*"])).unwrap();
        assert!(filters.accepts("good-1-1.x86_64.rpm"));
        assert!(!filters.accepts("bad-1-1.x86_64.rpm"));
    }

    #[test]
    fn include_narrows() {
        let filters = Filters::compile(&repo(&["good-*"], &[])).unwrap();
        assert!(filters.accepts("good-1-1.x86_64.rpm"));
        assert!(!filters.accepts("other-1-1.x86_64.rpm"));
    }
}
