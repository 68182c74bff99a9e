// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::{Error, Repository, RESERVED_LINKS};

/// Paths derived from a [`Repository`] and a base directory. Derived
/// once per sync so a running engine never recomputes paths or mutates
/// its configuration; the version template is rendered exactly once
/// here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub dir: PathBuf,
    pub package_dir: PathBuf,
    /// Rendered version string, e.g. `2024/01/02`
    pub version: Option<String>,
    pub version_dir: Option<PathBuf>,
    pub version_package_dir: Option<PathBuf>,
}

impl Layout {
    pub fn derive(
        base_dir: &Path,
        repo: &Repository,
        now: DateTime<Local>,
    ) -> Result<Self, Error> {
        let dir = base_dir.join(repo.id.friendly());
        let package_dir = dir.join("packages");

        let version = repo
            .version_template
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|template| render_version(repo, template, now))
            .transpose()?;

        let version_dir = version.as_ref().map(|v| dir.join(v));
        let version_package_dir = version_dir.as_ref().map(|d| d.join("packages"));

        Ok(Self {
            dir,
            package_dir,
            version,
            version_dir,
            version_package_dir,
        })
    }

    /// Where run artifacts like the `filelist` manifest land
    pub fn log_dir(&self) -> &Path {
        self.version_dir.as_deref().unwrap_or(&self.dir)
    }

    pub fn repodata_dir(&self) -> PathBuf {
        self.dir.join("repodata")
    }

    pub fn version_repodata_dir(&self) -> Option<PathBuf> {
        self.version_dir.as_ref().map(|d| d.join("repodata"))
    }
}

fn render_version(
    repo: &Repository,
    template: &str,
    now: DateTime<Local>,
) -> Result<String, Error> {
    let version = now.format(template).to_string();

    if RESERVED_LINKS.contains(&version.as_str()) || repo.labels.contains_key(&version) {
        return Err(Error::VersionCollision(version));
    }

    Ok(version)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use crate::repository::{ChecksumKind, Id, LinkType, Source};

    use super::*;

    fn versioned(template: &str) -> Repository {
        Repository {
            id: Id::new("fedora/39"),
            source: Source::LocalDir(vec!["/srv/in".into()]),
            include: vec![],
            exclude: vec![],
            checksum: ChecksumKind::default(),
            link_type: LinkType::default(),
            delete: false,
            combined_metadata: false,
            version_template: Some(template.to_owned()),
            stable: None,
            labels: BTreeMap::new(),
            newest_only: false,
            src_pkgs: false,
            gpgkeys: vec![],
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn derives_versioned_paths() {
        let layout = Layout::derive(Path::new("/out"), &versioned("%Y/%m/%d"), now()).unwrap();

        assert_eq!(layout.dir, Path::new("/out/fedora_39"));
        assert_eq!(layout.package_dir, Path::new("/out/fedora_39/packages"));
        assert_eq!(layout.version.as_deref(), Some("2024/01/02"));
        assert_eq!(
            layout.version_package_dir.as_deref(),
            Some(Path::new("/out/fedora_39/2024/01/02/packages"))
        );
        assert_eq!(layout.log_dir(), Path::new("/out/fedora_39/2024/01/02"));
    }

    #[test]
    fn unversioned_layout() {
        let mut repo = versioned("");
        repo.version_template = None;

        let layout = Layout::derive(Path::new("/out"), &repo, now()).unwrap();

        assert_eq!(layout.version, None);
        assert_eq!(layout.version_dir, None);
        assert_eq!(layout.log_dir(), Path::new("/out/fedora_39"));
    }

    #[test]
    fn version_rendering_to_reserved_name_is_rejected() {
        assert!(matches!(
            Layout::derive(Path::new("/out"), &versioned("latest"), now()),
            Err(Error::VersionCollision(_))
        ));

        let mut repo = versioned("%Y");
        repo.labels = [("2024".to_owned(), "2023/12/31".to_owned())].into();

        assert!(matches!(
            Layout::derive(Path::new("/out"), &repo, now()),
            Err(Error::VersionCollision(_))
        ));
    }
}
