// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

use crate::header::{Header, Tag};
use crate::lead::PackageKind;
use crate::read::Rpm;

/// Comparison operator bits of a dependency entry
const SENSE_LESS: i32 = 1 << 1;
const SENSE_GREATER: i32 = 1 << 2;
const SENSE_EQUAL: i32 = 1 << 3;

/// Pre-install sense bits: PREREQ, SCRIPT_PRE, SCRIPT_POST
const SENSE_PRE: i32 = (1 << 6) | (1 << 9) | (1 << 10);

/// Dependencies on the rpmlib implementation itself, filtered from
/// repository metadata
const SENSE_RPMLIB: i32 = 1 << 24;

/// File flag marking a ghost entry (owned but not shipped)
const FILE_GHOST: i32 = 1 << 6;

/// The typed view over a package header used to build repository
/// metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub epoch: Option<u32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub summary: String,
    pub description: String,
    pub url: Option<String>,
    pub license: Option<String>,
    pub vendor: Option<String>,
    pub group: Option<String>,
    pub buildhost: Option<String>,
    pub packager: Option<String>,
    pub source_rpm: Option<String>,
    pub build_time: u64,
    pub installed_size: u64,
    pub archive_size: Option<u64>,
    pub header_start: u64,
    pub header_end: u64,
    pub files: Vec<FileEntry>,
    pub provides: Vec<DepEntry>,
    pub requires: Vec<DepEntry>,
    pub conflicts: Vec<DepEntry>,
    pub obsoletes: Vec<DepEntry>,
    pub changelogs: Vec<Changelog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Ghost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub mode: u16,
    pub flags: i32,
}

impl FileEntry {
    pub fn kind(&self) -> FileKind {
        if self.flags & FILE_GHOST != 0 {
            FileKind::Ghost
        } else if self.mode & 0o170000 == 0o040000 {
            FileKind::Dir
        } else {
            FileKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepEntry {
    pub name: String,
    pub flags: i32,
    pub version: Option<String>,
}

impl DepEntry {
    /// Repomd comparison operator, `None` for an unversioned dependency
    pub fn op(&self) -> Option<&'static str> {
        match self.flags & (SENSE_LESS | SENSE_GREATER | SENSE_EQUAL) {
            0 => None,
            SENSE_LESS => Some("LT"),
            SENSE_GREATER => Some("GT"),
            SENSE_EQUAL => Some("EQ"),
            x if x == SENSE_LESS | SENSE_EQUAL => Some("LE"),
            x if x == SENSE_GREATER | SENSE_EQUAL => Some("GE"),
            _ => None,
        }
    }

    pub fn is_pre(&self) -> bool {
        self.flags & SENSE_PRE != 0
    }

    pub fn is_rpmlib(&self) -> bool {
        self.flags & SENSE_RPMLIB != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changelog {
    pub author: String,
    pub time: u64,
    pub text: String,
}

impl Metadata {
    pub fn from_rpm(rpm: &Rpm) -> Result<Self, Error> {
        let header = &rpm.header;

        let required = |tag: Tag| {
            header
                .string(tag)
                .map(str::to_owned)
                .ok_or(Error::MissingTag(tag))
        };
        let optional = |tag: Tag| header.string(tag).map(str::to_owned);

        let name = required(Tag::Name)?;
        let version = required(Tag::Version)?;
        let release = required(Tag::Release)?;

        let arch = if rpm.lead.kind == PackageKind::Source {
            "src".to_owned()
        } else {
            required(Tag::Arch)?
        };

        let installed_size = header
            .uint(Tag::LongSize)
            .or_else(|| header.uint(Tag::Size))
            .unwrap_or_default();
        let archive_size = header
            .uint(Tag::LongArchiveSize)
            .or_else(|| header.uint(Tag::ArchiveSize));

        Ok(Metadata {
            name,
            epoch: header.int32(Tag::Epoch).map(|e| e as u32),
            version,
            release,
            arch,
            summary: optional(Tag::Summary).unwrap_or_default(),
            description: optional(Tag::Description).unwrap_or_default(),
            url: optional(Tag::Url),
            license: optional(Tag::License),
            vendor: optional(Tag::Vendor),
            group: optional(Tag::Group),
            buildhost: optional(Tag::BuildHost),
            packager: optional(Tag::Packager),
            source_rpm: optional(Tag::SourceRpm),
            build_time: header.uint(Tag::BuildTime).unwrap_or_default(),
            installed_size,
            archive_size,
            header_start: rpm.header_start,
            header_end: rpm.header_end,
            files: files(header),
            provides: deps(header, Tag::ProvideName, Tag::ProvideFlags, Tag::ProvideVersion),
            requires: deps(header, Tag::RequireName, Tag::RequireFlags, Tag::RequireVersion),
            conflicts: deps(
                header,
                Tag::ConflictName,
                Tag::ConflictFlags,
                Tag::ConflictVersion,
            ),
            obsoletes: deps(
                header,
                Tag::ObsoleteName,
                Tag::ObsoleteFlags,
                Tag::ObsoleteVersion,
            ),
            changelogs: changelogs(header),
        })
    }

    /// Canonical `name-version-release.arch.rpm` filename
    pub fn filename(&self) -> String {
        format!(
            "{}-{}-{}.{}.rpm",
            self.name, self.version, self.release, self.arch
        )
    }
}

/// Reassemble file paths from the split dirnames/basenames/dirindexes
/// triple
fn files(header: &Header) -> Vec<FileEntry> {
    let dirs = header.string_array(Tag::DirNames);
    let bases = header.string_array(Tag::BaseNames);
    let indexes = header.int32_array(Tag::DirIndexes);
    let modes = header.int16_array(Tag::FileModes);
    let flags = header.int32_array(Tag::FileFlags);

    bases
        .iter()
        .enumerate()
        .filter_map(|(i, base)| {
            let dir = dirs.get(*indexes.get(i)? as usize)?;

            Some(FileEntry {
                path: format!("{dir}{base}"),
                mode: modes.get(i).copied().unwrap_or_default() as u16,
                flags: flags.get(i).copied().unwrap_or_default(),
            })
        })
        .collect()
}

fn deps(header: &Header, names: Tag, flags: Tag, versions: Tag) -> Vec<DepEntry> {
    let names = header.string_array(names);
    let flags = header.int32_array(flags);
    let versions = header.string_array(versions);

    names
        .iter()
        .enumerate()
        .map(|(i, name)| DepEntry {
            name: name.clone(),
            flags: flags.get(i).copied().unwrap_or_default(),
            version: versions
                .get(i)
                .filter(|v| !v.is_empty())
                .map(String::to_owned),
        })
        .collect()
}

fn changelogs(header: &Header) -> Vec<Changelog> {
    let times = header.int32_array(Tag::ChangelogTime);
    let authors = header.string_array(Tag::ChangelogName);
    let texts = header.string_array(Tag::ChangelogText);

    authors
        .iter()
        .enumerate()
        .map(|(i, author)| Changelog {
            author: author.clone(),
            time: times.get(i).copied().unwrap_or_default() as u32 as u64,
            text: texts.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing mandatory tag {0:?}")]
    MissingTag(Tag),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::read::read_bytes;
    use crate::write::Builder;

    fn parse(builder: Builder) -> Metadata {
        let bytes = builder.build().unwrap();
        let rpm = read_bytes(&bytes).unwrap();
        Metadata::from_rpm(&rpm).unwrap()
    }

    #[test]
    fn dependency_operators() {
        let meta = parse(
            Builder::new("attr", "2.5.1", "3", "x86_64")
                .require_flags("glibc", SENSE_GREATER | SENSE_EQUAL, Some("2.34"))
                .require_flags("rpmlib(CompressedFileNames)", SENSE_RPMLIB, None),
        );

        assert_eq!(meta.requires[0].op(), Some("GE"));
        assert!(!meta.requires[0].is_rpmlib());
        assert!(meta.requires[1].is_rpmlib());
    }

    #[test]
    fn file_kinds() {
        let meta = parse(
            Builder::new("attr", "2.5.1", "3", "x86_64")
                .file("/usr/bin/attr", 0o100755, 0)
                .file("/usr/share/doc/attr", 0o040755, 0)
                .file("/var/log/attr.log", 0o100644, FILE_GHOST),
        );

        let kinds: Vec<_> = meta.files.iter().map(FileEntry::kind).collect();
        assert_eq!(kinds, vec![FileKind::File, FileKind::Dir, FileKind::Ghost]);
        assert_eq!(meta.files[0].path, "/usr/bin/attr");
    }

    #[test]
    fn filename_shape() {
        let meta = parse(Builder::new("acl", "2.3.1", "4", "aarch64"));
        assert_eq!(meta.filename(), "acl-2.3.1-4.aarch64.rpm");
    }
}
