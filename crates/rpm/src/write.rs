// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Minimal RPM encoding. Produces a structurally valid lead, signature
//! header and metadata header with an empty payload. This is what the
//! higher level test suites use to fabricate packages; it makes no
//! attempt at producing installable archives.

use std::io;

use crate::header::{self, tag, Entry, Tag, Value};
use crate::lead::{Lead, PackageKind};

const SENSE_EQUAL: i32 = 1 << 3;

#[derive(Debug, Clone)]
pub struct Builder {
    name: String,
    epoch: Option<u32>,
    version: String,
    release: String,
    arch: String,
    summary: String,
    description: String,
    build_time: u32,
    installed_size: u32,
    source_rpm: Option<String>,
    files: Vec<(String, u32, i32)>,
    provides: Vec<(String, i32, Option<String>)>,
    requires: Vec<(String, i32, Option<String>)>,
    obsoletes: Vec<(String, i32, Option<String>)>,
    changelogs: Vec<(String, u32, String)>,
}

impl Builder {
    pub fn new(name: &str, version: &str, release: &str, arch: &str) -> Self {
        Self {
            name: name.to_owned(),
            epoch: None,
            version: version.to_owned(),
            release: release.to_owned(),
            arch: arch.to_owned(),
            summary: String::default(),
            description: String::default(),
            build_time: 0,
            installed_size: 0,
            source_rpm: None,
            files: vec![],
            provides: vec![],
            requires: vec![],
            obsoletes: vec![],
            changelogs: vec![],
        }
    }

    pub fn epoch(mut self, epoch: u32) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_owned();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_owned();
        self
    }

    pub fn build_time(mut self, time: u32) -> Self {
        self.build_time = time;
        self
    }

    pub fn installed_size(mut self, size: u32) -> Self {
        self.installed_size = size;
        self
    }

    pub fn source_rpm(mut self, source_rpm: &str) -> Self {
        self.source_rpm = Some(source_rpm.to_owned());
        self
    }

    pub fn file(mut self, path: &str, mode: u32, flags: i32) -> Self {
        self.files.push((path.to_owned(), mode, flags));
        self
    }

    pub fn provide(mut self, name: &str, version: Option<&str>) -> Self {
        let flags = version.map(|_| SENSE_EQUAL).unwrap_or_default();
        self.provides
            .push((name.to_owned(), flags, version.map(str::to_owned)));
        self
    }

    pub fn require(self, name: &str, version: Option<&str>) -> Self {
        let flags = version.map(|_| SENSE_EQUAL).unwrap_or_default();
        self.require_flags(name, flags, version)
    }

    pub fn require_flags(mut self, name: &str, flags: i32, version: Option<&str>) -> Self {
        self.requires
            .push((name.to_owned(), flags, version.map(str::to_owned)));
        self
    }

    pub fn obsolete(mut self, name: &str, version: Option<&str>) -> Self {
        let flags = version.map(|_| SENSE_EQUAL).unwrap_or_default();
        self.obsoletes
            .push((name.to_owned(), flags, version.map(str::to_owned)));
        self
    }

    pub fn changelog(mut self, author: &str, time: u32, text: &str) -> Self {
        self.changelogs.push((author.to_owned(), time, text.to_owned()));
        self
    }

    pub fn build(self) -> Result<Vec<u8>, io::Error> {
        let mut metadata = vec![];
        let metadata_size = header::encode(&mut metadata, &self.entries())?;

        // Signature section records the size of everything that follows
        let mut signature = vec![];
        let signature_size = header::encode(
            &mut signature,
            &[Entry {
                tag: tag::signature::SIZE,
                value: Value::Int32(vec![metadata_size as i32]),
            }],
        )?;

        let lead = Lead {
            major: 3,
            minor: 0,
            kind: if self.arch == "src" {
                PackageKind::Source
            } else {
                PackageKind::Binary
            },
            arch_num: 1,
            name: format!("{}-{}-{}", self.name, self.version, self.release),
            os_num: 1,
            signature_kind: 5,
        };

        let mut out = vec![];
        lead.encode(&mut out)?;
        out.extend_from_slice(&signature);
        // Metadata header is 8 byte aligned
        out.resize(out.len() + ((8 - signature_size as usize % 8) % 8), 0);
        out.extend_from_slice(&metadata);

        Ok(out)
    }

    fn entries(&self) -> Vec<Entry> {
        let mut entries = vec![
            string(Tag::Name, &self.name),
            string(Tag::Version, &self.version),
            string(Tag::Release, &self.release),
            Entry {
                tag: Tag::Summary as i32,
                value: Value::I18nString(vec![self.summary.clone()]),
            },
            Entry {
                tag: Tag::Description as i32,
                value: Value::I18nString(vec![self.description.clone()]),
            },
            Entry {
                tag: Tag::BuildTime as i32,
                value: Value::Int32(vec![self.build_time as i32]),
            },
            Entry {
                tag: Tag::Size as i32,
                value: Value::Int32(vec![self.installed_size as i32]),
            },
        ];

        if self.arch != "src" {
            entries.push(string(Tag::Arch, &self.arch));
        }

        if let Some(epoch) = self.epoch {
            entries.push(Entry {
                tag: Tag::Epoch as i32,
                value: Value::Int32(vec![epoch as i32]),
            });
        }

        if let Some(source_rpm) = &self.source_rpm {
            entries.push(string(Tag::SourceRpm, source_rpm));
        }

        if !self.files.is_empty() {
            let mut dirs: Vec<String> = vec![];
            let mut indexes = vec![];
            let mut bases = vec![];

            for (path, _, _) in &self.files {
                let split = path.rfind('/').map(|i| i + 1).unwrap_or_default();
                let (dir, base) = path.split_at(split);

                let index = dirs.iter().position(|d| d == dir).unwrap_or_else(|| {
                    dirs.push(dir.to_owned());
                    dirs.len() - 1
                });
                indexes.push(index as i32);
                bases.push(base.to_owned());
            }

            entries.extend([
                Entry {
                    tag: Tag::DirNames as i32,
                    value: Value::StringArray(dirs),
                },
                Entry {
                    tag: Tag::BaseNames as i32,
                    value: Value::StringArray(bases),
                },
                Entry {
                    tag: Tag::DirIndexes as i32,
                    value: Value::Int32(indexes),
                },
                Entry {
                    tag: Tag::FileModes as i32,
                    value: Value::Int16(self.files.iter().map(|(_, m, _)| *m as i16).collect()),
                },
                Entry {
                    tag: Tag::FileFlags as i32,
                    value: Value::Int32(self.files.iter().map(|(_, _, f)| *f).collect()),
                },
                Entry {
                    tag: Tag::FileSizes as i32,
                    value: Value::Int32(vec![0; self.files.len()]),
                },
            ]);
        }

        dep_entries(
            &mut entries,
            &self.provides,
            Tag::ProvideName,
            Tag::ProvideFlags,
            Tag::ProvideVersion,
        );
        dep_entries(
            &mut entries,
            &self.requires,
            Tag::RequireName,
            Tag::RequireFlags,
            Tag::RequireVersion,
        );
        dep_entries(
            &mut entries,
            &self.obsoletes,
            Tag::ObsoleteName,
            Tag::ObsoleteFlags,
            Tag::ObsoleteVersion,
        );

        if !self.changelogs.is_empty() {
            entries.extend([
                Entry {
                    tag: Tag::ChangelogTime as i32,
                    value: Value::Int32(self.changelogs.iter().map(|(_, t, _)| *t as i32).collect()),
                },
                Entry {
                    tag: Tag::ChangelogName as i32,
                    value: Value::StringArray(
                        self.changelogs.iter().map(|(a, _, _)| a.clone()).collect(),
                    ),
                },
                Entry {
                    tag: Tag::ChangelogText as i32,
                    value: Value::StringArray(
                        self.changelogs.iter().map(|(_, _, t)| t.clone()).collect(),
                    ),
                },
            ]);
        }

        entries
    }
}

fn string(tag: Tag, value: &str) -> Entry {
    Entry {
        tag: tag as i32,
        value: Value::String(value.to_owned()),
    }
}

fn dep_entries(
    entries: &mut Vec<Entry>,
    deps: &[(String, i32, Option<String>)],
    names: Tag,
    flags: Tag,
    versions: Tag,
) {
    if deps.is_empty() {
        return;
    }

    entries.extend([
        Entry {
            tag: names as i32,
            value: Value::StringArray(deps.iter().map(|(n, _, _)| n.clone()).collect()),
        },
        Entry {
            tag: flags as i32,
            value: Value::Int32(deps.iter().map(|(_, f, _)| *f).collect()),
        },
        Entry {
            tag: versions as i32,
            value: Value::StringArray(
                deps.iter()
                    .map(|(_, _, v)| v.clone().unwrap_or_default())
                    .collect(),
            ),
        },
    ]);
}
