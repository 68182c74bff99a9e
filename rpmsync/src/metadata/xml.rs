// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Streaming writers for the three metadata XML documents and the
//! `repomd.xml` index. Documents are hashed twice while being written,
//! once over the plain stream and once over the gzip stream, so no
//! re-read is needed to fill in repomd checksums.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use quick_xml::events::{BytesDecl, Event};
use quick_xml::Writer;

use crate::repository::ChecksumKind;

use super::{Digests, Hasher, PackageRecord};

const XML_NS_COMMON: &str = "http://linux.duke.edu/metadata/common";
const XML_NS_FILELISTS: &str = "http://linux.duke.edu/metadata/filelists";
const XML_NS_OTHER: &str = "http://linux.duke.edu/metadata/other";
const XML_NS_REPO: &str = "http://linux.duke.edu/metadata/repo";
const XML_NS_RPM: &str = "http://linux.duke.edu/metadata/rpm";

/// A writer that counts and hashes everything passing through
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W, kind: ChecksumKind) -> Self {
        Self {
            inner,
            hasher: Hasher::new(kind),
            bytes: 0,
        }
    }

    pub(crate) fn finish(self) -> (W, String, u64) {
        (self.inner, self.hasher.finish(), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Gzip sink stack: plain XML is hashed, compressed, hashed again and
/// written to disk
type Sink = HashingWriter<GzEncoder<HashingWriter<BufWriter<File>>>>;

fn open_sink(path: &Path, checksum: ChecksumKind) -> Result<Writer<Sink>, io::Error> {
    let file = BufWriter::new(File::create(path)?);
    let compressed = HashingWriter::new(file, checksum);
    let encoder = GzEncoder::new(compressed, Compression::default());
    let open = HashingWriter::new(encoder, checksum);

    Ok(Writer::new(open))
}

fn close_sink(writer: Writer<Sink>) -> Result<Digests, io::Error> {
    let (encoder, open_checksum, open_size) = writer.into_inner().finish();
    let (file, checksum, size) = encoder.finish()?.finish();

    file.into_inner()?.sync_all()?;

    Ok(Digests {
        checksum,
        size,
        open_checksum,
        open_size,
    })
}

/// Which of the three package documents a [`XmlWriter`] produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Primary,
    Filelists,
    Other,
}

impl Kind {
    pub fn filename(&self) -> &'static str {
        match self {
            Kind::Primary => "primary.xml.gz",
            Kind::Filelists => "filelists.xml.gz",
            Kind::Other => "other.xml.gz",
        }
    }

    fn root(&self) -> (&'static str, &'static str) {
        match self {
            Kind::Primary => ("metadata", XML_NS_COMMON),
            Kind::Filelists => ("filelists", XML_NS_FILELISTS),
            Kind::Other => ("otherdata", XML_NS_OTHER),
        }
    }
}

/// One of the gzip compressed package documents, declared with the
/// final package count before the first record is appended
pub struct XmlWriter {
    writer: Writer<Sink>,
    kind: Kind,
    checksum: ChecksumKind,
}

impl XmlWriter {
    pub fn create(
        dir: &Path,
        kind: Kind,
        checksum: ChecksumKind,
        num_pkgs: usize,
    ) -> Result<Self, quick_xml::Error> {
        let mut writer = open_sink(&dir.join(kind.filename()), checksum)?;

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let (root, ns) = kind.root();
        let mut start = quick_xml::events::BytesStart::new(root);
        start.push_attribute(("xmlns", ns));
        if kind == Kind::Primary {
            start.push_attribute(("xmlns:rpm", XML_NS_RPM));
        }
        start.push_attribute(("packages", num_pkgs.to_string().as_str()));
        writer.write_event(Event::Start(start))?;

        Ok(Self {
            writer,
            kind,
            checksum,
        })
    }

    pub fn add(&mut self, record: &PackageRecord) -> Result<(), quick_xml::Error> {
        match self.kind {
            Kind::Primary => primary_package(&mut self.writer, record, self.checksum),
            Kind::Filelists => filelists_package(&mut self.writer, record),
            Kind::Other => other_package(&mut self.writer, record),
        }
    }

    pub fn finish(mut self) -> Result<Digests, quick_xml::Error> {
        let (root, _) = self.kind.root();
        self.writer
            .write_event(Event::End(quick_xml::events::BytesEnd::new(root)))?;

        Ok(close_sink(self.writer)?)
    }
}

/// Files surfaced in primary.xml: the subset dnf resolves file
/// dependencies against without fetching filelists
fn is_primary_file(path: &str) -> bool {
    path.starts_with("/etc/") || path == "/usr/lib/sendmail" || path.contains("bin/")
}

type ElementWriter<'a> = &'a mut Writer<Sink>;

fn text_element(writer: ElementWriter<'_>, name: &str, text: &str) -> Result<(), quick_xml::Error> {
    writer.create_element(name).write_text_content(quick_xml::events::BytesText::new(text))?;
    Ok(())
}

fn version_element(
    writer: ElementWriter<'_>,
    record: &PackageRecord,
) -> Result<(), quick_xml::Error> {
    writer
        .create_element("version")
        .with_attribute(("epoch", record.meta.epoch.unwrap_or(0).to_string().as_str()))
        .with_attribute(("ver", record.meta.version.as_str()))
        .with_attribute(("rel", record.meta.release.as_str()))
        .write_empty()?;
    Ok(())
}

fn dep_entries(
    writer: ElementWriter<'_>,
    name: &str,
    deps: &[rpm::metadata::DepEntry],
    with_pre: bool,
) -> Result<(), quick_xml::Error> {
    let deps: Vec<_> = deps.iter().filter(|d| !d.is_rpmlib()).collect();

    if deps.is_empty() {
        return Ok(());
    }

    writer.create_element(name).write_inner_content(|writer| {
        for dep in deps {
            let mut entry = writer
                .create_element("rpm:entry")
                .with_attribute(("name", dep.name.as_str()));

            if let (Some(op), Some(version)) = (dep.op(), dep.version.as_deref()) {
                entry = entry.with_attribute(("flags", op));

                // Versions in dependency entries split back into e:v-r
                let (epoch, ver, rel) = super::split_dep_evr(version);

                if let Some(epoch) = &epoch {
                    entry = entry.with_attribute(("epoch", epoch.as_str()));
                }
                if let Some(ver) = &ver {
                    entry = entry.with_attribute(("ver", ver.as_str()));
                }
                if let Some(rel) = &rel {
                    entry = entry.with_attribute(("rel", rel.as_str()));
                }
            }

            if with_pre && dep.is_pre() {
                entry = entry.with_attribute(("pre", "1"));
            }

            entry.write_empty()?;
        }
        Ok::<(), quick_xml::Error>(())
    })?;

    Ok(())
}

fn primary_package(
    writer: ElementWriter<'_>,
    record: &PackageRecord,
    checksum: ChecksumKind,
) -> Result<(), quick_xml::Error> {
    let meta = &record.meta;

    writer
        .create_element("package")
        .with_attribute(("type", "rpm"))
        .write_inner_content(|writer| {
            text_element(writer, "name", &meta.name)?;
            text_element(writer, "arch", &meta.arch)?;
            version_element(writer, record)?;

            writer
                .create_element("checksum")
                .with_attribute(("type", checksum.to_string().as_str()))
                .with_attribute(("pkgid", "YES"))
                .write_text_content(quick_xml::events::BytesText::new(&record.pkgid))?;

            text_element(writer, "summary", &meta.summary)?;
            text_element(writer, "description", &meta.description)?;
            text_element(writer, "packager", meta.packager.as_deref().unwrap_or_default())?;
            text_element(writer, "url", meta.url.as_deref().unwrap_or_default())?;

            writer
                .create_element("time")
                .with_attribute(("file", record.time_file.to_string().as_str()))
                .with_attribute(("build", meta.build_time.to_string().as_str()))
                .write_empty()?;

            writer
                .create_element("size")
                .with_attribute(("package", record.size_package.to_string().as_str()))
                .with_attribute(("installed", meta.installed_size.to_string().as_str()))
                .with_attribute((
                    "archive",
                    meta.archive_size.unwrap_or_default().to_string().as_str(),
                ))
                .write_empty()?;

            writer
                .create_element("location")
                .with_attribute(("href", record.href.as_str()))
                .write_empty()?;

            writer.create_element("format").write_inner_content(|writer| {
                text_element(writer, "rpm:license", meta.license.as_deref().unwrap_or_default())?;
                text_element(writer, "rpm:vendor", meta.vendor.as_deref().unwrap_or_default())?;
                text_element(writer, "rpm:group", meta.group.as_deref().unwrap_or_default())?;
                text_element(
                    writer,
                    "rpm:buildhost",
                    meta.buildhost.as_deref().unwrap_or_default(),
                )?;
                text_element(
                    writer,
                    "rpm:sourcerpm",
                    meta.source_rpm.as_deref().unwrap_or_default(),
                )?;

                writer
                    .create_element("rpm:header-range")
                    .with_attribute(("start", meta.header_start.to_string().as_str()))
                    .with_attribute(("end", meta.header_end.to_string().as_str()))
                    .write_empty()?;

                dep_entries(writer, "rpm:provides", &meta.provides, false)?;
                dep_entries(writer, "rpm:requires", &meta.requires, true)?;
                dep_entries(writer, "rpm:conflicts", &meta.conflicts, false)?;
                dep_entries(writer, "rpm:obsoletes", &meta.obsoletes, false)?;

                for file in meta.files.iter().filter(|f| is_primary_file(&f.path)) {
                    text_element(writer, "file", &file.path)?;
                }

                Ok::<(), quick_xml::Error>(())
            })?;

            Ok::<(), quick_xml::Error>(())
        })?;

    Ok(())
}

fn package_shell(
    writer: ElementWriter<'_>,
    record: &PackageRecord,
    content: impl FnOnce(ElementWriter<'_>) -> Result<(), quick_xml::Error>,
) -> Result<(), quick_xml::Error> {
    writer
        .create_element("package")
        .with_attribute(("pkgid", record.pkgid.as_str()))
        .with_attribute(("name", record.meta.name.as_str()))
        .with_attribute(("arch", record.meta.arch.as_str()))
        .write_inner_content(|writer| {
            version_element(writer, record)?;
            content(writer)
        })?;

    Ok(())
}

fn filelists_package(
    writer: ElementWriter<'_>,
    record: &PackageRecord,
) -> Result<(), quick_xml::Error> {
    package_shell(writer, record, |writer| {
        for file in &record.meta.files {
            let element = writer.create_element("file");

            let element = match file.kind() {
                rpm::metadata::FileKind::Dir => element.with_attribute(("type", "dir")),
                rpm::metadata::FileKind::Ghost => element.with_attribute(("type", "ghost")),
                rpm::metadata::FileKind::File => element,
            };

            element.write_text_content(quick_xml::events::BytesText::new(&file.path))?;
        }
        Ok(())
    })
}

fn other_package(
    writer: ElementWriter<'_>,
    record: &PackageRecord,
) -> Result<(), quick_xml::Error> {
    package_shell(writer, record, |writer| {
        for changelog in &record.meta.changelogs {
            writer
                .create_element("changelog")
                .with_attribute(("author", changelog.author.as_str()))
                .with_attribute(("date", changelog.time.to_string().as_str()))
                .write_text_content(quick_xml::events::BytesText::new(&changelog.text))?;
        }
        Ok(())
    })
}

/// One `<data>` record in repomd.xml
#[derive(Debug, Clone)]
pub struct RepomdEntry {
    pub kind: String,
    pub href: String,
    pub digests: Digests,
    pub timestamp: u64,
    /// Only sqlite databases carry one
    pub database_version: Option<u32>,
    /// Pass-through entries only record a single checksum
    pub open: bool,
    pub checksum: ChecksumKind,
}

/// Compose repomd.xml over the staged entries. Written to a temp name
/// and renamed so a reader never observes a partial index.
pub fn write_repomd(
    dir: &Path,
    revision: u64,
    entries: &[RepomdEntry],
) -> Result<(), quick_xml::Error> {
    let path = dir.join("repomd.xml");
    let staged = dir.join(".repomd.xml");

    let file = BufWriter::new(File::create(&staged).map_err(io::Error::from)?);
    let mut writer = Writer::new_with_indent(file, b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    writer
        .create_element("repomd")
        .with_attribute(("xmlns", XML_NS_REPO))
        .with_attribute(("xmlns:rpm", XML_NS_RPM))
        .write_inner_content(|writer| {
            writer
                .create_element("revision")
                .write_text_content(quick_xml::events::BytesText::new(
                    revision.to_string().as_str(),
                ))?;

            for entry in entries {
                writer
                    .create_element("data")
                    .with_attribute(("type", entry.kind.as_str()))
                    .write_inner_content(|writer| {
                        writer
                            .create_element("checksum")
                            .with_attribute(("type", entry.checksum.to_string().as_str()))
                            .write_text_content(quick_xml::events::BytesText::new(
                                &entry.digests.checksum,
                            ))?;

                        if entry.open {
                            writer
                                .create_element("open-checksum")
                                .with_attribute(("type", entry.checksum.to_string().as_str()))
                                .write_text_content(quick_xml::events::BytesText::new(
                                    &entry.digests.open_checksum,
                                ))?;
                        }

                        writer
                            .create_element("location")
                            .with_attribute(("href", entry.href.as_str()))
                            .write_empty()?;

                        text_element_plain(writer, "timestamp", &entry.timestamp.to_string())?;
                        text_element_plain(writer, "size", &entry.digests.size.to_string())?;

                        if entry.open {
                            text_element_plain(
                                writer,
                                "open-size",
                                &entry.digests.open_size.to_string(),
                            )?;
                        }

                        if let Some(version) = entry.database_version {
                            text_element_plain(
                                writer,
                                "database_version",
                                &version.to_string(),
                            )?;
                        }

                        Ok::<(), quick_xml::Error>(())
                    })?;
            }

            Ok::<(), quick_xml::Error>(())
        })?;

    let file = writer.into_inner().into_inner().map_err(io::Error::from)?;
    file.sync_all().map_err(io::Error::from)?;

    std::fs::rename(&staged, &path).map_err(io::Error::from)?;

    Ok(())
}

fn text_element_plain<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<(), quick_xml::Error> {
    writer
        .create_element(name)
        .write_text_content(quick_xml::events::BytesText::new(text))?;
    Ok(())
}
