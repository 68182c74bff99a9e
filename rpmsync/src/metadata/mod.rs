// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The repodata generator: parses package headers in parallel and
//! emits `repomd.xml`, the gzip compressed XML documents and the xz
//! compressed sqlite databases into a private staging directory.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use xz2::write::XzEncoder;

use crate::progress::MetadataState;
use crate::repository::ChecksumKind;

pub use self::xml::RepomdEntry;

pub mod db;
pub mod xml;

/// Everything known about one package once its header was parsed
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub meta: rpm::Metadata,
    /// Repo relative location, `packages/<filename>`
    pub href: String,
    pub size_package: u64,
    pub time_file: u64,
    /// Hex digest of the package file, doubles as the pkgid
    pub pkgid: String,
}

/// Checksums and sizes of one emitted artifact, open and compressed
#[derive(Debug, Clone, Default)]
pub struct Digests {
    pub checksum: String,
    pub size: u64,
    pub open_checksum: String,
    pub open_size: u64,
}

/// An upstream artifact shipped through into repodata untouched, e.g.
/// group definitions or module streams
#[derive(Debug, Clone)]
pub struct Passthrough {
    /// repomd `<data type>` value
    pub kind: String,
    pub filename: String,
    pub content: Vec<u8>,
}

/// Incremental sha1/sha256 with the algorithm picked at runtime
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(kind: ChecksumKind) -> Self {
        match kind {
            ChecksumKind::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumKind::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
        }
    }

    pub fn finish(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash a file in streaming fashion, returning the hex digest and size
pub fn hash_file(kind: ChecksumKind, path: &Path) -> Result<(String, u64), io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(kind);
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((hasher.finish(), size))
}

/// Split a dependency version string back into its epoch, version and
/// release parts as the sqlite schema stores them
pub(crate) fn split_dep_evr(version: &str) -> (Option<String>, Option<String>, Option<String>) {
    let (epoch, rest) = match version.split_once(':') {
        Some((epoch, rest)) if !epoch.is_empty() && epoch.chars().all(|c| c.is_ascii_digit()) => {
            (epoch, rest)
        }
        _ => ("0", version),
    };

    let (ver, rel) = match rest.split_once('-') {
        Some((ver, rel)) => (ver, Some(rel.to_owned())),
        None => (rest, None),
    };

    (Some(epoch.to_owned()), Some(ver.to_owned()), rel)
}

/// Metadata staging produced by a successful build. Dropping it
/// removes the temp tree, publishing must copy out of it first.
pub struct Staging {
    temp: TempDir,
}

impl Staging {
    pub fn repodata(&self) -> PathBuf {
        self.temp.path().join("repodata")
    }
}

/// Builds a complete `repodata/` for an ordered package list
pub struct Builder {
    /// `(readable path, repo relative href)` in final metadata order
    pub packages: Vec<(PathBuf, String)>,
    pub checksum: ChecksumKind,
    pub workers: usize,
    pub passthrough: Vec<Passthrough>,
}

impl Builder {
    pub fn build(
        &self,
        on_progress: &(dyn Fn(MetadataState) + Send + Sync),
    ) -> Result<Staging, Error> {
        on_progress(MetadataState::Building);

        let temp = tempfile::Builder::new()
            .prefix("rpmsync-")
            .suffix("-metadata")
            .tempdir()?;
        let repodata = temp.path().join("repodata");
        std::fs::create_dir(&repodata)?;

        let records = self.parse_packages(on_progress)?;

        let digests = self.write_documents(&repodata, &records)?;

        let mut entries = vec![];
        let revision = unix_now();

        for (kind, filename, digests, database_version) in digests {
            entries.push(RepomdEntry {
                kind,
                href: format!("repodata/{filename}"),
                digests,
                timestamp: file_mtime(&repodata.join(filename)).unwrap_or(revision),
                database_version,
                open: true,
                checksum: self.checksum,
            });
        }

        for passthrough in &self.passthrough {
            let path = repodata.join(&passthrough.filename);
            std::fs::write(&path, &passthrough.content)?;

            let mut hasher = Hasher::new(ChecksumKind::Sha256);
            hasher.update(&passthrough.content);

            entries.push(RepomdEntry {
                kind: passthrough.kind.clone(),
                href: format!("repodata/{}", passthrough.filename),
                digests: Digests {
                    checksum: hasher.finish(),
                    size: passthrough.content.len() as u64,
                    open_checksum: String::default(),
                    open_size: 0,
                },
                timestamp: file_mtime(&path).unwrap_or(revision),
                database_version: None,
                open: false,
                checksum: ChecksumKind::Sha256,
            });
        }

        xml::write_repomd(&repodata, revision, &entries)?;


        on_progress(MetadataState::Complete);

        Ok(Staging { temp })
    }

    /// Parse every header on the worker pool. Results keep submission
    /// order, the percentage counter advances as workers finish.
    fn parse_packages(
        &self,
        on_progress: &(dyn Fn(MetadataState) + Send + Sync),
    ) -> Result<Vec<PackageRecord>, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.max(1))
            .build()?;

        let total = self.packages.len();
        let done = AtomicUsize::new(0);
        let checksum = self.checksum;

        pool.install(|| {
            self.packages
                .par_iter()
                .map(|(path, href)| {
                    let record = parse_package(checksum, path, href)?;

                    let done = done.fetch_add(1, Ordering::Relaxed) + 1;
                    on_progress(MetadataState::Progress(
                        ((done * 100) / total.max(1)) as u8,
                    ));

                    Ok(record)
                })
                .collect::<Result<Vec<_>, Error>>()
        })
    }

    /// Write the three XML documents and three databases, returning
    /// `(repomd type, filename, digests, database_version)` per artifact
    fn write_documents(
        &self,
        repodata: &Path,
        records: &[PackageRecord],
    ) -> Result<Vec<(String, String, Digests, Option<u32>)>, Error> {
        let checksum_name = self.checksum.to_string();

        let mut primary_xml =
            xml::XmlWriter::create(repodata, xml::Kind::Primary, self.checksum, records.len())?;
        let mut filelists_xml =
            xml::XmlWriter::create(repodata, xml::Kind::Filelists, self.checksum, records.len())?;
        let mut other_xml =
            xml::XmlWriter::create(repodata, xml::Kind::Other, self.checksum, records.len())?;

        let mut primary_db = db::DbWriter::create(repodata, db::Kind::Primary, checksum_name.clone())?;
        let mut filelists_db =
            db::DbWriter::create(repodata, db::Kind::Filelists, checksum_name.clone())?;
        let mut other_db = db::DbWriter::create(repodata, db::Kind::Other, checksum_name)?;

        for record in records {
            primary_xml.add(record)?;
            filelists_xml.add(record)?;
            other_xml.add(record)?;
            primary_db.add(record)?;
            filelists_db.add(record)?;
            other_db.add(record)?;
        }

        let primary = primary_xml.finish()?;
        let filelists = filelists_xml.finish()?;
        let other = other_xml.finish()?;

        // Databases reference the compressed checksum of their sibling
        // XML before being sealed and xz compressed themselves
        let primary_db = compress_db(primary_db.finish(&primary.checksum)?, self.checksum)?;
        let filelists_db = compress_db(filelists_db.finish(&filelists.checksum)?, self.checksum)?;
        let other_db = compress_db(other_db.finish(&other.checksum)?, self.checksum)?;

        Ok(vec![
            ("primary".into(), "primary.xml.gz".into(), primary, None),
            (
                "filelists".into(),
                "filelists.xml.gz".into(),
                filelists,
                None,
            ),
            ("other".into(), "other.xml.gz".into(), other, None),
            (
                "primary_db".into(),
                "primary.sqlite.xz".into(),
                primary_db,
                Some(db::DB_VERSION as u32),
            ),
            (
                "filelists_db".into(),
                "filelists.sqlite.xz".into(),
                filelists_db,
                Some(db::DB_VERSION as u32),
            ),
            (
                "other_db".into(),
                "other.sqlite.xz".into(),
                other_db,
                Some(db::DB_VERSION as u32),
            ),
        ])
    }
}

fn parse_package(
    checksum: ChecksumKind,
    path: &Path,
    href: &str,
) -> Result<PackageRecord, Error> {
    let rpm = rpm::read_path(path).map_err(|error| Error::ReadPackage {
        path: path.to_owned(),
        error,
    })?;
    let meta = rpm::Metadata::from_rpm(&rpm)?;

    let (pkgid, size_package) = hash_file(checksum, path)?;

    Ok(PackageRecord {
        meta,
        href: href.to_owned(),
        size_package,
        time_file: file_mtime(path)?,
        pkgid,
    })
}

/// Compress a raw sqlite database to `<name>.xz`, removing the raw
/// file and returning open + compressed digests
fn compress_db(raw: PathBuf, checksum: ChecksumKind) -> Result<Digests, Error> {
    let compressed_path = raw.with_extension("sqlite.xz");

    let (open_checksum, open_size) = hash_file(checksum, &raw)?;

    let file = File::create(&compressed_path)?;
    let outer = xml::HashingWriter::new(file, checksum);
    let mut encoder = XzEncoder::new(outer, 6);

    io::copy(&mut File::open(&raw)?, &mut encoder)?;

    let (_, checksum, size) = encoder.finish()?.finish();

    std::fs::remove_file(&raw)?;

    Ok(Digests {
        checksum,
        size,
        open_checksum,
        open_size,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn file_mtime(path: &Path) -> Result<u64, io::Error> {
    let mtime = path
        .metadata()?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Ok(mtime)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("read package {path:?}: {error}")]
    ReadPackage {
        path: PathBuf,
        error: rpm::read::ReadError,
    },
    #[error("package metadata")]
    Metadata(#[from] rpm::metadata::Error),
    #[error("xml")]
    Xml(#[from] quick_xml::Error),
    #[error("database")]
    Db(#[from] db::Error),
    #[error("worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::progress::MetadataState;

    fn write_rpm(dir: &Path, builder: rpm::Builder) -> PathBuf {
        let bytes = builder.build().unwrap();
        let rpm = rpm::read_bytes(&bytes).unwrap();
        let meta = rpm::Metadata::from_rpm(&rpm).unwrap();

        let path = dir.join(meta.filename());
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn build(packages: Vec<(PathBuf, String)>, checksum: ChecksumKind) -> Staging {
        Builder {
            packages,
            checksum,
            workers: 2,
            passthrough: vec![],
        }
        .build(&|_| {})
        .unwrap()
    }

    fn read_gz(path: &Path) -> String {
        let mut out = String::default();
        flate2::read::GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn empty_package_list_still_produces_repodata() {
        let staging = build(vec![], ChecksumKind::Sha256);
        let repodata = staging.repodata();

        assert!(repodata.join("repomd.xml").exists());

        for name in [
            "primary.xml.gz",
            "filelists.xml.gz",
            "other.xml.gz",
            "primary.sqlite.xz",
            "filelists.sqlite.xz",
            "other.sqlite.xz",
        ] {
            assert!(repodata.join(name).exists(), "missing {name}");
        }

        // Raw databases are not shipped
        assert!(!repodata.join("primary.sqlite").exists());

        assert!(read_gz(&repodata.join("primary.xml.gz")).contains(r#"packages="0""#));
        assert!(read_gz(&repodata.join("filelists.xml.gz")).contains(r#"packages="0""#));
    }

    #[test]
    fn single_package_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rpm(
            dir.path(),
            rpm::Builder::new("foo", "1.0", "1", "x86_64")
                .summary("A test package")
                .file("/usr/bin/foo", 0o100755, 0)
                .file("/usr/share/doc/foo/README", 0o100644, 0)
                .changelog("dev <dev@example.com>", 1700000000, "- initial build"),
        );

        let href = "packages/foo-1.0-1.x86_64.rpm".to_owned();
        let staging = build(vec![(path.clone(), href)], ChecksumKind::Sha256);
        let repodata = staging.repodata();

        let primary = read_gz(&repodata.join("primary.xml.gz"));
        assert!(primary.contains(r#"packages="1""#));
        assert!(primary.contains("<name>foo</name>"));
        assert!(primary.contains(r#"href="packages/foo-1.0-1.x86_64.rpm""#));
        // Only the binary shows up in primary, docs go to filelists only
        assert!(primary.contains("<file>/usr/bin/foo</file>"));
        assert!(!primary.contains("README"));

        let filelists = read_gz(&repodata.join("filelists.xml.gz"));
        assert!(filelists.contains("/usr/share/doc/foo/README"));

        let other = read_gz(&repodata.join("other.xml.gz"));
        assert!(other.contains("- initial build"));

        // The pkgid in the XML matches the real file digest
        let (pkgid, _) = hash_file(ChecksumKind::Sha256, &path).unwrap();
        assert!(primary.contains(&pkgid));
    }

    #[test]
    fn repomd_references_real_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rpm(dir.path(), rpm::Builder::new("bar", "2.0", "3", "noarch"));

        let staging = build(
            vec![(path, "packages/bar-2.0-3.noarch.rpm".to_owned())],
            ChecksumKind::Sha1,
        );
        let repodata = staging.repodata();

        let repomd = std::fs::read_to_string(repodata.join("repomd.xml")).unwrap();

        for kind in [
            "primary",
            "filelists",
            "other",
            "primary_db",
            "filelists_db",
            "other_db",
        ] {
            assert!(repomd.contains(&format!(r#"<data type="{kind}">"#)), "{kind}");
        }

        for name in [
            "primary.xml.gz",
            "filelists.xml.gz",
            "other.xml.gz",
            "primary.sqlite.xz",
            "filelists.sqlite.xz",
            "other.sqlite.xz",
        ] {
            let (digest, _) = hash_file(ChecksumKind::Sha1, &repodata.join(name)).unwrap();
            assert!(repomd.contains(&digest), "checksum of {name} not referenced");
        }
    }

    #[test]
    fn passthrough_entries_recorded() {
        let staging = Builder {
            packages: vec![],
            checksum: ChecksumKind::Sha256,
            workers: 1,
            passthrough: vec![Passthrough {
                kind: "group".into(),
                filename: "comps.xml".into(),
                content: b"<comps/>".to_vec(),
            }],
        }
        .build(&|_| {})
        .unwrap();

        let repodata = staging.repodata();
        assert!(repodata.join("comps.xml").exists());

        let repomd = std::fs::read_to_string(repodata.join("repomd.xml")).unwrap();
        assert!(repomd.contains(r#"<data type="group">"#));
        assert!(repomd.contains(r#"href="repodata/comps.xml""#));
    }

    #[test]
    fn progress_reaches_complete() {
        let states = std::sync::Mutex::new(vec![]);

        Builder {
            packages: vec![],
            checksum: ChecksumKind::Sha256,
            workers: 1,
            passthrough: vec![],
        }
        .build(&|state| states.lock().unwrap().push(state))
        .unwrap();

        let states = states.into_inner().unwrap();
        assert_eq!(states.first(), Some(&MetadataState::Building));
        assert_eq!(states.last(), Some(&MetadataState::Complete));
    }
}
