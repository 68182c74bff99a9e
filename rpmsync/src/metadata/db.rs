// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Sqlite renditions of the three metadata documents, written in the
//! reference YUM schema so dnf and yum clients can use them directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use thiserror::Error;

use rpm::metadata::FileKind;

use super::{split_dep_evr, PackageRecord};

/// Schema generation understood by the dnf/yum sqlite backends
pub const DB_VERSION: i32 = 10;

mod schema {
    diesel::table! {
        db_info (dbversion) {
            dbversion -> Integer,
            checksum -> Text,
        }
    }

    diesel::table! {
        packages (pkg_key) {
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
            #[sql_name = "pkgId"]
            pkg_id -> Text,
            name -> Text,
            arch -> Text,
            version -> Text,
            epoch -> Text,
            release -> Text,
            summary -> Text,
            description -> Text,
            url -> Text,
            time_file -> BigInt,
            time_build -> BigInt,
            rpm_license -> Text,
            rpm_vendor -> Text,
            rpm_group -> Text,
            rpm_buildhost -> Text,
            rpm_sourcerpm -> Text,
            rpm_header_start -> BigInt,
            rpm_header_end -> BigInt,
            rpm_packager -> Text,
            size_package -> BigInt,
            size_installed -> BigInt,
            size_archive -> BigInt,
            location_href -> Text,
            location_base -> Text,
            checksum_type -> Text,
        }
    }

    diesel::table! {
        files (rowid) {
            rowid -> BigInt,
            name -> Text,
            #[sql_name = "type"]
            kind -> Text,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
        }
    }

    diesel::table! {
        requires (rowid) {
            rowid -> BigInt,
            name -> Text,
            flags -> Nullable<Text>,
            epoch -> Nullable<Text>,
            version -> Nullable<Text>,
            release -> Nullable<Text>,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
            pre -> Bool,
        }
    }

    diesel::table! {
        provides (rowid) {
            rowid -> BigInt,
            name -> Text,
            flags -> Nullable<Text>,
            epoch -> Nullable<Text>,
            version -> Nullable<Text>,
            release -> Nullable<Text>,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
        }
    }

    diesel::table! {
        conflicts (rowid) {
            rowid -> BigInt,
            name -> Text,
            flags -> Nullable<Text>,
            epoch -> Nullable<Text>,
            version -> Nullable<Text>,
            release -> Nullable<Text>,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
        }
    }

    diesel::table! {
        obsoletes (rowid) {
            rowid -> BigInt,
            name -> Text,
            flags -> Nullable<Text>,
            epoch -> Nullable<Text>,
            version -> Nullable<Text>,
            release -> Nullable<Text>,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
        }
    }

    // The filelists/other databases carry a slimmer `packages` table
    diesel::table! {
        #[sql_name = "packages"]
        index_packages (pkg_key) {
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
            #[sql_name = "pkgId"]
            pkg_id -> Text,
        }
    }

    diesel::table! {
        filelist (rowid) {
            rowid -> BigInt,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
            dirname -> Text,
            filenames -> Text,
            filetypes -> Text,
        }
    }

    diesel::table! {
        changelog (rowid) {
            rowid -> BigInt,
            #[sql_name = "pkgKey"]
            pkg_key -> BigInt,
            author -> Text,
            date -> BigInt,
            #[sql_name = "changelog"]
            changelog_text -> Text,
        }
    }
}

const PRIMARY_DDL: &str = "
CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
CREATE TABLE packages (
    pkgKey INTEGER PRIMARY KEY,
    pkgId TEXT,
    name TEXT,
    arch TEXT,
    version TEXT,
    epoch TEXT,
    release TEXT,
    summary TEXT,
    description TEXT,
    url TEXT,
    time_file INTEGER,
    time_build INTEGER,
    rpm_license TEXT,
    rpm_vendor TEXT,
    rpm_group TEXT,
    rpm_buildhost TEXT,
    rpm_sourcerpm TEXT,
    rpm_header_start INTEGER,
    rpm_header_end INTEGER,
    rpm_packager TEXT,
    size_package INTEGER,
    size_installed INTEGER,
    size_archive INTEGER,
    location_href TEXT,
    location_base TEXT,
    checksum_type TEXT
);
CREATE TABLE files (name TEXT, type TEXT, pkgKey INTEGER);
CREATE TABLE requires (
    name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT,
    pkgKey INTEGER, pre BOOLEAN DEFAULT FALSE
);
CREATE TABLE provides (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
CREATE TABLE conflicts (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
CREATE TABLE obsoletes (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
CREATE INDEX packagename ON packages (name);
CREATE INDEX packageId ON packages (pkgId);
CREATE INDEX filenames ON files (name);
CREATE INDEX pkgfiles ON files (pkgKey);
CREATE INDEX pkgrequires ON requires (pkgKey);
CREATE INDEX requiresname ON requires (name);
CREATE INDEX pkgprovides ON provides (pkgKey);
CREATE INDEX providesname ON provides (name);
CREATE INDEX pkgconflicts ON conflicts (pkgKey);
CREATE INDEX pkgobsoletes ON obsoletes (pkgKey);
";

const FILELISTS_DDL: &str = "
CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
CREATE TABLE filelist (pkgKey INTEGER, dirname TEXT, filenames TEXT, filetypes TEXT);
CREATE INDEX keyfile ON filelist (pkgKey);
CREATE INDEX pkgId ON packages (pkgId);
CREATE INDEX dirnames ON filelist (dirname);
";

const OTHER_DDL: &str = "
CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
CREATE TABLE changelog (pkgKey INTEGER, author TEXT, date INTEGER, changelog TEXT);
CREATE INDEX keychange ON changelog (pkgKey);
CREATE INDEX pkgId ON packages (pkgId);
";

/// Which sqlite rendition a [`DbWriter`] produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Primary,
    Filelists,
    Other,
}

impl Kind {
    /// Name of the raw database before xz compression
    pub fn filename(&self) -> &'static str {
        match self {
            Kind::Primary => "primary.sqlite",
            Kind::Filelists => "filelists.sqlite",
            Kind::Other => "other.sqlite",
        }
    }

    fn ddl(&self) -> &'static str {
        match self {
            Kind::Primary => PRIMARY_DDL,
            Kind::Filelists => FILELISTS_DDL,
            Kind::Other => OTHER_DDL,
        }
    }
}

pub struct DbWriter {
    conn: SqliteConnection,
    kind: Kind,
    path: PathBuf,
    next_key: i64,
    checksum_type: String,
}

impl DbWriter {
    pub fn create(dir: &Path, kind: Kind, checksum_type: String) -> Result<Self, Error> {
        let path = dir.join(kind.filename());
        let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;

        conn.batch_execute(kind.ddl())?;
        // One transaction for the whole build keeps commits off the
        // per-package path
        conn.batch_execute("BEGIN;")?;

        Ok(Self {
            conn,
            kind,
            path,
            next_key: 1,
            checksum_type,
        })
    }

    pub fn add(&mut self, record: &PackageRecord) -> Result<(), Error> {
        let pkg_key = self.next_key;
        self.next_key += 1;

        match self.kind {
            Kind::Primary => self.add_primary(pkg_key, record),
            Kind::Filelists => self.add_filelists(pkg_key, record),
            Kind::Other => self.add_other(pkg_key, record),
        }
    }

    /// Stamp the sibling XML checksum into `db_info`, commit and hand
    /// back the raw database path for compression
    pub fn finish(mut self, xml_checksum: &str) -> Result<PathBuf, Error> {
        use schema::db_info;

        diesel::insert_into(db_info::table)
            .values((
                db_info::dbversion.eq(DB_VERSION),
                db_info::checksum.eq(xml_checksum),
            ))
            .execute(&mut self.conn)?;

        self.conn.batch_execute("COMMIT;")?;

        Ok(self.path)
    }

    fn add_primary(&mut self, pkg_key: i64, record: &PackageRecord) -> Result<(), Error> {
        use schema::{conflicts, files, obsoletes, packages, provides, requires};

        let meta = &record.meta;

        diesel::insert_into(packages::table)
            .values((
                packages::pkg_key.eq(pkg_key),
                packages::pkg_id.eq(&record.pkgid),
                packages::name.eq(&meta.name),
                packages::arch.eq(&meta.arch),
                packages::version.eq(&meta.version),
                packages::epoch.eq(meta.epoch.unwrap_or(0).to_string()),
                packages::release.eq(&meta.release),
                packages::summary.eq(&meta.summary),
                packages::description.eq(&meta.description),
                packages::url.eq(meta.url.as_deref().unwrap_or_default()),
                packages::time_file.eq(record.time_file as i64),
                packages::time_build.eq(meta.build_time as i64),
                packages::rpm_license.eq(meta.license.as_deref().unwrap_or_default()),
                packages::rpm_vendor.eq(meta.vendor.as_deref().unwrap_or_default()),
                packages::rpm_group.eq(meta.group.as_deref().unwrap_or_default()),
                packages::rpm_buildhost.eq(meta.buildhost.as_deref().unwrap_or_default()),
                packages::rpm_sourcerpm.eq(meta.source_rpm.as_deref().unwrap_or_default()),
                packages::rpm_header_start.eq(meta.header_start as i64),
                packages::rpm_header_end.eq(meta.header_end as i64),
                packages::rpm_packager.eq(meta.packager.as_deref().unwrap_or_default()),
                packages::size_package.eq(record.size_package as i64),
                packages::size_installed.eq(meta.installed_size as i64),
                packages::size_archive.eq(meta.archive_size.unwrap_or_default() as i64),
                packages::location_href.eq(&record.href),
                packages::location_base.eq(""),
                packages::checksum_type.eq(&self.checksum_type),
            ))
            .execute(&mut self.conn)?;

        for file in &meta.files {
            let kind = match file.kind() {
                FileKind::File => "file",
                FileKind::Dir => "dir",
                FileKind::Ghost => "ghost",
            };

            diesel::insert_into(files::table)
                .values((
                    files::name.eq(&file.path),
                    files::kind.eq(kind),
                    files::pkg_key.eq(pkg_key),
                ))
                .execute(&mut self.conn)?;
        }

        macro_rules! insert_deps {
            ($table:ident, $deps:expr) => {
                for dep in $deps.iter().filter(|d| !d.is_rpmlib()) {
                    let (epoch, version, release) = dep
                        .version
                        .as_deref()
                        .map(split_dep_evr)
                        .unwrap_or_default();

                    diesel::insert_into($table::table)
                        .values((
                            $table::name.eq(&dep.name),
                            $table::flags.eq(dep.op()),
                            $table::epoch.eq(epoch),
                            $table::version.eq(version),
                            $table::release.eq(release),
                            $table::pkg_key.eq(pkg_key),
                        ))
                        .execute(&mut self.conn)?;
                }
            };
        }

        insert_deps!(provides, meta.provides);
        insert_deps!(conflicts, meta.conflicts);
        insert_deps!(obsoletes, meta.obsoletes);

        for dep in meta.requires.iter().filter(|d| !d.is_rpmlib()) {
            let (epoch, version, release) = dep
                .version
                .as_deref()
                .map(split_dep_evr)
                .unwrap_or_default();

            diesel::insert_into(requires::table)
                .values((
                    requires::name.eq(&dep.name),
                    requires::flags.eq(dep.op()),
                    requires::epoch.eq(epoch),
                    requires::version.eq(version),
                    requires::release.eq(release),
                    requires::pkg_key.eq(pkg_key),
                    requires::pre.eq(dep.is_pre()),
                ))
                .execute(&mut self.conn)?;
        }

        Ok(())
    }

    fn add_filelists(&mut self, pkg_key: i64, record: &PackageRecord) -> Result<(), Error> {
        use schema::{filelist, index_packages};

        diesel::insert_into(index_packages::table)
            .values((
                index_packages::pkg_key.eq(pkg_key),
                index_packages::pkg_id.eq(&record.pkgid),
            ))
            .execute(&mut self.conn)?;

        // Files collapse into one row per directory
        let mut dirs: BTreeMap<&str, (Vec<&str>, String)> = BTreeMap::new();

        for file in &record.meta.files {
            let (dir, base) = match file.path.rfind('/') {
                Some(split) => (&file.path[..split], &file.path[split + 1..]),
                None => ("", file.path.as_str()),
            };

            let entry = dirs.entry(dir).or_default();
            entry.0.push(base);
            entry.1.push(match file.kind() {
                FileKind::File => 'f',
                FileKind::Dir => 'd',
                FileKind::Ghost => 'g',
            });
        }

        for (dirname, (filenames, filetypes)) in dirs {
            diesel::insert_into(filelist::table)
                .values((
                    filelist::pkg_key.eq(pkg_key),
                    filelist::dirname.eq(dirname),
                    filelist::filenames.eq(filenames.join("/")),
                    filelist::filetypes.eq(filetypes),
                ))
                .execute(&mut self.conn)?;
        }

        Ok(())
    }

    fn add_other(&mut self, pkg_key: i64, record: &PackageRecord) -> Result<(), Error> {
        use schema::{changelog, index_packages};

        diesel::insert_into(index_packages::table)
            .values((
                index_packages::pkg_key.eq(pkg_key),
                index_packages::pkg_id.eq(&record.pkgid),
            ))
            .execute(&mut self.conn)?;

        for entry in &record.meta.changelogs {
            diesel::insert_into(changelog::table)
                .values((
                    changelog::pkg_key.eq(pkg_key),
                    changelog::author.eq(&entry.author),
                    changelog::date.eq(entry.time as i64),
                    changelog::changelog_text.eq(&entry.text),
                ))
                .execute(&mut self.conn)?;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("open database")]
    Connection(#[from] diesel::ConnectionError),
    #[error("query")]
    Query(#[from] diesel::result::Error),
}
