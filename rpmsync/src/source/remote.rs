// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Consumption of upstream repodata. Fetches `repomd.xml` plus the
//! primary document and turns them into the remote candidate list.

use std::collections::BTreeMap;
use std::io::Read;

use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::package::{Digest, Evr, Origin, Package};
use crate::repository::{Repository, Source};
use crate::request;

use super::Filters;

/// The enumerated remote repository
pub struct Sack {
    pub packages: Vec<Package>,
    /// Absolute location of upstream group data, when advertised
    pub group: Option<Url>,
}

pub async fn fetch_sack(repo: &Repository) -> Result<Sack, Error> {
    let filters = Filters::compile(repo)?;

    let (base, repomd) = resolve_upstream(repo).await?;

    let primary = repomd
        .data
        .iter()
        .find(|d| d.kind == "primary")
        .ok_or(Error::MissingPrimary)?;
    let group = repomd
        .data
        .iter()
        .find(|d| d.kind == "group")
        .map(|d| join_relative(&base, &d.location.href))
        .transpose()?;

    let bytes = request::get_bytes(join_relative(&base, &primary.location.href)?).await?;
    let primary = parse_primary(&bytes, primary.location.href.ends_with(".gz"))?;

    let mut packages = vec![];

    for entry in primary.package {
        let href = entry.location.href;
        let filename = href.rsplit('/').next().unwrap_or(&href);

        if !filters.accepts(filename) {
            continue;
        }

        if entry.arch == "src" && !repo.src_pkgs {
            continue;
        }

        packages.push(Package {
            name: entry.name,
            evr: Evr::new(
                entry.version.epoch.parse().ok().filter(|e| *e != 0),
                entry.version.ver,
                entry.version.rel,
            ),
            arch: entry.arch,
            size: entry.size.map(|s| s.package),
            origin: Origin::Remote(join_relative(&base, &href)?),
            digest: entry.checksum.map(|c| Digest {
                kind: c.kind,
                hex: c.value,
            }),
        });
    }

    if repo.newest_only {
        packages = newest_only(packages);
    }

    packages.sort_by(|a, b| a.filename().cmp(&b.filename()));

    Ok(Sack { packages, group })
}

/// Reduce to the highest EVR per `(name, arch)`
fn newest_only(packages: Vec<Package>) -> Vec<Package> {
    let mut newest: BTreeMap<(String, String), Package> = BTreeMap::new();

    for package in packages {
        let key = (package.name.clone(), package.arch.clone());

        match newest.get(&key) {
            Some(current) if current.evr >= package.evr => {}
            _ => {
                newest.insert(key, package);
            }
        }
    }

    newest.into_values().collect()
}

/// Resolve the effective base url and its repomd. A mirror list is
/// consulted line by line, the first mirror with a readable repomd
/// wins.
async fn resolve_upstream(repo: &Repository) -> Result<(Url, Repomd), Error> {
    match &repo.source {
        Source::BaseUrl(url) => {
            let repomd = fetch_repomd(url).await?;
            Ok((url.clone(), repomd))
        }
        Source::MirrorList(url) => {
            let body = request::get_bytes(url.clone()).await?;
            let text = String::from_utf8_lossy(&body);

            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                let Ok(mirror) = line.parse::<Url>() else {
                    debug!("ignoring unparseable mirror entry {line:?}");
                    continue;
                };

                match fetch_repomd(&mirror).await {
                    Ok(repomd) => return Ok((mirror, repomd)),
                    Err(error) => {
                        warn!("mirror {mirror} unusable: {error}");
                    }
                }
            }

            Err(Error::NoUsableMirror(url.clone()))
        }
        Source::LocalDir(_) => unreachable!("local sources never hit the network"),
    }
}

async fn fetch_repomd(base: &Url) -> Result<Repomd, Error> {
    let url = join_relative(base, "repodata/repomd.xml")?;
    let bytes = request::get_bytes(url).await?;

    Ok(quick_xml::de::from_reader(bytes.as_slice())?)
}

fn parse_primary(bytes: &[u8], gzipped: bool) -> Result<Primary, Error> {
    if gzipped {
        let mut xml = vec![];
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut xml)
            .map_err(Error::Decompress)?;

        Ok(quick_xml::de::from_reader(xml.as_slice())?)
    } else {
        Ok(quick_xml::de::from_reader(bytes)?)
    }
}

/// Join a repo relative href onto a base url, treating the base as a
/// directory whether or not it carries a trailing slash
fn join_relative(base: &Url, rel: &str) -> Result<Url, Error> {
    let mut base = base.clone();

    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }

    base.join(rel).map_err(Error::Join)
}

#[derive(Debug, Deserialize)]
struct Repomd {
    #[serde(rename = "data", default)]
    data: Vec<RepomdData>,
}

#[derive(Debug, Deserialize)]
struct RepomdData {
    #[serde(rename = "@type")]
    kind: String,
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(rename = "@href")]
    href: String,
}

#[derive(Debug, Deserialize)]
struct Primary {
    #[serde(rename = "package", default)]
    package: Vec<PrimaryPackage>,
}

#[derive(Debug, Deserialize)]
struct PrimaryPackage {
    name: String,
    arch: String,
    version: Version,
    #[serde(default)]
    checksum: Option<Checksum>,
    #[serde(default)]
    size: Option<Size>,
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Version {
    #[serde(rename = "@epoch")]
    epoch: String,
    #[serde(rename = "@ver")]
    ver: String,
    #[serde(rename = "@rel")]
    rel: String,
}

#[derive(Debug, Deserialize)]
struct Checksum {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "$value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct Size {
    #[serde(rename = "@package")]
    package: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad filter pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("fetch upstream metadata")]
    Request(#[from] request::Error),
    #[error("parse upstream metadata")]
    Xml(#[from] quick_xml::DeError),
    #[error("decompress upstream metadata")]
    Decompress(#[source] std::io::Error),
    #[error("upstream repomd has no primary entry")]
    MissingPrimary,
    #[error("no usable mirror in {0}")]
    NoUsableMirror(Url),
    #[error("resolve url")]
    Join(#[source] url::ParseError),
}

#[cfg(test)]
mod test {
    use super::*;

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="2">
  <package type="rpm">
    <name>a</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="1" rel="1"/>
    <checksum type="sha256" pkgid="YES">aaaa</checksum>
    <size package="100" installed="200" archive="210"/>
    <location href="Packages/a-1-1.x86_64.rpm"/>
  </package>
  <package type="rpm">
    <name>a</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="2" rel="1"/>
    <checksum type="sha256" pkgid="YES">bbbb</checksum>
    <size package="120" installed="220" archive="230"/>
    <location href="Packages/a-2-1.x86_64.rpm"/>
  </package>
</metadata>"#;

    #[test]
    fn parses_primary() {
        let primary = parse_primary(PRIMARY.as_bytes(), false).unwrap();

        assert_eq!(primary.package.len(), 2);
        assert_eq!(primary.package[0].name, "a");
        assert_eq!(primary.package[0].version.ver, "1");
        assert_eq!(primary.package[0].size.as_ref().unwrap().package, 100);
        assert_eq!(
            primary.package[1].checksum.as_ref().unwrap().value,
            "bbbb"
        );
    }

    #[test]
    fn parses_repomd() {
        let repomd: Repomd = quick_xml::de::from_str(
            r#"<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <revision>1700000000</revision>
  <data type="primary">
    <checksum type="sha256">cccc</checksum>
    <location href="repodata/primary.xml.gz"/>
  </data>
  <data type="group">
    <location href="repodata/comps.xml"/>
  </data>
</repomd>"#,
        )
        .unwrap();

        assert_eq!(repomd.data.len(), 2);
        assert_eq!(repomd.data[0].kind, "primary");
        assert_eq!(repomd.data[1].location.href, "repodata/comps.xml");
    }

    #[test]
    fn newest_only_keeps_highest_evr() {
        let make = |ver: &str| Package {
            name: "a".into(),
            evr: Evr::new(None, ver, "1"),
            arch: "x86_64".into(),
            size: None,
            origin: Origin::Remote("https://example.com/a.rpm".parse().unwrap()),
            digest: None,
        };

        let reduced = newest_only(vec![make("1"), make("2"), make("1.5")]);

        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].evr.version, "2");
    }

    #[test]
    fn join_respects_missing_trailing_slash() {
        let base: Url = "https://mirror.example.com/el9/os".parse().unwrap();
        let joined = join_relative(&base, "repodata/repomd.xml").unwrap();

        assert_eq!(
            joined.as_str(),
            "https://mirror.example.com/el9/os/repodata/repomd.xml"
        );
    }
}
