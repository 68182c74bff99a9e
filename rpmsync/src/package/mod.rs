// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use url::Url;

pub use self::evr::Evr;
pub use self::fetch::Fetcher;

pub mod evr;
pub mod fetch;

/// A package identity as staged by the engine: enough to name the file
/// on disk, fetch it and verify what was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub evr: Evr,
    pub arch: String,
    /// Size in bytes as advertised by the source, if known
    pub size: Option<u64>,
    pub origin: Origin,
    /// Digest as advertised by the source, if known
    pub digest: Option<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Remote(Url),
    Local(PathBuf),
}

/// An upstream-advertised file digest. The kind is kept verbatim,
/// verification only happens for algorithms we produce ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub kind: String,
    pub hex: String,
}

impl Package {
    /// Canonical `name-version-release.arch.rpm` filename
    pub fn filename(&self) -> String {
        format!(
            "{}-{}-{}.{}.rpm",
            self.name, self.evr.version, self.evr.release, self.arch
        )
    }

    pub fn is_local(&self) -> bool {
        matches!(self.origin, Origin::Local(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filename_shape() {
        let package = Package {
            name: "kernel-core".into(),
            evr: Evr::new(Some(0), "6.8.4", "200.fc39"),
            arch: "x86_64".into(),
            size: None,
            origin: Origin::Local("/srv/in/kernel-core.rpm".into()),
            digest: None,
        };

        assert_eq!(package.filename(), "kernel-core-6.8.4-200.fc39.x86_64.rpm");
    }
}
