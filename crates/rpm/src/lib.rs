// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reading of the RPM container format: lead, signature header and
//! metadata header. Payload content is never decompressed here, the
//! format is parsed only as far as package metadata requires.

pub(crate) mod ext;
pub mod header;
pub mod lead;
pub mod metadata;
pub mod read;
pub mod write;

pub use self::header::{Header, Tag};
pub use self::lead::Lead;
pub use self::metadata::Metadata;
pub use self::read::{read, read_bytes, read_path, Rpm};
pub use self::write::Builder;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let bytes = Builder::new("bash", "5.2.15", "5", "x86_64")
            .epoch(1)
            .summary("The GNU Bourne Again shell")
            .description("Bash is the shell, or command language interpreter.")
            .build_time(1700000000)
            .installed_size(8_388_608)
            .provide("bash", Some("5.2.15-5"))
            .require("glibc", None)
            .file("/usr/bin/bash", 0o100755, 0)
            .build()
            .expect("encode rpm");

        let rpm = read_bytes(&bytes).expect("valid rpm");
        let meta = Metadata::from_rpm(&rpm).expect("complete metadata");

        assert_eq!(meta.name, "bash");
        assert_eq!(meta.epoch, Some(1));
        assert_eq!(meta.version, "5.2.15");
        assert_eq!(meta.release, "5");
        assert_eq!(meta.arch, "x86_64");
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.provides.len(), 1);
        assert_eq!(meta.requires.len(), 1);
    }
}
