// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ext::{ReadExt, WriteExt};

/// Well defined magic field opening every RPM file
pub const LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

/// The lead is a fixed 96 byte preamble. Everything beyond the magic,
/// the package kind and the signature kind is vestigial, the header
/// sections carry the authoritative metadata.
pub const LEAD_SIZE: usize = 96;

/// Package kind recorded in the lead
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Binary = 0,
    Source = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lead {
    pub major: u8,
    pub minor: u8,
    pub kind: PackageKind,
    pub arch_num: i16,
    /// Truncated `name-version-release`, nul padded to 66 bytes
    pub name: String,
    pub os_num: i16,
    /// 5 = header-style signature follows the lead
    pub signature_kind: i16,
}

impl Lead {
    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let magic = reader.read_array::<4>()?;

        if magic != LEAD_MAGIC {
            return Err(DecodeError::InvalidMagic);
        }

        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        let kind = match reader.read_i16()? {
            0 => PackageKind::Binary,
            1 => PackageKind::Source,
            k => return Err(DecodeError::UnknownPackageKind(k)),
        };
        let arch_num = reader.read_i16()?;
        let name_bytes = reader.read_array::<66>()?;
        let os_num = reader.read_i16()?;
        let signature_kind = reader.read_i16()?;
        let _reserved = reader.read_array::<16>()?;

        let name = name_bytes
            .split(|b| *b == 0)
            .next()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();

        Ok(Self {
            major,
            minor,
            kind,
            arch_num,
            name,
            os_num,
            signature_kind,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), io::Error> {
        writer.write_array(LEAD_MAGIC)?;
        writer.write_u8(self.major)?;
        writer.write_u8(self.minor)?;
        writer.write_i16(self.kind as i16)?;
        writer.write_i16(self.arch_num)?;

        let mut name = [0u8; 66];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(65);
        name[..len].copy_from_slice(&bytes[..len]);
        writer.write_array(name)?;

        writer.write_i16(self.os_num)?;
        writer.write_i16(self.signature_kind)?;
        writer.write_array([0u8; 16])?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid lead magic")]
    InvalidMagic,
    #[error("unknown package kind: {0}")]
    UnknownPackageKind(i16),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let lead = Lead {
            major: 3,
            minor: 0,
            kind: PackageKind::Binary,
            arch_num: 1,
            name: "bash-5.2.15-5".into(),
            os_num: 1,
            signature_kind: 5,
        };

        let mut bytes = vec![];
        lead.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), LEAD_SIZE);

        let decoded = Lead::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, lead);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; LEAD_SIZE];
        assert!(matches!(
            Lead::decode(bytes.as_slice()),
            Err(DecodeError::InvalidMagic)
        ));
    }
}
