// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

use thiserror::Error;

use crate::ext::ReadExt;
use crate::header::Header;
use crate::lead::{self, Lead, LEAD_SIZE};

/// A parsed RPM: lead, signature header and metadata header. The
/// compressed payload that follows the metadata header is left
/// untouched in the source reader.
#[derive(Debug, Clone)]
pub struct Rpm {
    pub lead: Lead,
    pub signature: Header,
    pub header: Header,
    /// Byte offset of the metadata header within the file
    pub header_start: u64,
    /// Byte offset one past the metadata header, i.e. payload start
    pub header_end: u64,
}

pub fn read<R: Read>(mut reader: R) -> Result<Rpm, ReadError> {
    let lead = Lead::decode(&mut reader)?;

    // The signature section is decoded for structure only. A GPG entry
    // may be present and unverifiable, that is not this crate's concern.
    let signature =
        Header::decode(&mut reader).map_err(|e| header_err(e, ReadError::SignatureDecode))?;

    // The metadata header is aligned to an 8 byte boundary
    let padding = (8 - signature.size() % 8) % 8;
    if padding > 0 {
        reader.read_vec(padding as usize)?;
    }

    let header_start = LEAD_SIZE as u64 + signature.size() + padding;
    let header =
        Header::decode(&mut reader).map_err(|e| header_err(e, ReadError::HeaderDecode))?;
    let header_end = header_start + header.size();

    Ok(Rpm {
        lead,
        signature,
        header,
        header_start,
        header_end,
    })
}

pub fn read_bytes(bytes: &[u8]) -> Result<Rpm, ReadError> {
    read(Cursor::new(bytes))
}

pub fn read_path(path: impl AsRef<Path>) -> Result<Rpm, ReadError> {
    read(BufReader::new(File::open(path).map_err(ReadError::Io)?))
}

fn header_err(
    error: crate::header::DecodeError,
    wrap: fn(crate::header::DecodeError) -> ReadError,
) -> ReadError {
    match error {
        crate::header::DecodeError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            ReadError::Truncated
        }
        other => wrap(other),
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("not an rpm: {0}")]
    Lead(lead::DecodeError),
    #[error("signature header: {0}")]
    SignatureDecode(crate::header::DecodeError),
    #[error("metadata header: {0}")]
    HeaderDecode(crate::header::DecodeError),
    #[error("truncated rpm")]
    Truncated,
    #[error("io")]
    Io(io::Error),
}

impl From<lead::DecodeError> for ReadError {
    fn from(error: lead::DecodeError) -> Self {
        match error {
            lead::DecodeError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                ReadError::Truncated
            }
            other => ReadError::Lead(other),
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => ReadError::Truncated,
            _ => ReadError::Io(error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::write::Builder;

    #[test]
    fn header_range_is_recorded() {
        let bytes = Builder::new("attr", "2.5.1", "3", "x86_64")
            .build()
            .unwrap();

        let rpm = read_bytes(&bytes).unwrap();

        assert!(rpm.header_start > LEAD_SIZE as u64);
        assert_eq!(rpm.header_start % 8, 0);
        assert_eq!(rpm.header_end, bytes.len() as u64);
    }

    #[test]
    fn truncated_input() {
        let bytes = Builder::new("attr", "2.5.1", "3", "x86_64")
            .build()
            .unwrap();

        assert!(matches!(
            read_bytes(&bytes[..bytes.len() / 2]),
            Err(ReadError::Truncated)
        ));
    }

    #[test]
    fn garbage_input() {
        assert!(matches!(
            read_bytes(&[0u8; 256]),
            Err(ReadError::Lead(lead::DecodeError::InvalidMagic))
        ));
    }
}
