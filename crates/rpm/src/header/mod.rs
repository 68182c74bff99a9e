// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ext::{ReadExt, WriteExt};

pub use self::tag::Tag;

pub mod tag;

/// Magic opening both the signature header and the metadata header
pub const HEADER_MAGIC: [u8; 4] = [0x8e, 0xad, 0xe8, 0x01];

/// Fixed bytes of a header preamble: magic, reserved, entry count, store size
const PREAMBLE_SIZE: usize = 16;

/// Each index entry is `(tag, kind, offset, count)`, all i32 big endian
const INDEX_ENTRY_SIZE: usize = 16;

/// A decoded header section: the signature header and the metadata
/// header share this exact layout. Values are decoded out of the store
/// eagerly so the store itself is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    entries: Vec<Entry>,
    /// Encoded size in bytes, preamble included
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub tag: i32,
    pub value: Value,
}

/// Typed store values. Count semantics follow the on-disk kinds: scalar
/// kinds hold `count` elements, strings hold `count` nul terminated
/// entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int8(Vec<u8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    String(String),
    Bin(Vec<u8>),
    StringArray(Vec<String>),
    I18nString(Vec<String>),
}

impl Value {
    fn kind(&self) -> i32 {
        match self {
            Value::Null => 0,
            Value::Int8(_) => 2,
            Value::Int16(_) => 3,
            Value::Int32(_) => 4,
            Value::Int64(_) => 5,
            Value::String(_) => 6,
            Value::Bin(_) => 7,
            Value::StringArray(_) => 8,
            Value::I18nString(_) => 9,
        }
    }

    fn count(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Int8(v) => v.len(),
            Value::Int16(v) => v.len(),
            Value::Int32(v) => v.len(),
            Value::Int64(v) => v.len(),
            Value::String(_) => 1,
            Value::Bin(v) => v.len(),
            Value::StringArray(v) => v.len(),
            Value::I18nString(v) => v.len(),
        }
    }

    /// Store alignment requirement of this value kind
    fn alignment(&self) -> usize {
        match self {
            Value::Int16(_) => 2,
            Value::Int32(_) => 4,
            Value::Int64(_) => 8,
            _ => 1,
        }
    }
}

impl Header {
    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let magic = reader.read_array::<4>()?;

        if magic != HEADER_MAGIC {
            return Err(DecodeError::InvalidMagic);
        }

        let _reserved = reader.read_array::<4>()?;
        let num_entries = reader.read_u32()? as usize;
        let store_size = reader.read_u32()? as usize;

        let mut index = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            let tag = reader.read_i32()?;
            let kind = reader.read_i32()?;
            let offset = reader.read_i32()?;
            let count = reader.read_i32()?;

            if offset < 0 || count < 0 {
                return Err(DecodeError::MalformedIndex { tag });
            }

            index.push((tag, kind, offset as usize, count as usize));
        }

        let store = reader.read_vec(store_size)?;

        let entries = index
            .into_iter()
            .map(|(tag, kind, offset, count)| {
                let value = decode_value(&store, tag, kind, offset, count)?;
                Ok(Entry { tag, value })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(Self {
            entries,
            size: (PREAMBLE_SIZE + num_entries * INDEX_ENTRY_SIZE + store_size) as u64,
        })
    }

    /// Encoded size in bytes, preamble and store included
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn get(&self, tag: Tag) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.tag == tag as i32)
            .map(|e| &e.value)
    }

    pub fn string(&self, tag: Tag) -> Option<&str> {
        match self.get(tag)? {
            Value::String(s) => Some(s),
            // Localized strings surface their default locale entry
            Value::I18nString(s) => s.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn string_array(&self, tag: Tag) -> &[String] {
        match self.get(tag) {
            Some(Value::StringArray(s)) => s,
            _ => &[],
        }
    }

    pub fn int32(&self, tag: Tag) -> Option<i32> {
        match self.get(tag)? {
            Value::Int32(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn int32_array(&self, tag: Tag) -> &[i32] {
        match self.get(tag) {
            Some(Value::Int32(v)) => v,
            _ => &[],
        }
    }

    pub fn int16_array(&self, tag: Tag) -> &[i16] {
        match self.get(tag) {
            Some(Value::Int16(v)) => v,
            _ => &[],
        }
    }

    /// Read a scalar that historic packages encode as i32 and newer
    /// ones as i64
    pub fn uint(&self, tag: Tag) -> Option<u64> {
        match self.get(tag)? {
            Value::Int32(v) => v.first().map(|i| *i as u32 as u64),
            Value::Int64(v) => v.first().map(|i| *i as u64),
            _ => None,
        }
    }
}

fn decode_value(
    store: &[u8],
    tag: i32,
    kind: i32,
    offset: usize,
    count: usize,
) -> Result<Value, DecodeError> {
    let slice = |len: usize| {
        store
            .get(offset..offset + len)
            .ok_or(DecodeError::StoreOverrun { tag })
    };

    let value = match kind {
        0 => Value::Null,
        // CHAR and INT8 are byte-wide either way
        1 | 2 => Value::Int8(slice(count)?.to_vec()),
        3 => Value::Int16(
            slice(count * 2)?
                .chunks_exact(2)
                .map(|b| i16::from_be_bytes([b[0], b[1]]))
                .collect(),
        ),
        4 => Value::Int32(
            slice(count * 4)?
                .chunks_exact(4)
                .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        5 => Value::Int64(
            slice(count * 8)?
                .chunks_exact(8)
                .map(|b| i64::from_be_bytes(b.try_into().expect("8 byte chunk")))
                .collect(),
        ),
        6 => Value::String(read_strings(store, tag, offset, 1)?.remove(0)),
        7 => Value::Bin(slice(count)?.to_vec()),
        8 => Value::StringArray(read_strings(store, tag, offset, count)?),
        9 => Value::I18nString(read_strings(store, tag, offset, count)?),
        k => return Err(DecodeError::UnsupportedKind { tag, kind: k }),
    };

    Ok(value)
}

fn read_strings(
    store: &[u8],
    tag: i32,
    mut offset: usize,
    count: usize,
) -> Result<Vec<String>, DecodeError> {
    let mut strings = Vec::with_capacity(count);

    for _ in 0..count {
        let rest = store.get(offset..).ok_or(DecodeError::StoreOverrun { tag })?;
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::StoreOverrun { tag })?;

        strings.push(String::from_utf8_lossy(&rest[..end]).into_owned());
        offset += end + 1;
    }

    Ok(strings)
}

/// Encode a header section from entries. Entries are written in the
/// given order, store offsets honor the per-kind alignment rpm demands.
pub fn encode<W: Write>(writer: &mut W, entries: &[Entry]) -> Result<u64, io::Error> {
    let mut store: Vec<u8> = vec![];
    let mut index: Vec<(i32, i32, u32, u32)> = vec![];

    for entry in entries {
        let align = entry.value.alignment();
        while store.len() % align != 0 {
            store.push(0);
        }

        let offset = store.len() as u32;

        match &entry.value {
            Value::Null => {}
            Value::Int8(v) | Value::Bin(v) => store.extend_from_slice(v),
            Value::Int16(v) => v.iter().for_each(|i| store.extend(i.to_be_bytes())),
            Value::Int32(v) => v.iter().for_each(|i| store.extend(i.to_be_bytes())),
            Value::Int64(v) => v.iter().for_each(|i| store.extend(i.to_be_bytes())),
            Value::String(s) => {
                store.extend_from_slice(s.as_bytes());
                store.push(0);
            }
            Value::StringArray(strings) | Value::I18nString(strings) => {
                for s in strings {
                    store.extend_from_slice(s.as_bytes());
                    store.push(0);
                }
            }
        }

        index.push((
            entry.tag,
            entry.value.kind(),
            offset,
            entry.value.count() as u32,
        ));
    }

    writer.write_array(HEADER_MAGIC)?;
    writer.write_array([0u8; 4])?;
    writer.write_u32(index.len() as u32)?;
    writer.write_u32(store.len() as u32)?;

    for (tag, kind, offset, count) in &index {
        writer.write_i32(*tag)?;
        writer.write_i32(*kind)?;
        writer.write_u32(*offset)?;
        writer.write_u32(*count)?;
    }

    writer.write_all(&store)?;

    Ok((PREAMBLE_SIZE + index.len() * INDEX_ENTRY_SIZE + store.len()) as u64)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid header magic")]
    InvalidMagic,
    #[error("malformed index entry for tag {tag}")]
    MalformedIndex { tag: i32 },
    #[error("tag {tag} value overruns the store")]
    StoreOverrun { tag: i32 },
    #[error("tag {tag} has unsupported value kind {kind}")]
    UnsupportedKind { tag: i32, kind: i32 },
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let entries = vec![
            Entry {
                tag: Tag::Name as i32,
                value: Value::String("bash".into()),
            },
            Entry {
                tag: Tag::Epoch as i32,
                value: Value::Int32(vec![1]),
            },
            Entry {
                tag: Tag::BaseNames as i32,
                value: Value::StringArray(vec!["bash".into(), "sh".into()]),
            },
            Entry {
                tag: Tag::FileModes as i32,
                value: Value::Int16(vec![0o100755u16 as i16, 0o120777u16 as i16]),
            },
        ];

        let mut bytes = vec![];
        let written = encode(&mut bytes, &entries).unwrap();
        assert_eq!(written, bytes.len() as u64);

        let header = Header::decode(bytes.as_slice()).unwrap();
        assert_eq!(header.size(), written);
        assert_eq!(header.string(Tag::Name), Some("bash"));
        assert_eq!(header.int32(Tag::Epoch), Some(1));
        assert_eq!(header.string_array(Tag::BaseNames).len(), 2);
        assert_eq!(header.int16_array(Tag::FileModes).len(), 2);
    }

    #[test]
    fn alignment_of_numeric_values() {
        // A 5 byte string forces padding before the i32 store region
        let entries = vec![
            Entry {
                tag: Tag::Name as i32,
                value: Value::String("four".into()),
            },
            Entry {
                tag: Tag::BuildTime as i32,
                value: Value::Int32(vec![1700000000]),
            },
        ];

        let mut bytes = vec![];
        encode(&mut bytes, &entries).unwrap();

        let header = Header::decode(bytes.as_slice()).unwrap();
        assert_eq!(header.int32(Tag::BuildTime), Some(1700000000));
    }

    #[test]
    fn rejects_unknown_value_kind() {
        let mut bytes = vec![];
        bytes.extend(HEADER_MAGIC);
        bytes.extend([0u8; 4]);
        bytes.extend(1u32.to_be_bytes());
        bytes.extend(0u32.to_be_bytes());
        // tag 1000, kind 42, offset 0, count 0
        bytes.extend(1000i32.to_be_bytes());
        bytes.extend(42i32.to_be_bytes());
        bytes.extend(0i32.to_be_bytes());
        bytes.extend(0i32.to_be_bytes());

        assert!(matches!(
            Header::decode(bytes.as_slice()),
            Err(DecodeError::UnsupportedKind { tag: 1000, kind: 42 })
        ));
    }
}
