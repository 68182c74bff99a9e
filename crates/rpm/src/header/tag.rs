// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

/// Metadata header tags consumed by repository tooling. The header may
/// carry many more, unknown tags are retained raw and simply never
/// looked up.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Name = 1000,
    Version = 1001,
    Release = 1002,
    Epoch = 1003,
    Summary = 1004,
    Description = 1005,
    BuildTime = 1006,
    BuildHost = 1007,
    /// Installed size in bytes
    Size = 1009,
    Vendor = 1011,
    License = 1014,
    Packager = 1015,
    Group = 1016,
    Url = 1020,
    Os = 1021,
    Arch = 1022,
    FileSizes = 1028,
    FileModes = 1030,
    FileFlags = 1037,
    SourceRpm = 1044,
    ArchiveSize = 1046,
    ProvideName = 1047,
    RequireFlags = 1048,
    RequireName = 1049,
    RequireVersion = 1050,
    ConflictFlags = 1053,
    ConflictName = 1054,
    ConflictVersion = 1055,
    ChangelogTime = 1080,
    ChangelogName = 1081,
    ChangelogText = 1082,
    ObsoleteName = 1090,
    ProvideFlags = 1112,
    ProvideVersion = 1113,
    ObsoleteFlags = 1114,
    ObsoleteVersion = 1115,
    DirIndexes = 1116,
    BaseNames = 1117,
    DirNames = 1118,
    /// 64-bit replacement for [`Tag::ArchiveSize`]
    LongArchiveSize = 271,
    /// 64-bit replacement for [`Tag::Size`]
    LongSize = 5009,
}

/// Signature header tag space, distinct from the metadata tags
pub mod signature {
    /// Combined size of the metadata header and payload
    pub const SIZE: i32 = 1000;
    /// MD5 of header + payload, present in signed and unsigned packages
    pub const MD5: i32 = 1004;
    /// GPG signature of the metadata header, optional
    pub const GPG: i32 = 1005;
}
