//! Types that describe what is contained in a ZIP archive.

use std::collections::HashMap;
use std::fmt;

/// Compression method of an entry's payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Store the file as is
    Stored,
    /// Compress the file using Deflate
    Deflated,
    /// The WinZip-AES wrapper method. The method actually applied to the
    /// payload is carried inside the 0x9901 extra field.
    Aes,
    /// Unsupported compression method
    Unsupported(u16),
}

impl CompressionMethod {
    pub fn from_u16(val: u16) -> CompressionMethod {
        match val {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflated,
            0x63 => CompressionMethod::Aes,
            v => CompressionMethod::Unsupported(v),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflated => 8,
            CompressionMethod::Aes => 0x63,
            CompressionMethod::Unsupported(v) => v,
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// WinZip-AES encryption strength.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AesMode {
    Aes128,
    Aes192,
    Aes256,
}

impl AesMode {
    pub const fn strength(self) -> u8 {
        match self {
            AesMode::Aes128 => 1,
            AesMode::Aes192 => 2,
            AesMode::Aes256 => 3,
        }
    }

    pub const fn key_length(self) -> usize {
        match self {
            AesMode::Aes128 => 16,
            AesMode::Aes192 => 24,
            AesMode::Aes256 => 32,
        }
    }

    pub const fn salt_length(self) -> usize {
        self.key_length() / 2
    }
}

/// A DOS-packed modification timestamp with 2 second precision.
///
/// Raw field values outside the calendar range are retained verbatim and
/// clamped on access rather than rejected.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DateTime {
    datepart: u16,
    timepart: u16,
}

impl Default for DateTime {
    /// The DOS epoch, 1980-01-01 00:00:00.
    fn default() -> DateTime {
        DateTime {
            datepart: 0b0000_0000_0010_0001,
            timepart: 0,
        }
    }
}

impl DateTime {
    /// Wraps an msdos (datepart, timepart) pair without validation.
    pub const fn from_msdos(datepart: u16, timepart: u16) -> DateTime {
        DateTime { datepart, timepart }
    }

    /// Packs a calendar date and time.
    ///
    /// The bounds are year 1980..=2107, month 1..=12, day 1..=31,
    /// hour 0..=23, minute 0..=59, second 0..=59. Out-of-range components
    /// are clamped into bounds.
    pub fn from_date_and_time(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
    ) -> DateTime {
        let year = year.clamp(1980, 2107);
        let month = month.clamp(1, 12) as u16;
        let day = day.clamp(1, 31) as u16;
        let hour = hour.min(23) as u16;
        let minute = minute.min(59) as u16;
        let second = second.min(59) as u16;
        DateTime {
            datepart: day | (month << 5) | ((year - 1980) << 9),
            timepart: (second >> 1) | (minute << 5) | (hour << 11),
        }
    }

    pub const fn datepart(&self) -> u16 {
        self.datepart
    }

    pub const fn timepart(&self) -> u16 {
        self.timepart
    }

    pub fn year(&self) -> u16 {
        (self.datepart >> 9) + 1980
    }

    pub fn month(&self) -> u8 {
        (((self.datepart >> 5) & 0b1111) as u8).clamp(1, 12)
    }

    pub fn day(&self) -> u8 {
        ((self.datepart & 0b1_1111) as u8).clamp(1, 31)
    }

    pub fn hour(&self) -> u8 {
        ((self.timepart >> 11) as u8).min(23)
    }

    pub fn minute(&self) -> u8 {
        (((self.timepart >> 5) & 0b11_1111) as u8).min(59)
    }

    pub fn second(&self) -> u8 {
        (((self.timepart & 0b1_1111) << 1) as u8).min(58)
    }
}

impl fmt::Debug for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DateTime({:#06x}, {:#06x})",
            self.datepart, self.timepart
        )
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour(),
            self.minute(),
            self.second()
        )
    }
}

#[cfg(feature = "time")]
impl TryFrom<time::OffsetDateTime> for DateTime {
    type Error = time::error::ComponentRange;

    fn try_from(dt: time::OffsetDateTime) -> Result<Self, Self::Error> {
        Ok(DateTime::from_date_and_time(
            dt.year() as u16,
            dt.month() as u8,
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
        ))
    }
}

/// Structure describing one entry of a ZIP archive.
///
/// Reader-side entries are produced by the central-directory parser and
/// are read-only from then on. Writer-side entries are created by `add`
/// and backfilled while the entry is emitted.
#[derive(Clone, Debug)]
pub struct ZipEntry {
    /// Name of the entry, decoded per the language-encoding flag
    pub file_name: String,
    /// Name of the entry in the raw byte representation
    pub file_name_raw: Vec<u8>,
    /// Entry comment, decoded per the language-encoding flag
    pub file_comment: String,
    /// Entry comment in the raw byte representation
    pub file_comment_raw: Vec<u8>,
    /// Version of the tool that made the entry
    pub version_made_by: u16,
    /// General purpose bit flag
    pub flags: u16,
    /// Method applied to the payload bytes. For AES entries this is the
    /// inner method from the 0x9901 extra, not the 0x63 wrapper.
    pub compression_method: CompressionMethod,
    /// Method field as stored in the headers (0x63 for AES entries)
    pub stored_method: CompressionMethod,
    /// Last modified time with 2 second precision
    pub last_modified: DateTime,
    /// CRC-32 of the uncompressed payload; zero for AES entries
    pub crc32: u32,
    /// Size of the payload as stored
    pub compressed_size: u64,
    /// Size of the payload when extracted
    pub uncompressed_size: u64,
    /// Offset of the local file header
    pub header_start: u64,
    /// True when the entry denotes a directory
    pub directory: bool,
    /// True when the payload is password protected
    pub encrypted: bool,
    /// Raw extra field blob
    pub extra_field: Vec<u8>,
    /// Extra fields parsed into (tag, data) form
    pub extra_fields: HashMap<u16, Vec<u8>>,
    /// AES strength when a WinZip-AES extra is present
    pub aes_mode: Option<AesMode>,
    /// True when the entry's sizes or offset need 64-bit encoding
    pub zip64: bool,
    /// External file attributes
    pub external_attributes: u32,
}

impl ZipEntry {
    /// Returns whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.directory
    }

    /// Returns whether the entry is a regular file.
    pub fn is_file(&self) -> bool {
        !self.directory
    }

    /// True when the language-encoding flag marks name and comment as
    /// UTF-8.
    pub fn is_utf8(&self) -> bool {
        self.flags & (1 << 11) != 0
    }
}
