//! Byte-level parsers for the fixed ZIP records.
//!
//! All multi-byte fields are little-endian. Each parser takes a slice
//! positioned at the record signature and fails with `bad-format` when
//! the signature or length does not match.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::result::{ZipError, ZipResult};

pub(crate) const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub(crate) const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
pub(crate) const CENTRAL_DIRECTORY_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub(crate) const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x0605_4b50;
pub(crate) const ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x0606_4b50;
pub(crate) const ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;

/// 32-bit fields at or above this value defer to the ZIP64 extra.
pub(crate) const ZIP64_BYTES_THR: u64 = 0xFFFF_FFFF;
/// Entry counts at or above this value defer to the ZIP64 EOCD.
pub(crate) const ZIP64_ENTRY_THR: usize = 0xFFFF;

pub(crate) const ZIP64_EXTRA_TAG: u16 = 0x0001;
pub(crate) const AES_EXTRA_TAG: u16 = 0x9901;
/// "AE" vendor id inside the 0x9901 extra.
pub(crate) const AES_VENDOR_ID: u16 = 0x4541;
/// AE-2: no CRC, HMAC only.
pub(crate) const AES_VENDOR_VERSION: u16 = 0x0002;

pub(crate) const EOCD_SIZE: usize = 22;
pub(crate) const ZIP64_EOCD_LOCATOR_SIZE: usize = 20;
pub(crate) const ZIP64_EOCD_SIZE: usize = 56;
pub(crate) const LOCAL_HEADER_SIZE: usize = 30;
/// The EOCD scan window never extends past the maximum comment length.
pub(crate) const EOCD_SEARCH_SPAN: u64 = (EOCD_SIZE + 65_536) as u64;

/// End of central directory record.
#[derive(Debug)]
pub(crate) struct CentralDirectoryEnd {
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub comment_length: u16,
}

impl CentralDirectoryEnd {
    /// Parses the 22 fixed bytes; the comment follows in the source.
    pub(crate) fn parse(bytes: &[u8]) -> ZipResult<CentralDirectoryEnd> {
        if bytes.len() < EOCD_SIZE {
            return Err(ZipError::BadFormat("end of central directory too short"));
        }
        let mut reader = Cursor::new(bytes);
        if reader.read_u32::<LittleEndian>()? != CENTRAL_DIRECTORY_END_SIGNATURE {
            return Err(ZipError::BadFormat(
                "invalid end of central directory signature",
            ));
        }
        let _disk_number = reader.read_u16::<LittleEndian>()?;
        let _disk_with_central_directory = reader.read_u16::<LittleEndian>()?;
        let _number_of_files_on_this_disk = reader.read_u16::<LittleEndian>()?;
        let number_of_files = reader.read_u16::<LittleEndian>()?;
        let central_directory_size = reader.read_u32::<LittleEndian>()?;
        let central_directory_offset = reader.read_u32::<LittleEndian>()?;
        let comment_length = reader.read_u16::<LittleEndian>()?;
        Ok(CentralDirectoryEnd {
            number_of_files,
            central_directory_size,
            central_directory_offset,
            comment_length,
        })
    }

    /// True when a field carries a sentinel deferring to the ZIP64 EOCD.
    pub(crate) fn requires_zip64(&self) -> bool {
        self.number_of_files as usize == ZIP64_ENTRY_THR
            || self.central_directory_offset as u64 == ZIP64_BYTES_THR
    }
}

/// ZIP64 end of central directory locator.
#[derive(Debug)]
pub(crate) struct Zip64CentralDirectoryEndLocator {
    pub end_of_central_directory_offset: u64,
}

impl Zip64CentralDirectoryEndLocator {
    pub(crate) fn parse(bytes: &[u8]) -> ZipResult<Zip64CentralDirectoryEndLocator> {
        if bytes.len() < ZIP64_EOCD_LOCATOR_SIZE {
            return Err(ZipError::BadFormat("zip64 locator too short"));
        }
        let mut reader = Cursor::new(bytes);
        if reader.read_u32::<LittleEndian>()? != ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE {
            return Err(ZipError::BadFormat("invalid zip64 locator signature"));
        }
        let _disk_with_central_directory = reader.read_u32::<LittleEndian>()?;
        let end_of_central_directory_offset = reader.read_u64::<LittleEndian>()?;
        let _number_of_disks = reader.read_u32::<LittleEndian>()?;
        Ok(Zip64CentralDirectoryEndLocator {
            end_of_central_directory_offset,
        })
    }
}

/// ZIP64 end of central directory record.
#[derive(Debug)]
pub(crate) struct Zip64CentralDirectoryEnd {
    pub number_of_files: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64CentralDirectoryEnd {
    pub(crate) fn parse(bytes: &[u8]) -> ZipResult<Zip64CentralDirectoryEnd> {
        if bytes.len() < ZIP64_EOCD_SIZE {
            return Err(ZipError::BadFormat("zip64 end of central directory too short"));
        }
        let mut reader = Cursor::new(bytes);
        if reader.read_u32::<LittleEndian>()? != ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE {
            return Err(ZipError::BadFormat(
                "invalid zip64 end of central directory signature",
            ));
        }
        let _record_size = reader.read_u64::<LittleEndian>()?;
        let _version_made_by = reader.read_u16::<LittleEndian>()?;
        let _version_needed = reader.read_u16::<LittleEndian>()?;
        let _disk_number = reader.read_u32::<LittleEndian>()?;
        let _disk_with_central_directory = reader.read_u32::<LittleEndian>()?;
        let _number_of_files_on_this_disk = reader.read_u64::<LittleEndian>()?;
        let number_of_files = reader.read_u64::<LittleEndian>()?;
        let central_directory_size = reader.read_u64::<LittleEndian>()?;
        let central_directory_offset = reader.read_u64::<LittleEndian>()?;
        Ok(Zip64CentralDirectoryEnd {
            number_of_files,
            central_directory_size,
            central_directory_offset,
        })
    }
}

/// One central directory header, raw fields plus the variable tails.
#[derive(Debug)]
pub(crate) struct CentralDirectoryRecord {
    pub version_made_by: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub external_attributes: u32,
    pub local_header_offset: u32,
    pub file_name: Vec<u8>,
    pub extra_field: Vec<u8>,
    pub file_comment: Vec<u8>,
}

impl CentralDirectoryRecord {
    /// Parses one record from `cursor`, advancing it past the variable
    /// tails.
    pub(crate) fn parse(cursor: &mut Cursor<&[u8]>) -> ZipResult<CentralDirectoryRecord> {
        if cursor.read_u32::<LittleEndian>()? != CENTRAL_DIRECTORY_HEADER_SIGNATURE {
            return Err(ZipError::BadFormat("invalid central directory signature"));
        }
        let version_made_by = cursor.read_u16::<LittleEndian>()?;
        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let last_mod_time = cursor.read_u16::<LittleEndian>()?;
        let last_mod_date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let compressed_size = cursor.read_u32::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u32::<LittleEndian>()?;
        let file_name_length = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_field_length = cursor.read_u16::<LittleEndian>()? as usize;
        let file_comment_length = cursor.read_u16::<LittleEndian>()? as usize;
        let _disk_number = cursor.read_u16::<LittleEndian>()?;
        let _internal_attributes = cursor.read_u16::<LittleEndian>()?;
        let external_attributes = cursor.read_u32::<LittleEndian>()?;
        let local_header_offset = cursor.read_u32::<LittleEndian>()?;

        let file_name = read_tail(cursor, file_name_length)?;
        let extra_field = read_tail(cursor, extra_field_length)?;
        let file_comment = read_tail(cursor, file_comment_length)?;

        Ok(CentralDirectoryRecord {
            version_made_by,
            flags,
            compression_method,
            last_mod_time,
            last_mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            external_attributes,
            local_header_offset,
            file_name,
            extra_field,
            file_comment,
        })
    }
}

/// The two variable-length field sizes of a local file header. The local
/// header must be re-read because its lengths are independent of the
/// central record.
#[derive(Debug)]
pub(crate) struct LocalHeaderTail {
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalHeaderTail {
    pub(crate) fn parse(bytes: &[u8]) -> ZipResult<LocalHeaderTail> {
        if bytes.len() < LOCAL_HEADER_SIZE {
            return Err(ZipError::BadFormat("local file header too short"));
        }
        let mut reader = Cursor::new(bytes);
        if reader.read_u32::<LittleEndian>()? != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(ZipError::BadFormat("invalid local file header signature"));
        }
        reader.set_position(26);
        let file_name_length = reader.read_u16::<LittleEndian>()?;
        let extra_field_length = reader.read_u16::<LittleEndian>()?;
        Ok(LocalHeaderTail {
            file_name_length,
            extra_field_length,
        })
    }

    pub(crate) fn data_offset(&self, header_start: u64) -> u64 {
        header_start
            + LOCAL_HEADER_SIZE as u64
            + self.file_name_length as u64
            + self.extra_field_length as u64
    }
}

fn read_tail(cursor: &mut Cursor<&[u8]>, length: usize) -> ZipResult<Vec<u8>> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    let end = start
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or(ZipError::BadFormat("central directory record truncated"))?;
    cursor.set_position(end as u64);
    Ok(data[start..end].to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eocd_rejects_wrong_signature() {
        let bytes = [0u8; EOCD_SIZE];
        assert!(matches!(
            CentralDirectoryEnd::parse(&bytes),
            Err(ZipError::BadFormat(_))
        ));
    }

    #[test]
    fn eocd_round_trips_fields() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // disk number
        bytes.extend_from_slice(&0u16.to_le_bytes()); // cd disk
        bytes.extend_from_slice(&3u16.to_le_bytes()); // entries on disk
        bytes.extend_from_slice(&3u16.to_le_bytes()); // entries
        bytes.extend_from_slice(&51u32.to_le_bytes()); // cd size
        bytes.extend_from_slice(&99u32.to_le_bytes()); // cd offset
        bytes.extend_from_slice(&0u16.to_le_bytes()); // comment

        let eocd = CentralDirectoryEnd::parse(&bytes).unwrap();
        assert_eq!(eocd.number_of_files, 3);
        assert_eq!(eocd.central_directory_size, 51);
        assert_eq!(eocd.central_directory_offset, 99);
        assert!(!eocd.requires_zip64());
    }

    #[test]
    fn sentinel_counts_require_zip64() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&0xFFFFu16.to_le_bytes());
        bytes.extend_from_slice(&0xFFFFu16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        assert!(CentralDirectoryEnd::parse(&bytes).unwrap().requires_zip64());
    }

    #[test]
    fn local_header_tail_locates_the_payload() {
        let mut bytes = vec![0u8; LOCAL_HEADER_SIZE];
        bytes[..4].copy_from_slice(&LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes());
        bytes[26..28].copy_from_slice(&9u16.to_le_bytes());
        bytes[28..30].copy_from_slice(&20u16.to_le_bytes());
        let tail = LocalHeaderTail::parse(&bytes).unwrap();
        assert_eq!(tail.data_offset(1000), 1000 + 30 + 9 + 20);
    }
}
