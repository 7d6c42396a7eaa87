//! Types for reading ZIP archives

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, trace};

use crate::codec::{CodecPolicy, Direction, StageDriver};
use crate::config::Config;
use crate::cp437::FromCp437;
use crate::io::{MemorySink, Sink, Source};
use crate::mover;
use crate::result::{ZipError, ZipResult};
use crate::spec;
use crate::types::{AesMode, CompressionMethod, DateTime, ZipEntry};

/// Options for extracting one entry.
#[derive(Default)]
pub struct ExtractOptions<'a> {
    /// Password for WinZip-AES entries.
    pub password: Option<&'a [u8]>,
    /// Progress observer, called with `(processed, total)` after each
    /// window of compressed input.
    pub progress: Option<&'a mut (dyn FnMut(u64, u64) + Send)>,
}

impl<'a> ExtractOptions<'a> {
    pub fn with_password(password: &'a [u8]) -> ExtractOptions<'a> {
        ExtractOptions {
            password: Some(password),
            progress: None,
        }
    }
}

impl std::fmt::Debug for ExtractOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("password", &self.password.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// ZIP archive reader over a random-access [`Source`].
///
/// The central directory is parsed once when the reader is opened; entry
/// records are read-only from then on.
pub struct ZipReader<S: Source> {
    source: S,
    entries: Vec<ZipEntry>,
    names_map: HashMap<String, usize>,
    comment_raw: Vec<u8>,
    config: Config,
}

impl<S: Source> std::fmt::Debug for ZipReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipReader")
            .field("entries", &self.entries.len())
            .field("comment_bytes", &self.comment_raw.len())
            .finish()
    }
}

impl<S: Source> ZipReader<S> {
    /// Opens an archive, locating the end of central directory and
    /// collecting the entries it describes.
    pub async fn open(source: S) -> ZipResult<ZipReader<S>> {
        Self::open_with_config(source, Config::snapshot()).await
    }

    /// As [`open`](Self::open), with an explicit configuration snapshot.
    pub async fn open_with_config(mut source: S, config: Config) -> ZipResult<ZipReader<S>> {
        source.init().await?;

        let (eocd, eocd_offset) = find_eocd(&mut source).await?;
        let comment_raw = read_comment(&mut source, &eocd, eocd_offset).await?;

        let (number_of_files, directory_size, directory_offset) = if eocd.requires_zip64() {
            let (files, size, offset) = read_zip64_directory_counts(&mut source, eocd_offset).await?;
            debug!(files, "archive uses ZIP64 extensions");
            (files, size, offset)
        } else {
            (
                eocd.number_of_files as u64,
                eocd.central_directory_size as u64,
                eocd.central_directory_offset as u64,
            )
        };

        if directory_offset
            .checked_add(directory_size)
            .map_or(true, |end| end > source.size())
        {
            return Err(ZipError::BadFormat("central directory out of bounds"));
        }

        let directory = source
            .read_window(directory_offset, directory_size as usize)
            .await?;
        let mut cursor = Cursor::new(directory.as_slice());
        let mut entries = Vec::with_capacity(number_of_files.min(u16::MAX as u64) as usize);
        let mut names_map = HashMap::new();
        for _ in 0..number_of_files {
            let record = spec::CentralDirectoryRecord::parse(&mut cursor)?;
            let entry = entry_from_record(record)?;
            names_map.insert(entry.file_name.clone(), entries.len());
            entries.push(entry);
        }

        Ok(ZipReader {
            source,
            entries,
            names_map,
            comment_raw,
            config,
        })
    }

    /// Number of entries in the archive.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive contains no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry records, in central directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Looks an entry up by its decoded name.
    pub fn by_name(&self, name: &str) -> Option<&ZipEntry> {
        self.names_map.get(name).map(|&index| &self.entries[index])
    }

    /// Index of the entry with the given decoded name, usable with
    /// [`extract`](Self::extract).
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names_map.get(name).copied()
    }

    /// The archive comment, decoded as UTF-8.
    pub fn comment(&self) -> String {
        String::from_utf8_lossy(&self.comment_raw).into_owned()
    }

    /// The archive comment in its raw byte representation.
    pub fn comment_raw(&self) -> &[u8] {
        &self.comment_raw
    }

    /// Extracts the payload of entry `index` into `sink`, returning the
    /// number of bytes written.
    ///
    /// Drives the inflate pipeline over exactly the stored compressed
    /// span; the CRC-32 (or, for AES entries, the authentication code) is
    /// verified when the last window has been processed.
    pub async fn extract<K: Sink>(
        &mut self,
        index: usize,
        sink: &mut K,
        options: ExtractOptions<'_>,
    ) -> ZipResult<u64> {
        let entry = self
            .entries
            .get(index)
            .ok_or(ZipError::BadFormat("entry index out of range"))?
            .clone();

        let header = self
            .source
            .read_window(entry.header_start, spec::LOCAL_HEADER_SIZE)
            .await?;
        let tail = spec::LocalHeaderTail::parse(&header)?;
        let data_offset = tail.data_offset(entry.header_start);

        let password = match (entry.encrypted, options.password) {
            (true, None) => return Err(ZipError::Encrypted),
            (true, Some(password)) => Some(password.to_vec()),
            (false, _) => None,
        };
        let compressed = match entry.compression_method {
            CompressionMethod::Stored => false,
            CompressionMethod::Deflated => true,
            method => return Err(ZipError::UnsupportedCompression(method.to_u16())),
        };

        let policy = CodecPolicy {
            compressed,
            signed: !entry.encrypted,
            password,
            expected_crc32: entry.crc32,
            level: 0,
        };
        let mut stage = StageDriver::acquire(&self.config, Direction::Inflate, policy).await?;

        sink.init().await?;
        let moved = mover::run(
            &mut self.source,
            data_offset,
            entry.compressed_size,
            &mut stage,
            sink,
            self.config.effective_chunk_size(),
            options.progress,
        )
        .await?;
        sink.finalize().await?;
        Ok(moved.written)
    }

    /// Extracts entry `index` into a fresh byte buffer.
    pub async fn extract_to_vec(
        &mut self,
        index: usize,
        options: ExtractOptions<'_>,
    ) -> ZipResult<Vec<u8>> {
        let mut sink = MemorySink::new();
        self.extract(index, &mut sink, options).await?;
        Ok(sink.into_inner())
    }

    /// Returns the wrapped source.
    pub fn into_inner(self) -> S {
        self.source
    }
}

/// Locates the end of central directory record.
///
/// First attempts the minimum 22 byte window at the end of the source,
/// then falls back to scanning backward byte-by-byte through the maximum
/// comment span.
async fn find_eocd<S: Source>(
    source: &mut S,
) -> ZipResult<(spec::CentralDirectoryEnd, u64)> {
    let size = source.size();
    if size < spec::EOCD_SIZE as u64 {
        return Err(ZipError::BadFormat("archive is too short"));
    }

    let minimal_offset = size - spec::EOCD_SIZE as u64;
    let minimal = source
        .read_window(minimal_offset, spec::EOCD_SIZE)
        .await?;
    if minimal[..4] == spec::CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes() {
        let eocd = spec::CentralDirectoryEnd::parse(&minimal)?;
        return Ok((eocd, minimal_offset));
    }

    trace!("no trailing EOCD, scanning the comment span");
    let span = spec::EOCD_SEARCH_SPAN.min(size);
    let window_offset = size - span;
    let window = source.read_window(window_offset, span as usize).await?;
    let signature = spec::CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes();
    for start in (0..=window.len() - spec::EOCD_SIZE).rev() {
        if window[start..start + 4] == signature {
            let eocd = spec::CentralDirectoryEnd::parse(&window[start..start + spec::EOCD_SIZE])?;
            return Ok((eocd, window_offset + start as u64));
        }
    }
    Err(ZipError::BadFormat("missing end of central directory"))
}

async fn read_comment<S: Source>(
    source: &mut S,
    eocd: &spec::CentralDirectoryEnd,
    eocd_offset: u64,
) -> ZipResult<Vec<u8>> {
    let comment_offset = eocd_offset + spec::EOCD_SIZE as u64;
    let available = source.size().saturating_sub(comment_offset);
    let length = (eocd.comment_length as u64).min(available);
    if length == 0 {
        return Ok(Vec::new());
    }
    source.read_window(comment_offset, length as usize).await
}

/// Follows the ZIP64 locator chain: a 20 byte locator directly before the
/// EOCD points at the 56 byte ZIP64 end of central directory record.
async fn read_zip64_directory_counts<S: Source>(
    source: &mut S,
    eocd_offset: u64,
) -> ZipResult<(u64, u64, u64)> {
    let locator_offset = eocd_offset
        .checked_sub(spec::ZIP64_EOCD_LOCATOR_SIZE as u64)
        .ok_or(ZipError::BadFormat("missing zip64 locator"))?;
    let locator_bytes = source
        .read_window(locator_offset, spec::ZIP64_EOCD_LOCATOR_SIZE)
        .await?;
    let locator = spec::Zip64CentralDirectoryEndLocator::parse(&locator_bytes)?;

    let record_bytes = source
        .read_window(
            locator.end_of_central_directory_offset,
            spec::ZIP64_EOCD_SIZE,
        )
        .await?;
    let record = spec::Zip64CentralDirectoryEnd::parse(&record_bytes)?;
    Ok((
        record.number_of_files,
        record.central_directory_size,
        record.central_directory_offset,
    ))
}

/// Builds an entry from one central directory record: decodes the name
/// and comment per the language-encoding flag, resolves the extra fields,
/// and validates the encryption invariants.
fn entry_from_record(record: spec::CentralDirectoryRecord) -> ZipResult<ZipEntry> {
    let is_utf8 = record.flags & (1 << 11) != 0;
    let file_name = decode_text(&record.file_name, is_utf8);
    let file_comment = decode_text(&record.file_comment, is_utf8);
    let encrypted = record.flags & 1 != 0;
    let stored_method = CompressionMethod::from_u16(record.compression_method);
    let directory =
        record.external_attributes & 0x10 != 0 || record.file_name.ends_with(b"/");

    let mut entry = ZipEntry {
        file_name,
        file_name_raw: record.file_name,
        file_comment,
        file_comment_raw: record.file_comment,
        version_made_by: record.version_made_by,
        flags: record.flags,
        compression_method: stored_method,
        stored_method,
        last_modified: DateTime::from_msdos(record.last_mod_date, record.last_mod_time),
        crc32: record.crc32,
        compressed_size: record.compressed_size as u64,
        uncompressed_size: record.uncompressed_size as u64,
        header_start: record.local_header_offset as u64,
        directory,
        encrypted,
        extra_field: record.extra_field,
        extra_fields: HashMap::new(),
        aes_mode: None,
        zip64: false,
        external_attributes: record.external_attributes,
    };
    parse_extra_fields(&mut entry)?;

    if entry.encrypted {
        if entry.stored_method != CompressionMethod::Aes {
            return Err(ZipError::UnsupportedCompression(
                entry.stored_method.to_u16(),
            ));
        }
        if entry.aes_mode.is_none() {
            return Err(ZipError::BadFormat(
                "AES encryption without AES extra data field",
            ));
        }
    }
    Ok(entry)
}

fn decode_text(raw: &[u8], is_utf8: bool) -> String {
    if is_utf8 {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        raw.from_cp437()
    }
}

/// Parses the extra field blob into the tag map, resolving ZIP64
/// sentinels and the WinZip-AES extra.
fn parse_extra_fields(entry: &mut ZipEntry) -> ZipResult<()> {
    let blob = entry.extra_field.clone();
    let mut reader = Cursor::new(blob.as_slice());

    while (reader.position() as usize) + 4 <= blob.len() {
        let tag = reader.read_u16::<LittleEndian>()?;
        let length = reader.read_u16::<LittleEndian>()? as usize;
        let start = reader.position() as usize;
        if start + length > blob.len() {
            return Err(ZipError::BadFormat("extra field overruns its container"));
        }
        let data = &blob[start..start + length];
        entry.extra_fields.insert(tag, data.to_vec());

        match tag {
            spec::ZIP64_EXTRA_TAG => resolve_zip64_extra(entry, data)?,
            spec::AES_EXTRA_TAG => resolve_aes_extra(entry, data)?,
            _ => {}
        }
        reader.set_position((start + length) as u64);
    }

    let sentinel = spec::ZIP64_BYTES_THR;
    if !entry.zip64
        && (entry.uncompressed_size == sentinel
            || entry.compressed_size == sentinel
            || entry.header_start == sentinel)
    {
        return Err(ZipError::BadFormat(
            "ZIP64 sentinel without a backing extra field",
        ));
    }
    Ok(())
}

/// The ZIP64 extra supplies a 64-bit slot for each header field that
/// carries the 0xFFFFFFFF sentinel, in fixed order: uncompressed size,
/// compressed size, local header offset.
fn resolve_zip64_extra(entry: &mut ZipEntry, data: &[u8]) -> ZipResult<()> {
    let mut reader = Cursor::new(data);
    let sentinel = spec::ZIP64_BYTES_THR;
    let missing = || ZipError::BadFormat("ZIP64 sentinel without a backing extra field");

    if entry.uncompressed_size == sentinel {
        entry.uncompressed_size = reader.read_u64::<LittleEndian>().map_err(|_| missing())?;
        entry.zip64 = true;
    }
    if entry.compressed_size == sentinel {
        entry.compressed_size = reader.read_u64::<LittleEndian>().map_err(|_| missing())?;
        entry.zip64 = true;
    }
    if entry.header_start == sentinel {
        entry.header_start = reader.read_u64::<LittleEndian>().map_err(|_| missing())?;
        entry.zip64 = true;
    }
    Ok(())
}

/// The WinZip-AES extra: vendor version, vendor id "AE", strength byte,
/// and the compression method actually applied to the payload.
fn resolve_aes_extra(entry: &mut ZipEntry, data: &[u8]) -> ZipResult<()> {
    if data.len() != 7 {
        return Err(ZipError::BadFormat("AES extra field has a bad length"));
    }
    let mut reader = Cursor::new(data);
    let vendor_version = reader.read_u16::<LittleEndian>()?;
    let vendor_id = reader.read_u16::<LittleEndian>()?;
    let strength = reader.read_u8()?;
    let method = reader.read_u16::<LittleEndian>()?;

    if vendor_id != spec::AES_VENDOR_ID {
        return Err(ZipError::BadFormat("invalid AES vendor"));
    }
    if vendor_version != 0x0001 && vendor_version != spec::AES_VENDOR_VERSION {
        return Err(ZipError::BadFormat("invalid AES vendor version"));
    }
    if strength != AesMode::Aes256.strength() {
        return Err(ZipError::UnsupportedEncryption(
            "only AES-256 (strength 3) is supported",
        ));
    }
    entry.aes_mode = Some(AesMode::Aes256);
    entry.compression_method = CompressionMethod::from_u16(method);
    Ok(())
}
