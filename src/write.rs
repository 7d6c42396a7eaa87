//! Types for creating ZIP archives

use std::collections::HashSet;

use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use crate::codec::{CodecPolicy, Direction, StageDriver};
use crate::config::Config;
use crate::io::{MemorySink, Sink, Source};
use crate::mover;
use crate::result::{ZipError, ZipResult};
use crate::spec;
use crate::types::{CompressionMethod, DateTime, ZipEntry};

const VERSION_BASE: u16 = 0x14;
const VERSION_ZIP64: u16 = 0x2D;
const VERSION_AES: u16 = 0x33;

/// Flag bit 3: sizes follow in the data descriptor. Always set by this
/// writer, including under ZIP64 with known sizes.
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_ENCRYPTED: u16 = 1;
const FLAG_UTF8: u16 = 1 << 11;

/// Per-entry options for [`ZipWriter::add`].
pub struct EntryOptions {
    pub(crate) level: u32,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) zip64: bool,
    pub(crate) buffered_write: bool,
    pub(crate) last_modified: DateTime,
    pub(crate) comment: String,
    pub(crate) extra_field: Vec<u8>,
    pub(crate) progress: Option<Box<dyn FnMut(u64, u64) + Send>>,
}

impl Default for EntryOptions {
    fn default() -> EntryOptions {
        EntryOptions {
            level: 6,
            password: None,
            zip64: false,
            buffered_write: false,
            last_modified: DateTime::default(),
            comment: String::new(),
            extra_field: Vec::new(),
            progress: None,
        }
    }
}

impl std::fmt::Debug for EntryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryOptions")
            .field("level", &self.level)
            .field("encrypted", &self.password.is_some())
            .field("zip64", &self.zip64)
            .field("buffered_write", &self.buffered_write)
            .finish()
    }
}

impl EntryOptions {
    /// Deflate level; `0` stores the payload uncompressed.
    #[must_use]
    pub fn level(mut self, level: u32) -> EntryOptions {
        self.level = level;
        self
    }

    /// Encrypt the payload with WinZip AES-256.
    #[must_use]
    pub fn password(mut self, password: &[u8]) -> EntryOptions {
        self.password = Some(password.to_vec());
        self
    }

    /// Force 64-bit size and offset fields for this entry.
    #[must_use]
    pub fn zip64(mut self, zip64: bool) -> EntryOptions {
        self.zip64 = zip64;
        self
    }

    /// Produce the entry into a transient buffer and append it to the
    /// archive atomically. Lets concurrent `add` calls overlap their
    /// codec work while still serialising on the sink in invocation
    /// order.
    #[must_use]
    pub fn buffered_write(mut self, buffered: bool) -> EntryOptions {
        self.buffered_write = buffered;
        self
    }

    /// Last modified timestamp recorded for the entry.
    #[must_use]
    pub fn last_modified(mut self, last_modified: DateTime) -> EntryOptions {
        self.last_modified = last_modified;
        self
    }

    /// Entry comment, stored in the central directory.
    #[must_use]
    pub fn comment<C: Into<String>>(mut self, comment: C) -> EntryOptions {
        self.comment = comment.into();
        self
    }

    /// Caller-provided raw extra fields, appended after the ones this
    /// writer generates. Each must be laid out as `tag | size | data`.
    #[must_use]
    pub fn extra_field(mut self, extra_field: Vec<u8>) -> EntryOptions {
        self.extra_field = extra_field;
        self
    }

    /// Progress observer, called with `(processed, total)` after each
    /// window of payload input.
    #[must_use]
    pub fn progress(mut self, progress: Box<dyn FnMut(u64, u64) + Send>) -> EntryOptions {
        self.progress = Some(progress);
        self
    }
}

struct WriterState<K> {
    sink: K,
    offset: u64,
    entries: IndexMap<String, ZipEntry>,
    reserved: HashSet<String>,
    /// Sticky: once any entry needs ZIP64 the archive is promoted.
    zip64: bool,
    next_ticket: u64,
}

/// Streaming ZIP archive writer over an append-only [`Sink`].
///
/// Entries are emitted in `add` invocation order; `close` writes the
/// central directory and the trailer records. `add` takes `&self`, so
/// entries with `buffered_write` may be produced concurrently.
pub struct ZipWriter<K: Sink> {
    state: Mutex<WriterState<K>>,
    turn: watch::Sender<u64>,
    config: Config,
}

impl<K: Sink> std::fmt::Debug for ZipWriter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipWriter").finish_non_exhaustive()
    }
}

impl<K: Sink> ZipWriter<K> {
    /// Starts an archive session that owns `sink` until `close`.
    pub fn new(sink: K) -> ZipWriter<K> {
        Self::with_config(sink, Config::snapshot())
    }

    /// As [`new`](Self::new), with an explicit configuration snapshot.
    pub fn with_config(sink: K, config: Config) -> ZipWriter<K> {
        let (turn, _) = watch::channel(0);
        ZipWriter {
            state: Mutex::new(WriterState {
                sink,
                offset: 0,
                entries: IndexMap::new(),
                reserved: HashSet::new(),
                zip64: false,
                next_ticket: 0,
            }),
            turn,
            config,
        }
    }

    /// Names of the entries written so far, in archive order.
    pub async fn entry_names(&self) -> Vec<String> {
        self.state.lock().await.entries.keys().cloned().collect()
    }

    /// Adds one entry with the payload read from `source`.
    pub async fn add<S: Source>(
        &self,
        name: &str,
        source: &mut S,
        options: EntryOptions,
    ) -> ZipResult<()> {
        self.add_inner(name, Some(source as &mut dyn Source), false, options)
            .await
    }

    /// Adds a directory entry. A "/" is appended to the name if missing;
    /// directory entries carry no payload.
    pub async fn add_directory(&self, name: &str, options: EntryOptions) -> ZipResult<()> {
        self.add_inner(name, None, true, options).await
    }

    async fn add_inner<'a>(
        &self,
        name: &str,
        mut source: Option<&'a mut dyn Source>,
        directory: bool,
        mut options: EntryOptions,
    ) -> ZipResult<()> {
        let mut name = name.trim_end().to_string();
        if directory && !name.ends_with('/') {
            name.push('/');
        }

        if let Some(source) = source.as_deref_mut() {
            source.init().await?;
        }
        let source_size = source.as_deref().map(|s| s.size()).unwrap_or(0);

        // Reserve the name and take an invocation-order ticket.
        let (ticket, sticky_zip64) = {
            let mut state = self.state.lock().await;
            if state.entries.contains_key(&name) || !state.reserved.insert(name.clone()) {
                return Err(ZipError::DuplicatedName(name));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            (ticket, state.zip64)
        };

        let zip64 =
            options.zip64 || sticky_zip64 || source_size >= spec::ZIP64_BYTES_THR;
        let mut entry = self.build_entry(&name, directory, zip64, &options);
        trace!(name = %entry.file_name, zip64, encrypted = entry.encrypted, "starting entry");

        let result = if options.buffered_write {
            let mut buffer = MemorySink::new();
            let produced = self
                .emit_entry(&mut buffer, &mut entry, source, &mut options)
                .await
                .map(|_| buffer.into_inner());

            self.wait_turn(ticket).await;
            match produced {
                Ok(blob) => {
                    let mut state = self.state.lock().await;
                    entry.header_start = state.offset;
                    let appended = blob.len() as u64;
                    match state.sink.write_window(&blob).await {
                        Ok(()) => {
                            Self::record_entry(&mut state, entry, appended);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            self.wait_turn(ticket).await;
            let mut state = self.state.lock().await;
            let state = &mut *state;
            entry.header_start = state.offset;
            match self
                .emit_entry(&mut state.sink, &mut entry, source, &mut options)
                .await
            {
                Ok(written) => {
                    Self::record_entry(state, entry, written);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.turn.send_modify(|turn| *turn += 1);

        if result.is_err() {
            self.state.lock().await.reserved.remove(&name);
        }
        result
    }

    async fn wait_turn(&self, ticket: u64) {
        let mut turn = self.turn.subscribe();
        loop {
            if *turn.borrow_and_update() == ticket {
                return;
            }
            if turn.changed().await.is_err() {
                return;
            }
        }
    }

    fn record_entry(state: &mut WriterState<K>, entry: ZipEntry, appended: u64) {
        state.offset += appended;
        state.reserved.remove(&entry.file_name);
        if entry.zip64 || state.offset >= spec::ZIP64_BYTES_THR {
            state.zip64 = true;
        }
        state.entries.insert(entry.file_name.clone(), entry);
    }

    fn build_entry(
        &self,
        name: &str,
        directory: bool,
        zip64: bool,
        options: &EntryOptions,
    ) -> ZipEntry {
        // Directory entries carry no payload, so there is nothing to
        // encrypt or compress.
        let encrypted = options.password.is_some() && !directory;
        let compressed = options.level != 0 && !directory;
        let effective_method = if compressed {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        let stored_method = if encrypted {
            CompressionMethod::Aes
        } else {
            effective_method
        };

        let ascii = name.is_ascii() && options.comment.is_ascii();
        let mut flags = FLAG_DATA_DESCRIPTOR;
        if encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if !ascii {
            flags |= FLAG_UTF8;
        }

        ZipEntry {
            file_name: name.to_string(),
            file_name_raw: name.as_bytes().to_vec(),
            file_comment: options.comment.clone(),
            file_comment_raw: options.comment.as_bytes().to_vec(),
            version_made_by: version_needed(zip64, encrypted),
            flags,
            compression_method: effective_method,
            stored_method,
            last_modified: options.last_modified,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            header_start: 0,
            directory,
            encrypted,
            extra_field: options.extra_field.clone(),
            extra_fields: Default::default(),
            aes_mode: encrypted.then_some(crate::types::AesMode::Aes256),
            zip64,
            external_attributes: if directory { 0x10 } else { 0 },
        }
    }

    /// Emits local header, payload and data descriptor for one entry into
    /// `sink`, backfilling the entry's CRC and sizes. Returns the bytes
    /// written.
    async fn emit_entry<'a, 'b, 'c, 'd, W: Sink>(
        &self,
        sink: &'b mut W,
        entry: &'c mut ZipEntry,
        source: Option<&'a mut dyn Source>,
        options: &'d mut EntryOptions,
    ) -> ZipResult<u64> {
        sink.init().await?;

        let header = local_file_header(entry);
        sink.write_window(&header).await?;
        let mut written = header.len() as u64;

        if !entry.directory {
            let policy = CodecPolicy {
                compressed: entry.compression_method == CompressionMethod::Deflated,
                signed: !entry.encrypted,
                password: options.password.clone(),
                expected_crc32: 0,
                level: options.level,
            };
            let mut stage =
                StageDriver::acquire(&self.config, Direction::Deflate, policy).await?;
            let length = source.as_ref().map(|s| s.size()).unwrap_or(0);
            let mut empty_source = crate::io::MemorySource::default();
            let source: &mut dyn Source = match source {
                Some(source) => source,
                None => &mut empty_source,
            };
            let moved = mover::run(
                source,
                0,
                length,
                &mut stage,
                sink,
                self.config.effective_chunk_size(),
                options.progress.as_deref_mut(),
            )
            .await?;

            entry.crc32 = moved.crc32.unwrap_or(0);
            entry.compressed_size = moved.written;
            entry.uncompressed_size = length;
            written += moved.written;
        }

        let descriptor = data_descriptor(entry);
        sink.write_window(&descriptor).await?;
        written += descriptor.len() as u64;
        Ok(written)
    }

    /// Writes the central directory and trailer records and finalises the
    /// sink.
    ///
    /// The archive is promoted to ZIP64 when any entry required it, the
    /// directory starts at or past 4 GiB, or the entry count reaches
    /// 0xFFFF.
    pub async fn close(self, comment: Option<&[u8]>) -> ZipResult<K> {
        let comment = comment.unwrap_or_default();
        if comment.len() > u16::MAX as usize {
            return Err(ZipError::ZipCommentTooLong(comment.len()));
        }

        let mut state = self.state.into_inner();
        let central_start = state.offset;
        let zip64 = state.zip64
            || central_start >= spec::ZIP64_BYTES_THR
            || state.entries.len() >= spec::ZIP64_ENTRY_THR;
        if zip64 {
            debug!(
                entries = state.entries.len(),
                central_start, "promoting archive to ZIP64"
            );
        }

        let mut directory = Vec::new();
        for entry in state.entries.values() {
            central_directory_record(&mut directory, entry);
        }
        let central_size = directory.len() as u64;
        state.sink.write_window(&directory).await?;

        let mut trailer = Vec::new();
        if zip64 {
            zip64_trailer_records(
                &mut trailer,
                state.entries.len() as u64,
                central_size,
                central_start,
            );
        }
        end_of_central_directory(
            &mut trailer,
            zip64,
            state.entries.len(),
            central_size,
            central_start,
            comment,
        );
        state.sink.write_window(&trailer).await?;
        state.sink.finalize().await?;
        Ok(state.sink)
    }
}

fn version_needed(zip64: bool, encrypted: bool) -> u16 {
    let mut version = VERSION_BASE;
    if zip64 {
        version = VERSION_ZIP64;
    }
    if encrypted {
        version = VERSION_AES;
    }
    version
}

/// The 26-byte common header fragment shared by the local and central
/// headers, minus the fields that differ.
fn common_header_fields(buffer: &mut Vec<u8>, entry: &ZipEntry) {
    // version needed to extract
    let _ = buffer.write_u16::<LittleEndian>(version_needed(entry.zip64, entry.encrypted));
    // general purpose bit flag
    let _ = buffer.write_u16::<LittleEndian>(entry.flags);
    // compression method (the AES wrapper for encrypted entries)
    let _ = buffer.write_u16::<LittleEndian>(entry.stored_method.to_u16());
    // last mod file time and date
    let _ = buffer.write_u16::<LittleEndian>(entry.last_modified.timepart());
    let _ = buffer.write_u16::<LittleEndian>(entry.last_modified.datepart());
}

/// Sizes and CRC as they appear in a header: sentinels under ZIP64, the
/// entry's current values otherwise. The CRC of an encrypted entry is
/// always zero (AE-2).
fn header_sizes(buffer: &mut Vec<u8>, entry: &ZipEntry) {
    let _ = buffer.write_u32::<LittleEndian>(entry.crc32);
    if entry.zip64 {
        let _ = buffer.write_u32::<LittleEndian>(spec::ZIP64_BYTES_THR as u32);
        let _ = buffer.write_u32::<LittleEndian>(spec::ZIP64_BYTES_THR as u32);
    } else {
        let _ = buffer.write_u32::<LittleEndian>(entry.compressed_size as u32);
        let _ = buffer.write_u32::<LittleEndian>(entry.uncompressed_size as u32);
    }
}

fn local_file_header(entry: &ZipEntry) -> Vec<u8> {
    let extras = entry_extras(entry, 0);
    let mut buffer = Vec::with_capacity(
        spec::LOCAL_HEADER_SIZE + entry.file_name_raw.len() + extras.len(),
    );
    let _ = buffer.write_u32::<LittleEndian>(spec::LOCAL_FILE_HEADER_SIGNATURE);
    common_header_fields(&mut buffer, entry);
    // CRC and sizes are still zero here; bit 3 promises the real values
    // in the descriptor. Under ZIP64 the fields hold sentinels either
    // way.
    header_sizes(&mut buffer, entry);
    let _ = buffer.write_u16::<LittleEndian>(entry.file_name_raw.len() as u16);
    let _ = buffer.write_u16::<LittleEndian>(extras.len() as u16);
    buffer.extend_from_slice(&entry.file_name_raw);
    buffer.extend_from_slice(&extras);
    buffer
}

fn data_descriptor(entry: &ZipEntry) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(24);
    let _ = buffer.write_u32::<LittleEndian>(spec::DATA_DESCRIPTOR_SIGNATURE);
    let _ = buffer.write_u32::<LittleEndian>(entry.crc32);
    if entry.zip64 {
        let _ = buffer.write_u64::<LittleEndian>(entry.compressed_size);
        let _ = buffer.write_u64::<LittleEndian>(entry.uncompressed_size);
    } else {
        let _ = buffer.write_u32::<LittleEndian>(entry.compressed_size as u32);
        let _ = buffer.write_u32::<LittleEndian>(entry.uncompressed_size as u32);
    }
    buffer
}

/// Extras generated by this writer, then the caller's raw extras.
fn entry_extras(entry: &ZipEntry, local_header_offset: u64) -> Vec<u8> {
    let mut extras = Vec::new();
    if entry.zip64 {
        let _ = extras.write_u16::<LittleEndian>(spec::ZIP64_EXTRA_TAG);
        let _ = extras.write_u16::<LittleEndian>(24);
        let _ = extras.write_u64::<LittleEndian>(entry.uncompressed_size);
        let _ = extras.write_u64::<LittleEndian>(entry.compressed_size);
        // The local header offset lives at byte 20 of the extra.
        let _ = extras.write_u64::<LittleEndian>(local_header_offset);
    }
    if entry.encrypted {
        let _ = extras.write_u16::<LittleEndian>(spec::AES_EXTRA_TAG);
        let _ = extras.write_u16::<LittleEndian>(7);
        let _ = extras.write_u16::<LittleEndian>(spec::AES_VENDOR_VERSION);
        let _ = extras.write_u16::<LittleEndian>(spec::AES_VENDOR_ID);
        let _ = extras.write_u8(crate::types::AesMode::Aes256.strength());
        let _ = extras.write_u16::<LittleEndian>(entry.compression_method.to_u16());
    }
    extras.extend_from_slice(&entry.extra_field);
    extras
}

fn central_directory_record(buffer: &mut Vec<u8>, entry: &ZipEntry) {
    let extras = entry_extras(entry, entry.header_start);
    let _ = buffer.write_u32::<LittleEndian>(spec::CENTRAL_DIRECTORY_HEADER_SIGNATURE);
    let _ = buffer.write_u16::<LittleEndian>(entry.version_made_by);
    common_header_fields(buffer, entry);
    header_sizes(buffer, entry);
    let _ = buffer.write_u16::<LittleEndian>(entry.file_name_raw.len() as u16);
    let _ = buffer.write_u16::<LittleEndian>(extras.len() as u16);
    let _ = buffer.write_u16::<LittleEndian>(entry.file_comment_raw.len() as u16);
    // disk number start
    let _ = buffer.write_u16::<LittleEndian>(0);
    // internal file attributes
    let _ = buffer.write_u16::<LittleEndian>(0);
    let _ = buffer.write_u32::<LittleEndian>(entry.external_attributes);
    let offset = if entry.zip64 {
        spec::ZIP64_BYTES_THR
    } else {
        entry.header_start
    };
    let _ = buffer.write_u32::<LittleEndian>(offset as u32);
    buffer.extend_from_slice(&entry.file_name_raw);
    buffer.extend_from_slice(&extras);
    buffer.extend_from_slice(&entry.file_comment_raw);
}

/// The ZIP64 end of central directory record followed by its locator.
fn zip64_trailer_records(
    buffer: &mut Vec<u8>,
    number_of_files: u64,
    central_size: u64,
    central_start: u64,
) {
    let _ = buffer.write_u32::<LittleEndian>(spec::ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE);
    // record size, excluding signature and this field
    let _ = buffer.write_u64::<LittleEndian>(44);
    let _ = buffer.write_u16::<LittleEndian>(VERSION_ZIP64);
    let _ = buffer.write_u16::<LittleEndian>(VERSION_ZIP64);
    // disk numbers
    let _ = buffer.write_u32::<LittleEndian>(0);
    let _ = buffer.write_u32::<LittleEndian>(0);
    let _ = buffer.write_u64::<LittleEndian>(number_of_files);
    let _ = buffer.write_u64::<LittleEndian>(number_of_files);
    let _ = buffer.write_u64::<LittleEndian>(central_size);
    let _ = buffer.write_u64::<LittleEndian>(central_start);

    // locator
    let _ = buffer.write_u32::<LittleEndian>(spec::ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE);
    let _ = buffer.write_u32::<LittleEndian>(0);
    let _ = buffer.write_u64::<LittleEndian>(central_start + central_size);
    let _ = buffer.write_u32::<LittleEndian>(1);
}

fn end_of_central_directory(
    buffer: &mut Vec<u8>,
    zip64: bool,
    number_of_files: usize,
    central_size: u64,
    central_start: u64,
    comment: &[u8],
) {
    let count = if zip64 {
        spec::ZIP64_ENTRY_THR as u16
    } else {
        number_of_files as u16
    };
    let offset = if zip64 {
        spec::ZIP64_BYTES_THR as u32
    } else {
        central_start as u32
    };
    let _ = buffer.write_u32::<LittleEndian>(spec::CENTRAL_DIRECTORY_END_SIGNATURE);
    let _ = buffer.write_u16::<LittleEndian>(0);
    let _ = buffer.write_u16::<LittleEndian>(0);
    let _ = buffer.write_u16::<LittleEndian>(count);
    let _ = buffer.write_u16::<LittleEndian>(count);
    let _ = buffer.write_u32::<LittleEndian>(central_size.min(spec::ZIP64_BYTES_THR) as u32);
    let _ = buffer.write_u32::<LittleEndian>(offset);
    let _ = buffer.write_u16::<LittleEndian>(comment.len() as u16);
    buffer.extend_from_slice(comment);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::MemorySource;

    fn no_worker_config() -> Config {
        Config {
            use_workers: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let writer = ZipWriter::with_config(MemorySink::new(), no_worker_config());
        let mut first = MemorySource::from(&b"one"[..]);
        writer
            .add("a.txt", &mut first, EntryOptions::default().level(0))
            .await
            .unwrap();

        let mut second = MemorySource::from(&b"two"[..]);
        let err = writer
            .add("a.txt", &mut second, EntryOptions::default().level(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ZipError::DuplicatedName(name) if name == "a.txt"));

        // The first entry is still intact.
        assert_eq!(writer.entry_names().await, ["a.txt"]);
        writer.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn directory_names_get_a_trailing_slash() {
        let writer = ZipWriter::with_config(MemorySink::new(), no_worker_config());
        writer
            .add_directory("nested/dir", EntryOptions::default())
            .await
            .unwrap();
        assert_eq!(writer.entry_names().await, ["nested/dir/"]);
        writer.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_comment_is_rejected() {
        let writer = ZipWriter::with_config(MemorySink::new(), no_worker_config());
        let comment = vec![b'c'; 70_000];
        let err = writer.close(Some(&comment)).await.unwrap_err();
        assert!(matches!(err, ZipError::ZipCommentTooLong(70_000)));
    }

    #[tokio::test]
    async fn empty_archive_is_a_bare_eocd() {
        let writer = ZipWriter::with_config(MemorySink::new(), no_worker_config());
        let sink = writer.close(None).await.unwrap();
        let bytes = sink.into_inner();
        assert_eq!(bytes.len(), spec::EOCD_SIZE);
        assert_eq!(&bytes[..4], &spec::CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes());
    }
}
