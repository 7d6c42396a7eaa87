//! A streaming library for reading and writing ZIP archives.
//!
//! Archives are read from any random-access [`Source`] and written to any
//! append-only [`Sink`]; payloads flow through a chunked codec pipeline
//! that handles DEFLATE compression, CRC-32 signing and WinZip-AES
//! encryption, optionally on a bounded pool of off-thread workers.
//! Large archives are supported through the ZIP64 extensions.
//!
//! ```no_run
//! use zipflow::{EntryOptions, MemorySink, MemorySource, ZipReader, ZipWriter};
//!
//! # async fn doit() -> zipflow::ZipResult<()> {
//! let writer = ZipWriter::new(MemorySink::new());
//! let mut payload = MemorySource::from(&b"Hello, World!"[..]);
//! writer.add("hello.txt", &mut payload, EntryOptions::default()).await?;
//! let sink = writer.close(None).await?;
//!
//! let mut reader = ZipReader::open(MemorySource::new(sink.into_inner())).await?;
//! let restored = reader.extract_to_vec(0, Default::default()).await?;
//! assert_eq!(restored, b"Hello, World!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]

mod aes;
mod codec;
pub mod config;
mod cp437;
mod crc32;
mod io;
mod mover;
mod read;
pub mod result;
mod spec;
mod types;
mod workers;
mod write;

pub use config::{configure, Config, ConfigPatch};
pub use cp437::FromCp437;
pub use crc32::Crc32;
pub use io::{FileSink, FileSource, MemorySink, MemorySource, Sink, Source};
pub use read::{ExtractOptions, ZipReader};
pub use result::{ZipError, ZipResult};
pub use types::{AesMode, CompressionMethod, DateTime, ZipEntry};
pub use workers::WorkerPool;
pub use write::{EntryOptions, ZipWriter};
