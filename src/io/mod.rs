//! Byte-source and byte-sink capability traits.
//!
//! The engine depends only on these two contracts. A [`Source`] is a
//! random-access view the reader can position freely; a [`Sink`] is an
//! append-only stream the writer owns for the duration of a session.

mod file;
mod memory;

pub use file::{FileSink, FileSource};
pub use memory::{MemorySink, MemorySource};

use async_trait::async_trait;

use crate::result::ZipResult;

/// A random-access byte source.
///
/// Reads may be non-contiguous; within one engine operation windows are
/// requested sequentially.
#[async_trait]
pub trait Source: Send {
    /// Prepares the source for reading. Called once before any window is
    /// requested.
    async fn init(&mut self) -> ZipResult<()> {
        Ok(())
    }

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `length` bytes starting at `offset`.
    async fn read_window(&mut self, offset: u64, length: usize) -> ZipResult<Vec<u8>>;
}

/// An append-only byte sink.
#[async_trait]
pub trait Sink: Send {
    /// Prepares the sink for writing. Called once before any window is
    /// written.
    async fn init(&mut self) -> ZipResult<()> {
        Ok(())
    }

    /// Appends `bytes` to the sink.
    async fn write_window(&mut self, bytes: &[u8]) -> ZipResult<()>;

    /// Flushes buffered state once the session is complete.
    async fn finalize(&mut self) -> ZipResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: Source + ?Sized> Source for &mut S {
    async fn init(&mut self) -> ZipResult<()> {
        (**self).init().await
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    async fn read_window(&mut self, offset: u64, length: usize) -> ZipResult<Vec<u8>> {
        (**self).read_window(offset, length).await
    }
}

#[async_trait]
impl<K: Sink + ?Sized> Sink for &mut K {
    async fn init(&mut self) -> ZipResult<()> {
        (**self).init().await
    }

    async fn write_window(&mut self, bytes: &[u8]) -> ZipResult<()> {
        (**self).write_window(bytes).await
    }

    async fn finalize(&mut self) -> ZipResult<()> {
        (**self).finalize().await
    }
}
