//! File source and sink adapters over `tokio::fs`.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::result::ZipResult;

use super::{Sink, Source};

/// A [`Source`] over a file on disk.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Opens `path` for random-access reading.
    pub async fn open(path: impl AsRef<Path>) -> ZipResult<FileSource> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(FileSource { file, size })
    }
}

#[async_trait]
impl Source for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_window(&mut self, offset: u64, length: usize) -> ZipResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// A [`Sink`] appending to a file on disk.
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Creates (or truncates) `path` for writing.
    pub async fn create(path: impl AsRef<Path>) -> ZipResult<FileSink> {
        let file = File::create(path).await?;
        Ok(FileSink { file })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write_window(&mut self, bytes: &[u8]) -> ZipResult<()> {
        self.file.write_all(bytes).await?;
        Ok(())
    }

    async fn finalize(&mut self) -> ZipResult<()> {
        self.file.flush().await?;
        Ok(())
    }
}
