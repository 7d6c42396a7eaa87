//! In-memory source and sink adapters.

use async_trait::async_trait;

use crate::result::{ZipError, ZipResult};

use super::{Sink, Source};

/// A [`Source`] over an owned byte buffer.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> MemorySource {
        MemorySource { data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for MemorySource {
    fn from(data: Vec<u8>) -> MemorySource {
        MemorySource::new(data)
    }
}

impl From<&[u8]> for MemorySource {
    fn from(data: &[u8]) -> MemorySource {
        MemorySource::new(data.to_vec())
    }
}

#[async_trait]
impl Source for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_window(&mut self, offset: u64, length: usize) -> ZipResult<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or(ZipError::BadFormat("read window out of bounds"))?;
        Ok(self.data[start..end].to_vec())
    }
}

/// A [`Sink`] accumulating into an owned byte buffer.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    /// The accumulated archive bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write_window(&mut self, bytes: &[u8]) -> ZipResult<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}
