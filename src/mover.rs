//! The chunked data mover: reads fixed-size windows from a source,
//! drives them through a codec stage, and appends the transformed bytes
//! to a sink.
//!
//! Within one call windows are read sequentially and each window is fully
//! consumed by the stage before the next is read. Progress is reported
//! after every window as a monotonically non-decreasing
//! `(processed, total)` pair.

use crate::codec::StageDriver;
use crate::config::MIN_CHUNK_SIZE;
use crate::io::{Sink, Source};
use crate::result::ZipResult;

/// Bytes-level result of one entry move.
#[derive(Debug)]
pub(crate) struct MoveOutput {
    /// Signature of the plaintext when the stage signed it.
    pub crc32: Option<u32>,
    /// Total bytes written to the sink.
    pub written: u64,
}

/// Progress observer, called after each window.
pub(crate) type Progress<'a, 'b> = Option<&'a mut (dyn FnMut(u64, u64) + Send + 'b)>;

/// Moves `length` bytes starting at `offset` from `source` through
/// `stage` into `sink`.
pub(crate) async fn run<S, K>(
    source: &mut S,
    offset: u64,
    length: u64,
    stage: &mut StageDriver,
    sink: &mut K,
    chunk_size: usize,
    mut progress: Progress<'_, '_>,
) -> ZipResult<MoveOutput>
where
    S: Source + ?Sized,
    K: Sink + ?Sized,
{
    let window = chunk_size.max(MIN_CHUNK_SIZE);
    let mut processed = 0u64;
    let mut written = 0u64;

    while processed < length {
        let take = window.min((length - processed) as usize);
        let data = source.read_window(offset + processed, take).await?;
        let out = stage.append(data).await?;
        if !out.is_empty() {
            sink.write_window(&out).await?;
            written += out.len() as u64;
        }
        processed += take as u64;
        if let Some(observer) = progress.as_deref_mut() {
            observer(processed, length);
        }
    }

    let flushed = stage.flush().await?;
    if !flushed.data.is_empty() {
        sink.write_window(&flushed.data).await?;
        written += flushed.data.len() as u64;
    }
    Ok(MoveOutput {
        crc32: flushed.crc32,
        written,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{CodecPolicy, Direction, EntryCodec};
    use crate::io::{MemorySink, MemorySource};

    fn store_stage(direction: Direction) -> StageDriver {
        StageDriver::Local(
            EntryCodec::new(
                direction,
                CodecPolicy {
                    compressed: false,
                    signed: true,
                    password: None,
                    expected_crc32: 0,
                    level: 0,
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn windows_cover_the_requested_span() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut source = MemorySource::new(data.clone());
        let mut sink = MemorySink::new();
        let mut stage = store_stage(Direction::Deflate);

        let mut seen = Vec::new();
        let mut observer = |processed: u64, total: u64| seen.push((processed, total));
        let out = run(
            &mut source,
            100,
            800,
            &mut stage,
            &mut sink,
            0, // clamped up to the 64 byte minimum
            Some(&mut observer),
        )
        .await
        .unwrap();

        assert_eq!(out.written, 800);
        assert_eq!(sink.as_slice(), &data[100..900]);
        assert_eq!(seen.len(), 800 / 64 + 1);
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(seen.last(), Some(&(800, 800)));
    }

    #[tokio::test]
    async fn zero_length_move_still_flushes() {
        let mut source = MemorySource::new(Vec::new());
        let mut sink = MemorySink::new();
        let mut stage = store_stage(Direction::Deflate);

        let out = run(&mut source, 0, 0, &mut stage, &mut sink, 512, None)
            .await
            .unwrap();
        assert_eq!(out.written, 0);
        assert_eq!(out.crc32, Some(0));
    }
}
