//! The per-entry codec pipeline.
//!
//! A stage transforms payload windows on their way between a source and a
//! sink. Ordering is fixed: on the inflate path input is decrypted, then
//! decompressed, then CRC-checked; on the deflate path plaintext is
//! CRC-signed, then compressed, then encrypted. CRC is only computed for
//! signed, unencrypted entries; AES entries are authenticated by their
//! own HMAC and carry a zero CRC.
//!
//! A stage is a one-shot state machine: `append` may be called any number
//! of times, `flush` is terminal. After `flush` or an error the stage is
//! not reusable.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::aes::{AesDecryptor, AesEncryptor};
use crate::config::Config;
use crate::crc32::Crc32;
use crate::result::{ZipError, ZipResult};
use crate::types::AesMode;
use crate::workers::{WorkerPool, WorkerStage};

const FLATE_BUF: usize = 32 * 1024;

/// Which way payload bytes flow through the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Read path: stored bytes back to plaintext.
    Inflate,
    /// Write path: plaintext to stored bytes.
    Deflate,
}

/// Per-entry codec policy, decided by the reader or writer.
#[derive(Clone, Debug)]
pub(crate) struct CodecPolicy {
    pub compressed: bool,
    pub signed: bool,
    pub password: Option<Vec<u8>>,
    /// CRC the inflate path must reproduce; meaningful when `signed`.
    pub expected_crc32: u32,
    /// Deflate level for the write path.
    pub level: u32,
}

impl CodecPolicy {
    pub(crate) fn encrypted(&self) -> bool {
        self.password.is_some()
    }

    /// True when the stage is heavy enough to be worth a worker.
    pub(crate) fn needs_worker(&self) -> bool {
        self.compressed || self.encrypted()
    }
}

/// Output of a terminal `flush`.
#[derive(Debug, Default)]
pub(crate) struct FlushOutput {
    pub data: Vec<u8>,
    /// Signature of the plaintext; `None` for unsigned (AES) entries.
    pub crc32: Option<u32>,
}

enum Crypto {
    Encrypt(AesEncryptor),
    Decrypt(AesDecryptor),
}

enum Flate {
    Deflate(Compress),
    Inflate { state: Decompress, finished: bool },
}

enum CodecState {
    Appending,
    Flushed,
    Errored,
}

/// The synchronous codec core. Runs in-process for light stages and
/// inside a pool worker for heavy ones; both paths share this type so
/// the externally visible semantics are identical.
pub(crate) struct EntryCodec {
    direction: Direction,
    state: CodecState,
    crypto: Option<Crypto>,
    flate: Option<Flate>,
    crc: Option<Crc32>,
    expected_crc32: u32,
}

impl EntryCodec {
    pub(crate) fn new(direction: Direction, policy: CodecPolicy) -> ZipResult<EntryCodec> {
        let crypto = match (&policy.password, direction) {
            (None, _) => None,
            (Some(password), Direction::Deflate) => Some(Crypto::Encrypt(AesEncryptor::new(
                password,
                AesMode::Aes256,
            )?)),
            (Some(password), Direction::Inflate) => {
                Some(Crypto::Decrypt(AesDecryptor::new(password, AesMode::Aes256)))
            }
        };
        let flate = match (policy.compressed, direction) {
            (false, _) => None,
            (true, Direction::Deflate) => {
                Some(Flate::Deflate(Compress::new(level_for(policy.level), false)))
            }
            (true, Direction::Inflate) => Some(Flate::Inflate {
                state: Decompress::new(false),
                finished: false,
            }),
        };
        let crc = (policy.signed && !policy.encrypted()).then(Crc32::new);
        Ok(EntryCodec {
            direction,
            state: CodecState::Appending,
            crypto,
            flate,
            crc,
            expected_crc32: policy.expected_crc32,
        })
    }

    pub(crate) fn append(&mut self, input: &[u8]) -> ZipResult<Vec<u8>> {
        if !matches!(self.state, CodecState::Appending) {
            return Err(ZipError::io_other("codec stage used after flush"));
        }
        match self.append_inner(input) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.state = CodecState::Errored;
                Err(e)
            }
        }
    }

    fn append_inner(&mut self, input: &[u8]) -> ZipResult<Vec<u8>> {
        match self.direction {
            Direction::Inflate => {
                let mut data = match &mut self.crypto {
                    Some(Crypto::Decrypt(dec)) => dec.append(input)?,
                    _ => input.to_vec(),
                };
                if let Some(Flate::Inflate { state, finished }) = &mut self.flate {
                    data = inflate_step(state, &data, FlushDecompress::None, finished)?;
                }
                if let Some(crc) = &mut self.crc {
                    crc.append(&data);
                }
                Ok(data)
            }
            Direction::Deflate => {
                if let Some(crc) = &mut self.crc {
                    crc.append(input);
                }
                let mut data = match &mut self.flate {
                    Some(Flate::Deflate(state)) => {
                        deflate_step(state, input, FlushCompress::None)?
                    }
                    _ => input.to_vec(),
                };
                if let Some(Crypto::Encrypt(enc)) = &mut self.crypto {
                    data = enc.append(&data);
                }
                Ok(data)
            }
        }
    }

    pub(crate) fn flush(&mut self) -> ZipResult<FlushOutput> {
        if !matches!(self.state, CodecState::Appending) {
            return Err(ZipError::io_other("codec stage used after flush"));
        }
        match self.flush_inner() {
            Ok(out) => {
                self.state = CodecState::Flushed;
                Ok(out)
            }
            Err(e) => {
                self.state = CodecState::Errored;
                Err(e)
            }
        }
    }

    fn flush_inner(&mut self) -> ZipResult<FlushOutput> {
        match self.direction {
            Direction::Inflate => {
                if let Some(Crypto::Decrypt(dec)) = &mut self.crypto {
                    dec.finish()?;
                }
                let mut data = Vec::new();
                if let Some(Flate::Inflate { state, finished }) = &mut self.flate {
                    data = inflate_step(state, &[], FlushDecompress::Finish, finished)?;
                }
                let crc32 = match &mut self.crc {
                    Some(crc) => {
                        crc.append(&data);
                        let value = crc.get();
                        if value != self.expected_crc32 {
                            return Err(ZipError::InvalidSignature("CRC-32 mismatch"));
                        }
                        Some(value)
                    }
                    None => None,
                };
                Ok(FlushOutput { data, crc32 })
            }
            Direction::Deflate => {
                let mut data = Vec::new();
                if let Some(Flate::Deflate(state)) = &mut self.flate {
                    data = deflate_step(state, &[], FlushCompress::Finish)?;
                }
                if let Some(Crypto::Encrypt(enc)) = &mut self.crypto {
                    data = enc.append(&data);
                    data.extend_from_slice(&enc.finish());
                }
                let crc32 = self.crc.as_ref().map(Crc32::get);
                Ok(FlushOutput { data, crc32 })
            }
        }
    }
}

fn level_for(level: u32) -> Compression {
    Compression::new(level.min(9))
}

fn deflate_step(
    compress: &mut Compress,
    mut input: &[u8],
    flush: FlushCompress,
) -> ZipResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let before_in = compress.total_in();
        out.reserve(FLATE_BUF);
        let status = compress
            .compress_vec(input, &mut out, flush)
            .map_err(|_| ZipError::io_other("deflate failure"))?;
        let used = (compress.total_in() - before_in) as usize;
        input = &input[used..];
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                if input.is_empty() && matches!(flush, FlushCompress::None) {
                    return Ok(out);
                }
            }
        }
    }
}

/// Drives the inflater over one window. Decode errors surface as
/// `invalid-signature`: a payload that no longer parses has failed its
/// integrity check from the caller's point of view.
fn inflate_step(
    decompress: &mut Decompress,
    mut input: &[u8],
    flush: FlushDecompress,
    finished: &mut bool,
) -> ZipResult<Vec<u8>> {
    let mut out = Vec::new();
    if *finished {
        return Ok(out);
    }
    loop {
        let before_in = decompress.total_in();
        let before_out = decompress.total_out();
        out.reserve(FLATE_BUF);
        let status = decompress
            .decompress_vec(input, &mut out, flush)
            .map_err(|_| ZipError::InvalidSignature("corrupted deflate stream"))?;
        let used = (decompress.total_in() - before_in) as usize;
        let produced = decompress.total_out() - before_out;
        input = &input[used..];
        match status {
            Status::StreamEnd => {
                *finished = true;
                return Ok(out);
            }
            Status::Ok | Status::BufError => {
                if input.is_empty() && matches!(flush, FlushDecompress::None) {
                    return Ok(out);
                }
                if input.is_empty() && used == 0 && produced == 0 {
                    // Finish on a stream that never terminated.
                    return Err(ZipError::InvalidSignature("truncated deflate stream"));
                }
            }
        }
    }
}

/// A live stage: either the in-process codec or a handle bound to a pool
/// worker. Same contract either way.
pub(crate) enum StageDriver {
    Local(EntryCodec),
    Worker(WorkerStage),
}

impl StageDriver {
    /// Builds a stage for `policy`, dispatching heavy codec work to the
    /// configured worker pool when one is available. Light stages (store,
    /// no encryption) always run in-process.
    pub(crate) async fn acquire(
        config: &Config,
        direction: Direction,
        policy: CodecPolicy,
    ) -> ZipResult<StageDriver> {
        if policy.needs_worker() {
            if let Some(pool) = config.effective_pool() {
                let stage = WorkerPool::acquire(&pool, direction, policy).await?;
                return Ok(StageDriver::Worker(stage));
            }
        }
        Ok(StageDriver::Local(EntryCodec::new(direction, policy)?))
    }

    pub(crate) async fn append(&mut self, data: Vec<u8>) -> ZipResult<Vec<u8>> {
        match self {
            StageDriver::Local(codec) => codec.append(&data),
            StageDriver::Worker(stage) => stage.append(data).await,
        }
    }

    pub(crate) async fn flush(&mut self) -> ZipResult<FlushOutput> {
        match self {
            StageDriver::Local(codec) => codec.flush(),
            StageDriver::Worker(stage) => stage.flush().await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy(compressed: bool, signed: bool, password: Option<&[u8]>) -> CodecPolicy {
        CodecPolicy {
            compressed,
            signed,
            password: password.map(<[u8]>::to_vec),
            expected_crc32: 0,
            level: 6,
        }
    }

    fn run_codec(codec: &mut EntryCodec, input: &[u8], window: usize) -> ZipResult<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in input.chunks(window.max(1)) {
            out.extend_from_slice(&codec.append(chunk)?);
        }
        out.extend_from_slice(&codec.flush()?.data);
        Ok(out)
    }

    #[test]
    fn deflate_inflate_round_trip() {
        let plain: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();

        let mut deflater = EntryCodec::new(Direction::Deflate, policy(true, true, None)).unwrap();
        let mut stored = Vec::new();
        for chunk in plain.chunks(997) {
            stored.extend_from_slice(&deflater.append(chunk).unwrap());
        }
        let flushed = deflater.flush().unwrap();
        stored.extend_from_slice(&flushed.data);
        let crc = flushed.crc32.unwrap();
        assert!(stored.len() < plain.len());

        let mut inflate_policy = policy(true, true, None);
        inflate_policy.expected_crc32 = crc;
        let mut inflater = EntryCodec::new(Direction::Inflate, inflate_policy).unwrap();
        let restored = run_codec(&mut inflater, &stored, 313).unwrap();
        assert_eq!(restored, plain);
    }

    #[test]
    fn store_path_reports_crc_mismatch() {
        let mut inflate_policy = policy(false, true, None);
        inflate_policy.expected_crc32 = 0xdead_beef;
        let mut codec = EntryCodec::new(Direction::Inflate, inflate_policy).unwrap();
        codec.append(b"not the signed bytes").unwrap();
        assert!(matches!(
            codec.flush(),
            Err(ZipError::InvalidSignature(_))
        ));
    }

    #[test]
    fn encrypted_deflate_round_trip() {
        let plain = b"compress me, then encrypt me, many times over and over".repeat(64);

        let mut writer_codec =
            EntryCodec::new(Direction::Deflate, policy(true, false, Some(b"pw"))).unwrap();
        let stored = run_codec(&mut writer_codec, &plain, 1024).unwrap();

        let mut reader_codec =
            EntryCodec::new(Direction::Inflate, policy(true, false, Some(b"pw"))).unwrap();
        let restored = run_codec(&mut reader_codec, &stored, 57).unwrap();
        assert_eq!(restored, plain);
    }

    #[test]
    fn encrypted_entries_do_not_sign() {
        let codec =
            EntryCodec::new(Direction::Deflate, policy(false, false, Some(b"pw"))).unwrap();
        assert!(codec.crc.is_none());
    }

    #[test]
    fn stage_is_terminal_after_flush() {
        let mut codec = EntryCodec::new(Direction::Deflate, policy(false, true, None)).unwrap();
        codec.append(b"bytes").unwrap();
        codec.flush().unwrap();
        assert!(codec.append(b"more").is_err());
        assert!(codec.flush().is_err());
    }
}
