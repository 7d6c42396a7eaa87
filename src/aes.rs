//! WinZip-AES (AE-2) payload encryption and decryption.
//!
//! An AES encrypted payload starts with a salt, whose length depends on
//! the AES strength, followed by a 2 byte password verification value,
//! then the ciphertext, and lastly a 10 byte authentication code over the
//! ciphertext. AE-2 stores no CRC; the authentication code is the only
//! integrity check.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::result::{ZipError, ZipResult};
use crate::types::AesMode;

/// The length of the password verification value in bytes
const PWD_VERIFY_LENGTH: usize = 2;
/// The length of the authentication code in bytes
const AUTH_CODE_LENGTH: usize = 10;
/// The number of iterations used with PBKDF2
const ITERATION_COUNT: u32 = 1000;
/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

type HmacSha1 = Hmac<Sha1>;

/// An AES-CTR key stream generator.
///
/// Implements the slightly non-standard AES-CTR variant used by WinZip
/// AES encryption: no nonce, and a little-endian counter starting at 1
/// rather than the NIST big-endian layout.
struct AesCtrKeyStream {
    counter: u128,
    cipher: aes::Aes256,
    buffer: [u8; BLOCK_SIZE],
    pos: usize,
}

impl AesCtrKeyStream {
    fn new(key: &[u8]) -> ZipResult<AesCtrKeyStream> {
        let cipher = aes::Aes256::new_from_slice(key)
            .map_err(|_| ZipError::UnsupportedEncryption("bad AES key length"))?;
        Ok(AesCtrKeyStream {
            counter: 1,
            cipher,
            buffer: [0u8; BLOCK_SIZE],
            pos: BLOCK_SIZE,
        })
    }

    /// XORs `data` in place with the next bytes of the key stream.
    /// Encryption and decryption are the same operation.
    fn xor(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.pos == BLOCK_SIZE {
                // AES block size is 16 bytes, same as u128.
                let mut block = GenericArray::clone_from_slice(&self.counter.to_le_bytes());
                self.cipher.encrypt_block(&mut block);
                self.buffer.copy_from_slice(&block);
                self.counter += 1;
                self.pos = 0;
            }
            *byte ^= self.buffer[self.pos];
            self.pos += 1;
        }
    }
}

struct DerivedKeys {
    keystream: AesCtrKeyStream,
    hmac: HmacSha1,
    verifier: [u8; PWD_VERIFY_LENGTH],
}

/// Derives the cipher key, authentication key and password verification
/// value with PBKDF2-HMAC-SHA1.
fn derive_keys(password: &[u8], salt: &[u8], mode: AesMode) -> ZipResult<DerivedKeys> {
    let key_length = mode.key_length();
    let mut derived = vec![0u8; 2 * key_length + PWD_VERIFY_LENGTH];
    pbkdf2::pbkdf2::<HmacSha1>(password, salt, ITERATION_COUNT, &mut derived);

    let keystream = AesCtrKeyStream::new(&derived[..key_length])?;
    let hmac = <HmacSha1 as Mac>::new_from_slice(&derived[key_length..2 * key_length])
        .map_err(|_| ZipError::UnsupportedEncryption("bad HMAC key length"))?;
    let mut verifier = [0u8; PWD_VERIFY_LENGTH];
    verifier.copy_from_slice(&derived[2 * key_length..]);
    Ok(DerivedKeys {
        keystream,
        hmac,
        verifier,
    })
}

/// Streaming encryptor for the write path.
pub(crate) struct AesEncryptor {
    keys: DerivedKeys,
    /// salt || verifier, emitted ahead of the first ciphertext bytes
    header: Option<Vec<u8>>,
}

impl AesEncryptor {
    pub(crate) fn new(password: &[u8], mode: AesMode) -> ZipResult<AesEncryptor> {
        let mut salt = vec![0u8; mode.salt_length()];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(password, mode, salt)
    }

    fn with_salt(password: &[u8], mode: AesMode, salt: Vec<u8>) -> ZipResult<AesEncryptor> {
        let keys = derive_keys(password, &salt, mode)?;
        let mut header = salt;
        header.extend_from_slice(&keys.verifier);
        Ok(AesEncryptor {
            keys,
            header: Some(header),
        })
    }

    pub(crate) fn append(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = self.header.take().unwrap_or_default();
        let start = out.len();
        out.extend_from_slice(input);
        self.keys.keystream.xor(&mut out[start..]);
        self.keys.hmac.update(&out[start..]);
        out
    }

    /// Emits any unsent header plus the authentication code.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        let mut out = self.header.take().unwrap_or_default();
        let tag = self.keys.hmac.clone().finalize().into_bytes();
        out.extend_from_slice(&tag[..AUTH_CODE_LENGTH]);
        out
    }
}

/// Streaming decryptor for the read path.
///
/// Holds back the trailing authentication code while bytes flow, derives
/// keys once the salt and verification value have arrived, and checks the
/// code on `finish`.
pub(crate) struct AesDecryptor {
    password: Vec<u8>,
    mode: AesMode,
    keys: Option<DerivedKeys>,
    pending: Vec<u8>,
}

impl AesDecryptor {
    pub(crate) fn new(password: &[u8], mode: AesMode) -> AesDecryptor {
        AesDecryptor {
            password: password.to_vec(),
            mode,
            keys: None,
            pending: Vec::new(),
        }
    }

    pub(crate) fn append(&mut self, input: &[u8]) -> ZipResult<Vec<u8>> {
        self.pending.extend_from_slice(input);

        if self.keys.is_none() {
            let header_length = self.mode.salt_length() + PWD_VERIFY_LENGTH;
            if self.pending.len() < header_length {
                return Ok(Vec::new());
            }
            let salt: Vec<u8> = self.pending.drain(..self.mode.salt_length()).collect();
            let stored: Vec<u8> = self.pending.drain(..PWD_VERIFY_LENGTH).collect();
            let keys = derive_keys(&self.password, &salt, self.mode)?;
            if stored != keys.verifier {
                return Err(ZipError::InvalidPassword);
            }
            self.keys = Some(keys);
        }

        if self.pending.len() <= AUTH_CODE_LENGTH {
            return Ok(Vec::new());
        }
        let take = self.pending.len() - AUTH_CODE_LENGTH;
        let mut out: Vec<u8> = self.pending.drain(..take).collect();
        let keys = self.keys.as_mut().expect("keys derived above");
        keys.hmac.update(&out);
        keys.keystream.xor(&mut out);
        Ok(out)
    }

    /// Verifies the authentication code against the ciphertext seen so
    /// far.
    pub(crate) fn finish(&mut self) -> ZipResult<()> {
        let keys = match &self.keys {
            Some(keys) => keys,
            None => return Err(ZipError::BadFormat("truncated AES payload")),
        };
        if self.pending.len() != AUTH_CODE_LENGTH {
            return Err(ZipError::BadFormat("truncated AES payload"));
        }
        keys.hmac
            .clone()
            .verify_truncated_left(&self.pending)
            .map_err(|_| ZipError::InvalidSignature("AES authentication code mismatch"))
    }
}
