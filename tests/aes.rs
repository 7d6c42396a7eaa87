use zipflow::{
    CompressionMethod, Config, EntryOptions, ExtractOptions, MemorySink, MemorySource, ZipError,
    ZipReader, ZipWriter,
};

const SECRET_CONTENT: &[u8] = b"Lorem ipsum dolor sit amet";
const PASSWORD: &[u8] = b"helloworld";

fn in_process() -> Config {
    Config {
        use_workers: false,
        ..Config::default()
    }
}

async fn encrypted_archive(level: u32) -> Vec<u8> {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    let mut source = MemorySource::from(SECRET_CONTENT);
    writer
        .add(
            "secret_data",
            &mut source,
            EntryOptions::default().level(level).password(PASSWORD),
        )
        .await
        .unwrap();
    writer.close(None).await.unwrap().into_inner()
}

#[tokio::test]
async fn aes256_stored_round_trip() {
    let archive = encrypted_archive(0).await;
    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();

    let entry = &reader.entries()[0];
    assert!(entry.encrypted);
    assert_eq!(entry.stored_method, CompressionMethod::Aes);
    assert_eq!(entry.compression_method, CompressionMethod::Stored);
    // AE-2 stores no CRC.
    assert_eq!(entry.crc32, 0);
    // salt + password verifier + payload + authentication code
    assert_eq!(
        entry.compressed_size,
        16 + 2 + SECRET_CONTENT.len() as u64 + 10
    );

    let content = reader
        .extract_to_vec(0, ExtractOptions::with_password(PASSWORD))
        .await
        .unwrap();
    assert_eq!(content, SECRET_CONTENT);
}

#[tokio::test]
async fn aes256_deflated_round_trip() {
    let archive = encrypted_archive(6).await;
    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    assert_eq!(
        reader.entries()[0].compression_method,
        CompressionMethod::Deflated
    );
    let content = reader
        .extract_to_vec(0, ExtractOptions::with_password(PASSWORD))
        .await
        .unwrap();
    assert_eq!(content, SECRET_CONTENT);
}

#[tokio::test]
async fn missing_password_fails_before_any_read() {
    let archive = encrypted_archive(0).await;
    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let err = reader
        .extract_to_vec(0, ExtractOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ZipError::Encrypted));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let archive = encrypted_archive(0).await;
    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let err = reader
        .extract_to_vec(0, ExtractOptions::with_password(b"letmein"))
        .await
        .unwrap_err();
    assert!(matches!(err, ZipError::InvalidPassword));
}

#[tokio::test]
async fn flipped_ciphertext_byte_fails_with_invalid_signature() {
    let mut archive = encrypted_archive(0).await;

    // Flip a ciphertext byte, past the salt and verifier.
    let payload_offset = 30 + "secret_data".len() + 11 + 16 + 2 + 3;
    archive[payload_offset] ^= 0x80;

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let err = reader
        .extract_to_vec(0, ExtractOptions::with_password(PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, ZipError::InvalidSignature(_)));
}

/// The 0x9901 extra advertising any strength other than AES-256 is
/// rejected while the directory is being parsed.
#[tokio::test]
async fn non_256_strength_is_rejected_at_open() {
    let mut archive = encrypted_archive(0).await;

    // The AES extra is tag 9901, size 7, AE-2, vendor "AE", strength 3.
    let pattern: [u8; 9] = [0x01, 0x99, 0x07, 0x00, 0x02, 0x00, 0x41, 0x45, 0x03];
    let mut patched = 0;
    let mut i = 0;
    while i + pattern.len() <= archive.len() {
        if archive[i..i + pattern.len()] == pattern {
            archive[i + 8] = 0x02;
            patched += 1;
            i += pattern.len();
        } else {
            i += 1;
        }
    }
    // Once in the local header, once in the central directory.
    assert_eq!(patched, 2);

    let err = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap_err();
    assert!(matches!(err, ZipError::UnsupportedEncryption(_)));
}

#[tokio::test]
async fn descriptor_crc_is_zero_for_encrypted_entries() {
    let archive = encrypted_archive(0).await;

    // local header + name + AES extra, then the payload span, then the
    // descriptor: signature and a zero CRC field.
    let payload_len = 16 + 2 + SECRET_CONTENT.len() + 10;
    let descriptor_offset = 30 + "secret_data".len() + 11 + payload_len;
    assert_eq!(
        &archive[descriptor_offset..descriptor_offset + 4],
        b"PK\x07\x08"
    );
    assert_eq!(&archive[descriptor_offset + 4..descriptor_offset + 8], &[0u8; 4]);
}
