//! Name and comment decoding: UTF-8 when flag bit 11 is set, code page
//! 437 otherwise. Raw bytes are always retained for lossless round-trips.

use zipflow::{Config, MemorySource, ZipReader};

fn in_process() -> Config {
    Config {
        use_workers: false,
        ..Config::default()
    }
}

/// Builds a one-entry archive by hand: a stored, empty entry whose name
/// and comment bytes and flags are chosen by the caller.
fn handmade_archive(name: &[u8], comment: &[u8], flags: u16) -> Vec<u8> {
    let mut archive = Vec::new();

    // local file header
    archive.extend_from_slice(b"PK\x03\x04");
    archive.extend_from_slice(&0x14u16.to_le_bytes()); // version needed
    archive.extend_from_slice(&flags.to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes()); // stored
    archive.extend_from_slice(&[0u8; 4]); // time + date
    archive.extend_from_slice(&[0u8; 4]); // crc
    archive.extend_from_slice(&0u32.to_le_bytes()); // compressed size
    archive.extend_from_slice(&0u32.to_le_bytes()); // uncompressed size
    archive.extend_from_slice(&(name.len() as u16).to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes()); // extra length
    archive.extend_from_slice(name);

    // central directory
    let central_start = archive.len();
    archive.extend_from_slice(b"PK\x01\x02");
    archive.extend_from_slice(&0x14u16.to_le_bytes()); // version made by
    archive.extend_from_slice(&0x14u16.to_le_bytes()); // version needed
    archive.extend_from_slice(&flags.to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes()); // stored
    archive.extend_from_slice(&[0u8; 4]); // time + date
    archive.extend_from_slice(&[0u8; 4]); // crc
    archive.extend_from_slice(&0u32.to_le_bytes());
    archive.extend_from_slice(&0u32.to_le_bytes());
    archive.extend_from_slice(&(name.len() as u16).to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes()); // extra length
    archive.extend_from_slice(&(comment.len() as u16).to_le_bytes());
    archive.extend_from_slice(&[0u8; 8]); // disk, attributes
    archive.extend_from_slice(&0u32.to_le_bytes()); // local header offset
    archive.extend_from_slice(name);
    archive.extend_from_slice(comment);
    let central_size = archive.len() - central_start;

    // end of central directory
    archive.extend_from_slice(b"PK\x05\x06");
    archive.extend_from_slice(&[0u8; 4]);
    archive.extend_from_slice(&1u16.to_le_bytes());
    archive.extend_from_slice(&1u16.to_le_bytes());
    archive.extend_from_slice(&(central_size as u32).to_le_bytes());
    archive.extend_from_slice(&(central_start as u32).to_le_bytes());
    archive.extend_from_slice(&0u16.to_le_bytes());
    archive
}

#[tokio::test]
async fn high_bytes_decode_through_cp437_without_bit_11() {
    let archive = handmade_archive(b"nam\x80.txt", b"\x80", 0);
    let reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let entry = &reader.entries()[0];
    assert!(!entry.is_utf8());
    assert_eq!(entry.file_name, "nam\u{00c7}.txt");
    assert_eq!(entry.file_comment, "\u{00c7}");
    // The raw bytes are retained verbatim.
    assert_eq!(entry.file_name_raw, b"nam\x80.txt");
    assert_eq!(entry.file_comment_raw, b"\x80");
}

#[tokio::test]
async fn utf8_is_used_when_bit_11_is_set() {
    let archive = handmade_archive("\u{2603}.txt".as_bytes(), "\u{00c7}".as_bytes(), 1 << 11);
    let reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let entry = &reader.entries()[0];
    assert!(entry.is_utf8());
    assert_eq!(entry.file_name, "\u{2603}.txt");
    assert_eq!(entry.file_comment, "\u{00c7}");
}
