use zipflow::{
    CompressionMethod, Config, EntryOptions, ExtractOptions, MemorySink, MemorySource, ZipError,
    ZipReader, ZipWriter,
};

const LOREM_IPSUM: &[u8] = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit. In tellus elit, tristique vitae mattis egestas, ultricies vitae risus. Quisque sit amet quam ut urna aliquet
molestie. Proin blandit ornare dui, a tempor nisl accumsan in. Praesent a consequat felis. Morbi metus diam, auctor in auctor vel, feugiat id odio. Curabitur ex ex,
dictum quis auctor quis, suscipit id lorem. Aliquam vestibulum dolor nec enim vehicula, porta tristique augue tincidunt. Vivamus ut gravida est. Sed pellentesque, dolor
vitae tristique consectetur, neque lectus pulvinar dui, sed feugiat purus diam id lectus. Class aptent taciti sociosqu ad litora torquent per conubia nostra, per
inceptos himenaeos. Maecenas feugiat velit in ex ultrices scelerisque id id neque.
";

fn in_process() -> Config {
    Config {
        use_workers: false,
        ..Config::default()
    }
}

async fn roundtrip_one(payload: &[u8], options: EntryOptions, password: Option<&[u8]>) -> Vec<u8> {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    let mut source = MemorySource::from(payload);
    writer.add("file.bin", &mut source, options).await.unwrap();
    let archive = writer.close(None).await.unwrap().into_inner();

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let options = match password {
        Some(password) => ExtractOptions::with_password(password),
        None => ExtractOptions::default(),
    };
    reader.extract_to_vec(0, options).await.unwrap()
}

// This test asserts that after creating a zip file, then reading its
// contents back out, the extracted data will always be exactly the same
// as the original data, for every compression/encryption policy.
#[tokio::test]
async fn round_trip_every_policy() {
    for compressed in [false, true] {
        for encrypted in [false, true] {
            let mut options = EntryOptions::default().level(if compressed { 6 } else { 0 });
            if encrypted {
                options = options.password(b"top secret");
            }
            let restored = roundtrip_one(
                LOREM_IPSUM,
                options,
                encrypted.then_some(&b"top secret"[..]),
            )
            .await;
            assert_eq!(restored, LOREM_IPSUM, "compressed={compressed} encrypted={encrypted}");
        }
    }
}

#[tokio::test]
async fn round_trip_through_the_worker_pool() {
    let config = Config {
        max_workers: 2,
        chunk_size: 128,
        ..Config::default()
    };
    let writer = ZipWriter::with_config(MemorySink::new(), config.clone());
    let mut source = MemorySource::from(LOREM_IPSUM);
    writer
        .add("lorem.txt", &mut source, EntryOptions::default())
        .await
        .unwrap();
    let archive = writer.close(None).await.unwrap().into_inner();

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), config)
        .await
        .unwrap();
    let restored = reader.extract_to_vec(0, Default::default()).await.unwrap();
    assert_eq!(restored, LOREM_IPSUM);
}

#[tokio::test]
async fn archive_structure_is_consistent() {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    let mut source = MemorySource::from(&b"Hello"[..]);
    writer
        .add("hello.txt", &mut source, EntryOptions::default().level(0))
        .await
        .unwrap();
    let archive = writer.close(None).await.unwrap().into_inner();

    // EOCD sits at the very end; its directory span ends where it starts.
    let eocd_offset = archive.len() - 22;
    assert_eq!(&archive[eocd_offset..eocd_offset + 4], b"PK\x05\x06");
    let cd_size = u32::from_le_bytes(archive[eocd_offset + 12..eocd_offset + 16].try_into().unwrap());
    let cd_offset = u32::from_le_bytes(archive[eocd_offset + 16..eocd_offset + 20].try_into().unwrap());
    assert_eq!((cd_offset + cd_size) as usize, eocd_offset);

    // The local region carries header, payload and a signed descriptor.
    assert_eq!(&archive[..4], b"PK\x03\x04");
    let descriptor_offset = 30 + "hello.txt".len() + 5;
    assert_eq!(
        &archive[descriptor_offset..descriptor_offset + 4],
        b"PK\x07\x08"
    );

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let entry = &reader.entries()[0];
    assert_eq!(entry.file_name, "hello.txt");
    assert_eq!(entry.crc32, 0xf7d18982);
    assert_eq!(entry.uncompressed_size, 5);
    assert_eq!(entry.compressed_size, 5);
    assert_eq!(entry.compression_method, CompressionMethod::Stored);
    let restored = reader.extract_to_vec(0, Default::default()).await.unwrap();
    assert_eq!(restored, b"Hello");
}

#[tokio::test]
async fn directories_and_utf8_names_survive() {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    writer
        .add_directory("test/", EntryOptions::default())
        .await
        .unwrap();
    let mut snowman = MemorySource::from(&b"Hello, World!\n"[..]);
    writer
        .add("test/\u{2603}.txt", &mut snowman, EntryOptions::default())
        .await
        .unwrap();
    let archive = writer.close(None).await.unwrap().into_inner();

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    assert_eq!(reader.len(), 2);

    let dir = &reader.entries()[0];
    assert!(dir.is_dir());
    assert_eq!(dir.file_name, "test/");
    assert_eq!(dir.uncompressed_size, 0);

    let file = reader.by_name("test/\u{2603}.txt").expect("snowman entry");
    assert!(file.is_utf8());
    assert_eq!(file.file_name_raw, "test/\u{2603}.txt".as_bytes());
    let index = reader.index_of("test/\u{2603}.txt").unwrap();
    let restored = reader.extract_to_vec(index, Default::default()).await.unwrap();
    assert_eq!(restored, b"Hello, World!\n");
}

#[tokio::test]
async fn archive_comment_round_trips() {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    let archive = writer
        .close(Some(b"made by zipflow"))
        .await
        .unwrap()
        .into_inner();

    let reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    assert_eq!(reader.comment(), "made by zipflow");
}

#[tokio::test]
async fn progress_is_monotone_and_complete() {
    let payload = vec![0xa5u8; 10_000];
    let config = Config {
        chunk_size: 256,
        use_workers: false,
        ..Config::default()
    };

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let writer = ZipWriter::with_config(MemorySink::new(), config.clone());
    let mut source = MemorySource::new(payload.clone());
    let sink_seen = std::sync::Arc::clone(&seen);
    writer
        .add(
            "big.bin",
            &mut source,
            EntryOptions::default().progress(Box::new(move |processed, total| {
                sink_seen.lock().unwrap().push((processed, total));
            })),
        )
        .await
        .unwrap();
    let archive = writer.close(None).await.unwrap().into_inner();

    let ticks = seen.lock().unwrap().clone();
    assert!(!ticks.is_empty());
    assert!(ticks.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(ticks.last(), Some(&(10_000, 10_000)));

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), config)
        .await
        .unwrap();
    let restored = reader.extract_to_vec(0, Default::default()).await.unwrap();
    assert_eq!(restored, payload);
}

#[tokio::test]
async fn tampered_signed_payload_fails_with_invalid_signature() {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    let mut source = MemorySource::from(LOREM_IPSUM);
    writer
        .add("signed.txt", &mut source, EntryOptions::default().level(0))
        .await
        .unwrap();
    let mut archive = writer.close(None).await.unwrap().into_inner();

    // Flip one payload byte inside the stored (uncompressed) span.
    let payload_offset = 30 + "signed.txt".len() + 10;
    archive[payload_offset] ^= 0x40;

    let mut reader = ZipReader::open_with_config(MemorySource::new(archive), in_process())
        .await
        .unwrap();
    let err = reader
        .extract_to_vec(0, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ZipError::InvalidSignature(_)));
}

#[tokio::test]
async fn tampered_deflate_payload_fails_with_invalid_signature() {
    let writer = ZipWriter::with_config(MemorySink::new(), in_process());
    let mut source = MemorySource::from(LOREM_IPSUM);
    writer
        .add("signed.txt", &mut source, EntryOptions::default())
        .await
        .unwrap();
    let archive = writer.close(None).await.unwrap().into_inner();

    for flip in [10usize, 100, 200] {
        let mut tampered = archive.clone();
        let payload_offset = 30 + "signed.txt".len() + flip;
        tampered[payload_offset] ^= 0x01;

        let mut reader =
            ZipReader::open_with_config(MemorySource::new(tampered), in_process())
                .await
                .unwrap();
        let err = reader
            .extract_to_vec(0, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ZipError::InvalidSignature(_)), "flip at +{flip}");
    }
}
