//! Export pipeline tests against fake and store-backed chunk sources.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cohort_core::{parse_api_time, Chunk, DataStream};
use cohort_crypto::{encrypt_for_storage, StudyKey};
use cohort_export::{
    content_hash, export, ChunkSource, EncryptedStoreSource, ExportError, ExportManifest,
    ExportOptions, FailurePolicy, OutputMode, ProgressFn, MANIFEST_ENTRY,
};
use cohort_storage::ObjectStore;
use opendal::Operator;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .unwrap()
        .finish()
}

fn chunk(participant: &str, stream: DataStream, bin: &str, data: &[u8]) -> Chunk {
    Chunk {
        study_id: "s1".into(),
        participant_id: participant.into(),
        data_stream: stream,
        time_bin: parse_api_time(bin).unwrap(),
        byte_size: data.len() as u64,
        content_hash: content_hash(data),
        storage_path: format!("s1/{participant}/{stream}/{}", bin.replace(':', "-")),
    }
}

/// Serves fixed contents after a per-path delay and records fetch order.
#[derive(Default)]
struct FakeSource {
    contents: HashMap<String, (Duration, Vec<u8>)>,
    completed: Mutex<Vec<String>>,
    fetches: AtomicU64,
}

impl FakeSource {
    fn with(mut self, chunk: &Chunk, delay_ms: u64, data: &[u8]) -> Self {
        self.contents.insert(
            chunk.storage_path.clone(),
            (Duration::from_millis(delay_ms), data.to_vec()),
        );
        self
    }
}

#[async_trait]
impl ChunkSource for FakeSource {
    async fn fetch(&self, chunk: &Chunk) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (delay, data) = self
            .contents
            .get(&chunk.storage_path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such object: {}", chunk.storage_path))?;
        tokio::time::sleep(delay).await;
        self.completed
            .lock()
            .unwrap()
            .push(chunk.storage_path.clone());
        Ok(data)
    }
}

fn read_archive(bytes: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..zip.len())
        .map(|i| {
            let mut file = zip.by_index(i).unwrap();
            let mut data = Vec::new();
            file.read_to_end(&mut data).unwrap();
            (file.name().to_string(), data)
        })
        .collect()
}

#[tokio::test]
async fn test_entries_named_by_participant_stream_and_bin() {
    let gps = chunk("p1", DataStream::Gps, "2020-01-01T00:00:00", b"gps rows");
    let audio = chunk("p1", DataStream::AudioRecordings, "2020-01-01T05:00:00", b"mp4 bytes");
    let source = FakeSource::default()
        .with(&gps, 0, b"gps rows")
        .with(&audio, 0, b"mp4 bytes");

    let archive = export(
        vec![gps.clone(), audio.clone()],
        None,
        Arc::new(source),
        &ExportOptions::default(),
        None,
    )
    .await
    .unwrap();

    let entries = read_archive(&archive.bytes);
    assert_eq!(entries["p1/gps/2020-01-01T00_00_00.csv"], b"gps rows");
    assert_eq!(entries["p1/audio_recordings/2020-01-01T05_00_00.mp4"], b"mp4 bytes");

    let manifest = ExportManifest::from_json(std::str::from_utf8(&entries[MANIFEST_ENTRY]).unwrap())
        .unwrap();
    assert_eq!(manifest, archive.manifest);
    assert_eq!(manifest.get(&gps.storage_path), Some(gps.content_hash.as_str()));
    assert_eq!(archive.file_name, None);
}

#[tokio::test]
async fn test_reordered_completion_keeps_names_with_contents() {
    let a = chunk("p1", DataStream::Gps, "2020-01-01T00:00:00", b"A");
    let b = chunk("p1", DataStream::Gps, "2020-01-01T01:00:00", b"B");
    let c = chunk("p1", DataStream::Gps, "2020-01-01T02:00:00", b"C");
    let source = Arc::new(
        FakeSource::default()
            .with(&a, 60, b"A")
            .with(&b, 120, b"B")
            .with(&c, 5, b"C"),
    );

    let options = ExportOptions {
        concurrency: 3,
        ..Default::default()
    };
    let archive = export(
        vec![a.clone(), b.clone(), c.clone()],
        None,
        source.clone(),
        &options,
        None,
    )
        .await
        .unwrap();

    assert_eq!(
        *source.completed.lock().unwrap(),
        vec![c.storage_path.clone(), a.storage_path.clone(), b.storage_path.clone()]
    );

    let entries = read_archive(&archive.bytes);
    assert_eq!(entries["p1/gps/2020-01-01T00_00_00.csv"], b"A");
    assert_eq!(entries["p1/gps/2020-01-01T01_00_00.csv"], b"B");
    assert_eq!(entries["p1/gps/2020-01-01T02_00_00.csv"], b"C");
}

#[tokio::test]
async fn test_dedup_against_held_manifest() {
    let chunks: Vec<Chunk> = (0..5)
        .map(|h| {
            let data = format!("hour {h}");
            chunk("p1", DataStream::Wifi, &format!("2020-01-01T0{h}:00:00"), data.as_bytes())
        })
        .collect();
    let mut source = FakeSource::default();
    for (h, c) in chunks.iter().enumerate() {
        source = source.with(c, 0, format!("hour {h}").as_bytes());
    }
    let source = Arc::new(source);

    // client holds 0 and 1 current, 2 at a stale hash
    let mut held = ExportManifest::new();
    held.insert(chunks[0].storage_path.clone(), chunks[0].content_hash.clone());
    held.insert(chunks[1].storage_path.clone(), chunks[1].content_hash.clone());
    held.insert(chunks[2].storage_path.clone(), "stale");

    let archive = export(
        chunks.clone(),
        Some(&held),
        source.clone(),
        &ExportOptions::default(),
        None,
    )
        .await
        .unwrap();

    assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(archive.skipped, 2);
    assert_eq!(archive.manifest.len(), 3);
    assert_eq!(
        archive.manifest.get(&chunks[2].storage_path),
        Some(chunks[2].content_hash.as_str())
    );
    assert!(archive.manifest.get(&chunks[0].storage_path).is_none());
}

#[tokio::test]
async fn test_skip_policy_omits_failed_chunk() {
    let ok = chunk("p1", DataStream::Gps, "2020-01-01T00:00:00", b"ok");
    let missing = chunk("p2", DataStream::Gps, "2020-01-01T00:00:00", b"gone");
    let source = FakeSource::default().with(&ok, 0, b"ok");

    let archive = export(
        vec![ok.clone(), missing.clone()],
        None,
        Arc::new(source),
        &ExportOptions::default(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(archive.failures.len(), 1);
    assert_eq!(archive.failures[0].storage_path, missing.storage_path);

    let entries = read_archive(&archive.bytes);
    assert!(!entries.contains_key("p2/gps/2020-01-01T00_00_00.csv"));
    assert_eq!(entries.len(), 2, "one chunk plus the manifest");
    assert!(archive.manifest.get(&missing.storage_path).is_none());
}

#[tokio::test]
async fn test_abort_policy_fails_export() {
    let chunks: Vec<Chunk> = (0..4)
        .map(|h| chunk("p1", DataStream::Gps, &format!("2020-01-01T0{h}:00:00"), b"x"))
        .collect();
    // only the first chunk is retrievable
    let source = FakeSource::default().with(&chunks[0], 0, b"x");
    let options = ExportOptions {
        failure_policy: FailurePolicy::Abort { max_failures: 2 },
        ..Default::default()
    };

    let err = export(chunks, None, Arc::new(source), &options, None)
        .await
        .unwrap_err();
    match err {
        ExportError::TooManyFailures {
            failed,
            limit,
            failures,
        } => {
            assert_eq!(failed, 2);
            assert_eq!(limit, 2);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_download_mode_omits_manifest() {
    let c = chunk("p1", DataStream::Calls, "2020-01-01T00:00:00", b"calls");
    let source = FakeSource::default().with(&c, 0, b"calls");
    let options = ExportOptions {
        mode: OutputMode::Download,
        ..Default::default()
    };

    let archive = export(vec![c], None, Arc::new(source), &options, None)
        .await
        .unwrap();

    assert_eq!(archive.file_name, Some("data.zip"));
    let entries = read_archive(&archive.bytes);
    assert!(!entries.contains_key(MANIFEST_ENTRY));
    assert_eq!(entries.len(), 1);
    assert_eq!(archive.manifest.len(), 1);
}

#[tokio::test]
async fn test_empty_export_still_has_manifest() {
    let archive = export(
        Vec::new(),
        None,
        Arc::new(FakeSource::default()),
        &ExportOptions::default(),
        None,
    )
    .await
    .unwrap();
    let entries = read_archive(&archive.bytes);
    assert_eq!(entries[MANIFEST_ENTRY], b"{}");
}

#[tokio::test]
async fn test_progress_reports_every_chunk() {
    let chunks: Vec<Chunk> = (0..3)
        .map(|h| chunk("p1", DataStream::Gps, &format!("2020-01-01T0{h}:00:00"), b"x"))
        .collect();
    let mut source = FakeSource::default();
    for c in &chunks {
        source = source.with(c, 0, b"x");
    }

    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let progress: ProgressFn = Box::new(move |done, total, _path| {
        seen.lock().unwrap().push((done, total));
    });

    export(chunks, None, Arc::new(source), &ExportOptions::default(), Some(&progress))
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
}

#[tokio::test]
async fn test_encrypted_store_source_roundtrip() {
    let op = memory_operator();
    let mut rng = StdRng::seed_from_u64(21);
    let key = StudyKey::generate(&mut rng);

    let plaintext = b"timestamp,hz\n1,2\n";
    let c = chunk("p1", DataStream::Accelerometer, "2020-01-01T00:00:00", plaintext);
    op.put(&c.storage_path, encrypt_for_storage(&mut rng, &key, plaintext))
        .await
        .unwrap();

    let mut tampered = chunk("p2", DataStream::Accelerometer, "2020-01-01T00:00:00", b"other");
    op.put(&tampered.storage_path, encrypt_for_storage(&mut rng, &key, b"other"))
        .await
        .unwrap();
    tampered.content_hash = content_hash(b"something else");

    let source = EncryptedStoreSource::new(Arc::new(op), key);
    let archive = export(
        vec![c, tampered.clone()],
        None,
        Arc::new(source),
        &ExportOptions::default(),
        None,
    )
    .await
    .unwrap();

    let entries = read_archive(&archive.bytes);
    assert_eq!(entries["p1/accelerometer/2020-01-01T00_00_00.csv"], plaintext);
    assert_eq!(archive.failures.len(), 1);
    assert_eq!(archive.failures[0].storage_path, tampered.storage_path);
    assert!(archive.failures[0].reason.contains("hash mismatch"));
}
