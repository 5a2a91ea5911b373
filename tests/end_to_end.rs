//! Drives the store → chunk → upload path against a real `wiremock` server,
//! covering end-to-end scenario S1 from spec.md §8 (happy path) and the
//! dedup scenario S2.

use std::sync::{Arc, Mutex};

use chunking::ChunkerConfig;
use sample::{Sample, ValueKind};
use store::QueueStore;
use tokio_util::sync::CancellationToken;
use uploader::{ChunkOutcome, Uploader, UploaderConfig};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

fn numeric(name: &str, device_id: &str, ts_ms: i64, value: f64) -> Sample {
    Sample::new(name, device_id, ts_ms, ValueKind::Numeric(value), []).unwrap()
}

/// Captures each gzip-decompressed request body so the test can assert on
/// the wire content the server actually received.
struct BodyCapturingResponder {
    bodies: Arc<Mutex<Vec<String>>>,
}

impl Respond for BodyCapturingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut decoder = flate2::read::GzDecoder::new(&request.body[..]);
        let mut text = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut text).unwrap();
        self.bodies.lock().unwrap().push(text);
        ResponseTemplate::new(204)
    }
}

#[tokio::test]
async fn happy_path_uploads_and_marks_rows_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

    store
        .store_batch(vec![
            numeric("cpu.temperature", "d1", 1_700_000_000_000, 45.0),
            numeric("memory.used_bytes", "d1", 1_700_000_001_000, 1024.0),
        ])
        .await
        .unwrap();
    assert_eq!(store.pending_count().await.unwrap(), 2);

    let server = MockServer::start().await;
    let seen_bodies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(BodyCapturingResponder { bodies: Arc::clone(&seen_bodies) })
        .mount(&server)
        .await;

    let rows = store.query_unuploaded(2500).await.unwrap();
    let chunks = chunking::build_chunks(rows, &ChunkerConfig::default()).unwrap();
    assert_eq!(chunks.len(), 1);

    let uploader_config = UploaderConfig {
        url: format!("{}/ingest", server.uri()),
        device_id: "d1".to_string(),
        ..UploaderConfig::default()
    };
    let uploader = Uploader::new(uploader_config).unwrap();

    let cancel = CancellationToken::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let outcome = uploader.upload_chunk(chunk, index, &cancel).await;
        assert_eq!(outcome, ChunkOutcome::Uploaded);
        store.mark_uploaded(chunk.row_ids.clone()).await.unwrap();
    }

    assert_eq!(store.pending_count().await.unwrap(), 0);

    let body = seen_bodies.lock().unwrap();
    assert_eq!(body.len(), 1);
    let lines: Vec<&str> = body[0].lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|l| l.contains("cpu_temperature_celsius")));
    assert!(lines.iter().any(|l| l.contains("memory_used_bytes")));
}

#[tokio::test]
async fn duplicate_store_batches_do_not_inflate_pending_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

    let batch = vec![
        numeric("cpu.temperature", "d1", 1_700_000_000_000, 45.0),
        numeric("memory.used", "d1", 1_700_000_001_000, 1024.0),
    ];

    store.store_batch(batch.clone()).await.unwrap();
    store.store_batch(batch).await.unwrap();

    assert_eq!(store.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn text_samples_are_stored_but_never_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

    let mut batch: Vec<Sample> = (0..100)
        .map(|i| numeric("cpu.load", "d1", 1_700_000_000_000 + i, i as f64))
        .collect();
    batch.extend((0..2500).map(|i| Sample::new("log.event", "d1", 1_700_000_000_000 + i, ValueKind::Text("boot".to_string()), []).unwrap()));
    store.store_batch(batch).await.unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/ingest")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

    let rows = store.query_unuploaded(2500).await.unwrap();
    assert_eq!(rows.len(), 100);

    let chunks = chunking::build_chunks(rows, &ChunkerConfig::default()).unwrap();
    let uploader = Uploader::new(UploaderConfig {
        url: format!("{}/ingest", server.uri()),
        device_id: "d1".to_string(),
        ..UploaderConfig::default()
    })
    .unwrap();

    let cancel = CancellationToken::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let outcome = uploader.upload_chunk(chunk, index, &cancel).await;
        assert_eq!(outcome, ChunkOutcome::Uploaded);
        store.mark_uploaded(chunk.row_ids.clone()).await.unwrap();
    }

    assert_eq!(store.pending_count().await.unwrap(), 0);
}
