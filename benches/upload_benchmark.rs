//! Upload benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::Path;
use std::sync::Arc;
use tus_uploadr::config::TusConfig;
use tus_uploadr::protocol::UploadMetadata;
use tus_uploadr::store::FileMetadataStore;
use tus_uploadr::upload::{CompletionHook, HookError, SessionManager};

const METADATA_HEADER: &str =
    "name bXlfdmFjYXRpb25fcGhvdG8uanBn,filetype aW1hZ2UvanBlZw==,is_confidential";

fn benchmark_metadata_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata");

    group.bench_function("parse", |b| {
        b.iter(|| UploadMetadata::parse(black_box(METADATA_HEADER)))
    });

    let parsed = UploadMetadata::parse(METADATA_HEADER).unwrap();
    group.bench_function("encode", |b| b.iter(|| black_box(&parsed).encode()));

    group.finish();
}

fn benchmark_append_sizes(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let config = TusConfig {
        storage_dir: dir.path().to_path_buf(),
        ..TusConfig::default()
    };
    let store = Arc::new(FileMetadataStore::new(dir.path()));
    let hook: Arc<dyn CompletionHook> =
        Arc::new(|_: &Path, _: &UploadMetadata| -> Result<(), HookError> { Ok(()) });
    let sessions = Arc::new(SessionManager::new(&config, store, hook));

    let mut group = c.benchmark_group("append_chunk");

    for size in [1024usize, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let data = Bytes::from(vec![0u8; size]);
            b.to_async(&runtime).iter(|| {
                let sessions = Arc::clone(&sessions);
                let data = data.clone();
                async move {
                    let status = sessions
                        .create_session(Some(size as u64), UploadMetadata::default())
                        .await
                        .unwrap();
                    let payload = futures::stream::iter(vec![Ok(data)]);
                    sessions
                        .append_chunk(&status.id, 0, payload, None)
                        .await
                        .unwrap();
                    sessions.delete_session(&status.id).await.unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_metadata_codec, benchmark_append_sizes);
criterion_main!(benches);
