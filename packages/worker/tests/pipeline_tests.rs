//! End-to-end pipeline tests: a live worker loop driving FULL_ETL jobs
//! against mock stages, plus the Postgres document store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use etl::embed::Embedder;
use etl::store::{DocumentMeta, DocumentStore, PostgresDocumentStore};
use etl::testing::{FakeEmbedder, MemoryDocumentStore, MockFetcher};
use worker_core::jobs::{
    CancelOutcome, EnqueueOptions, JobAdmin, JobKind, JobStatus, JobWorker, JobWorkerConfig,
    PipelineDriver, PostgresJobStore,
};

use common::harness;

const PAGE_URL: &str = "https://example.com/about";
const PAGE_HTML: &str = r#"
    <html>
      <head><title>About</title><script>ignored();</script></head>
      <body>
        <h1>About us</h1>
        <p>We index documents for retrieval. Every page is fetched, parsed,
           chunked, embedded, and stored so that downstream search can find
           it again. This paragraph exists to produce enough text for more
           than one chunk when the chunk size is small.</p>
      </body>
    </html>
"#;

/// Worker configuration tuned for fast tests.
fn test_config() -> JobWorkerConfig {
    JobWorkerConfig {
        poll_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(200),
        lease_duration: Duration::from_secs(10),
        zombie_grace: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
        retry_backoff_base: Duration::from_secs(1),
        retry_backoff_cap: Duration::from_secs(5),
        max_concurrent_jobs: 2,
        ..JobWorkerConfig::default()
    }
}

fn driver_with(fetcher: MockFetcher, documents: Arc<MemoryDocumentStore>) -> PipelineDriver {
    PipelineDriver::new(Arc::new(fetcher), Arc::new(FakeEmbedder::new(8)), documents)
        .with_chunking(etl::ChunkConfig::default().with_size(120).with_overlap(20))
}

#[tokio::test]
async fn full_etl_job_runs_to_completion() {
    let store = PostgresJobStore::new(harness::test_pool().await);
    let documents = Arc::new(MemoryDocumentStore::new());
    let fetcher = MockFetcher::new().with_page(PAGE_URL, PAGE_HTML);

    let worker = JobWorker::with_config(
        store.clone(),
        driver_with(fetcher, documents.clone()),
        test_config(),
    );
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    let admin = JobAdmin::new(store.clone());
    let job_id = admin
        .enqueue(
            EnqueueOptions::builder()
                .kind(JobKind::FullEtl)
                .input(json!({"url": PAGE_URL}))
                .build(),
        )
        .await
        .unwrap();

    let job = harness::wait_for_status(
        &store,
        job_id,
        JobStatus::Completed,
        Duration::from_secs(15),
    )
    .await;

    let output = job.output.expect("completed job has output");
    assert!(output["chunk_count"].as_u64().unwrap() > 0);
    assert!(output["document_id"].is_string());
    assert!(job.worker_id.is_none());
    assert!(job.lease_expires_at.is_none());
    assert!(job.completed_at.is_some());
    assert!(job.last_error.is_none());

    assert_eq!(documents.upsert_count(), 1);
    let stored = documents.get(PAGE_URL).unwrap();
    assert!(stored.chunks.len() > 1);
    assert_eq!(stored.chunks.len(), stored.vectors.len());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_stops_a_running_job_at_the_next_checkpoint() {
    let store = PostgresJobStore::new(harness::test_pool().await);
    let documents = Arc::new(MemoryDocumentStore::new());
    // Fetch takes 2s, so cancellation lands while the stage is in flight
    let fetcher = MockFetcher::new()
        .with_page(PAGE_URL, PAGE_HTML)
        .with_delay(Duration::from_secs(2));

    let worker = JobWorker::with_config(
        store.clone(),
        driver_with(fetcher, documents.clone()),
        test_config(),
    );
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    let admin = JobAdmin::new(store.clone());
    let job_id = admin
        .enqueue(
            EnqueueOptions::builder()
                .kind(JobKind::FullEtl)
                .input(json!({"url": PAGE_URL}))
                .build(),
        )
        .await
        .unwrap();

    harness::wait_for_status(&store, job_id, JobStatus::Running, Duration::from_secs(10)).await;

    assert_eq!(admin.cancel(job_id).await.unwrap(), CancelOutcome::Cancelled);

    // Cancellation is the authoritative write; the row is terminal now
    let job = store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    // Give the driver time to pass its post-fetch checkpoint and unwind:
    // no upsert may happen after the cancel
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(documents.upsert_count(), 0);

    let job = store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.worker_id.is_none());
    assert!(job.lease_expires_at.is_none());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn transient_fetch_failure_retries_with_backoff_then_completes() {
    let store = PostgresJobStore::new(harness::test_pool().await);
    let documents = Arc::new(MemoryDocumentStore::new());
    let fetcher = MockFetcher::new()
        .with_page(PAGE_URL, PAGE_HTML)
        .failing_first(1);

    let worker = JobWorker::with_config(
        store.clone(),
        driver_with(fetcher, documents.clone()),
        test_config(),
    );
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    let admin = JobAdmin::new(store.clone());
    let enqueued_at = Utc::now();
    let job_id = admin
        .enqueue(
            EnqueueOptions::builder()
                .kind(JobKind::FullEtl)
                .input(json!({"url": PAGE_URL}))
                .max_retries(2)
                .build(),
        )
        .await
        .unwrap();

    // First attempt times out and lands in retrying with ~base backoff
    let retrying = harness::wait_for_status(
        &store,
        job_id,
        JobStatus::Retrying,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(retrying.retry_count, 1);
    assert!(retrying.last_error.unwrap().contains("timeout"));
    let scheduled_at = retrying.scheduled_at.expect("backoff scheduled");
    let delay = scheduled_at - enqueued_at;
    assert!(delay >= chrono::Duration::zero());
    assert!(delay <= chrono::Duration::seconds(5));

    // After the backoff elapses the retry succeeds
    let job = harness::wait_for_status(
        &store,
        job_id,
        JobStatus::Completed,
        Duration::from_secs(20),
    )
    .await;
    assert_eq!(job.retry_count, 1);
    assert_eq!(documents.upsert_count(), 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn bad_input_fails_without_retries() {
    let store = PostgresJobStore::new(harness::test_pool().await);
    let documents = Arc::new(MemoryDocumentStore::new());

    let worker = JobWorker::with_config(
        store.clone(),
        driver_with(MockFetcher::new(), documents.clone()),
        test_config(),
    );
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    let admin = JobAdmin::new(store.clone());
    let job_id = admin
        .enqueue(
            EnqueueOptions::builder()
                .kind(JobKind::FullEtl)
                .input(json!({"not_url": true}))
                .build(),
        )
        .await
        .unwrap();

    let job =
        harness::wait_for_status(&store, job_id, JobStatus::Failed, Duration::from_secs(10)).await;
    assert_eq!(job.retry_count, 0);
    assert!(job.last_error.unwrap().contains("bad job input"));
    assert_eq!(documents.upsert_count(), 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn empty_page_completes_with_zero_chunks() {
    let store = PostgresJobStore::new(harness::test_pool().await);
    let documents = Arc::new(MemoryDocumentStore::new());
    let fetcher = MockFetcher::new().with_page(PAGE_URL, "");

    let worker = JobWorker::with_config(
        store.clone(),
        driver_with(fetcher, documents.clone()),
        test_config(),
    );
    let shutdown = worker.shutdown_token();
    let handle = tokio::spawn(worker.run());

    let admin = JobAdmin::new(store.clone());
    let job_id = admin
        .enqueue(
            EnqueueOptions::builder()
                .kind(JobKind::FullEtl)
                .input(json!({"url": PAGE_URL}))
                .build(),
        )
        .await
        .unwrap();

    let job = harness::wait_for_status(
        &store,
        job_id,
        JobStatus::Completed,
        Duration::from_secs(15),
    )
    .await;
    assert_eq!(job.output.unwrap()["chunk_count"], json!(0));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn two_workers_split_the_queue_without_duplicates() {
    let store = PostgresJobStore::new(harness::test_pool().await);
    let documents = Arc::new(MemoryDocumentStore::new());

    let urls: Vec<String> = (0..6).map(|i| format!("https://example.com/p{i}")).collect();
    let mut fetcher_a = MockFetcher::new();
    let mut fetcher_b = MockFetcher::new();
    for url in &urls {
        fetcher_a = fetcher_a.with_page(url, PAGE_HTML);
        fetcher_b = fetcher_b.with_page(url, PAGE_HTML);
    }

    let worker_a = JobWorker::with_config(
        store.clone(),
        driver_with(fetcher_a, documents.clone()),
        test_config(),
    );
    let worker_b = JobWorker::with_config(
        store.clone(),
        driver_with(fetcher_b, documents.clone()),
        test_config(),
    );
    let shutdown_a = worker_a.shutdown_token();
    let shutdown_b = worker_b.shutdown_token();
    let handle_a = tokio::spawn(worker_a.run());
    let handle_b = tokio::spawn(worker_b.run());

    let admin = JobAdmin::new(store.clone());
    let mut job_ids = Vec::new();
    for url in &urls {
        job_ids.push(
            admin
                .enqueue(
                    EnqueueOptions::builder()
                        .kind(JobKind::FullEtl)
                        .input(json!({"url": url}))
                        .build(),
                )
                .await
                .unwrap(),
        );
    }

    for job_id in &job_ids {
        harness::wait_for_status(&store, *job_id, JobStatus::Completed, Duration::from_secs(30))
            .await;
    }

    // Each document upserted exactly once: no double dispatch
    assert_eq!(documents.upsert_count(), urls.len());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed as usize, urls.len());

    shutdown_a.cancel();
    shutdown_b.cancel();
    handle_a.await.unwrap().unwrap();
    handle_b.await.unwrap().unwrap();
}

#[tokio::test]
async fn postgres_document_store_replaces_chunks_on_reupsert() {
    let pool = harness::test_pool().await;
    let store = PostgresDocumentStore::from_pool(pool, 8).await.unwrap();
    let embedder = FakeEmbedder::new(8);

    let meta = DocumentMeta {
        source_url: "https://example.com/doc".into(),
        content_type: Some("text/html".into()),
    };

    let chunks: Vec<String> = vec!["alpha".into(), "beta".into(), "gamma".into()];
    let vectors = embedder.embed_batch(&chunks).await.unwrap();
    let first_id = store.upsert_document(&meta, &chunks, &vectors).await.unwrap();
    assert_eq!(store.chunk_count(first_id).await.unwrap(), 3);

    // Re-upsert with fewer chunks: same document id, chunk set replaced
    let chunks: Vec<String> = vec!["delta".into()];
    let vectors = embedder.embed_batch(&chunks).await.unwrap();
    let second_id = store.upsert_document(&meta, &chunks, &vectors).await.unwrap();

    assert_eq!(first_id, second_id);
    assert_eq!(store.chunk_count(first_id).await.unwrap(), 1);

    let record = store
        .find_by_url("https://example.com/doc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.chunk_count, 1);
}

#[tokio::test]
async fn postgres_document_store_rejects_mismatched_vectors() {
    let pool = harness::test_pool().await;
    let store = PostgresDocumentStore::from_pool(pool, 8).await.unwrap();

    let meta = DocumentMeta {
        source_url: "https://example.com/bad".into(),
        content_type: None,
    };

    let err = store
        .upsert_document(&meta, &["one".into(), "two".into()], &[vec![0.0; 8]])
        .await
        .unwrap_err();
    assert!(matches!(err, etl::StoreError::Mismatch { .. }));

    // Nothing was persisted
    assert!(store
        .find_by_url("https://example.com/bad")
        .await
        .unwrap()
        .is_none());
}
