//! Pull-all job against a mocked backend

use std::sync::Arc;
use std::time::Duration;

use hearth::backend::{DualTimeoutTransport, OllamaClient};
use hearth::config::PullConfig;
use hearth::progress::{BulkPullEvent, BulkPullJob, BulkPullReport, ItemStatus};
use hearth::stream::StreamRelay;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PULL_OK: &str = concat!(
    "{\"status\":\"pulling manifest\"}\n",
    "{\"status\":\"verifying sha256 digest\"}\n",
    "{\"status\":\"success\"}\n",
);

fn job_for(uri: &str, concurrency: usize) -> BulkPullJob {
    let transport = Arc::new(
        DualTimeoutTransport::with_timeouts(uri, Duration::from_secs(5), Duration::from_secs(30))
            .unwrap(),
    );
    BulkPullJob::new(
        OllamaClient::new(Arc::clone(&transport)),
        StreamRelay::new(transport),
        &PullConfig {
            concurrency,
            ..PullConfig::default()
        },
    )
}

async fn backend_with_models(names: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    let models: Vec<_> = names.iter().map(|n| json!({ "name": n })).collect();

    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": models })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .and(body_partial_json(json!({"model": "b"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "disk full"})))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PULL_OK, "application/x-ndjson"))
        .mount(&server)
        .await;

    server
}

async fn run_job(
    job: &BulkPullJob,
    cancel: &CancellationToken,
) -> (hearth::Result<BulkPullReport>, Vec<BulkPullEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let result = tokio::time::timeout(Duration::from_secs(10), job.run(&tx, cancel))
        .await
        .expect("pull-all job did not finish");
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

fn without_progress(events: &[BulkPullEvent]) -> Vec<BulkPullEvent> {
    events
        .iter()
        .filter(|e| !matches!(e, BulkPullEvent::ItemProgress { .. }))
        .cloned()
        .collect()
}

fn finished_models(events: &[BulkPullEvent]) -> Vec<(String, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            BulkPullEvent::ItemFinished { model, current, .. } => Some((model.clone(), *current)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_failed_item_does_not_stop_the_job() {
    let server = backend_with_models(&["a", "b", "c"]).await;
    let job = job_for(&server.uri(), 1);

    let (result, events) = run_job(&job, &CancellationToken::new()).await;
    let report = result.unwrap();

    let starting = |model: &str, current| BulkPullEvent::ItemStarting {
        model: model.to_string(),
        current,
        total: 3,
    };
    let finished = |model: &str, current, status| BulkPullEvent::ItemFinished {
        model: model.to_string(),
        current,
        total: 3,
        status,
    };
    assert_eq!(
        without_progress(&events),
        vec![
            BulkPullEvent::JobStarted { total: 3 },
            starting("a", 1),
            finished("a", 1, ItemStatus::Success),
            starting("b", 2),
            finished(
                "b",
                2,
                ItemStatus::Error {
                    cause: "Backend returned 500: disk full".to_string()
                }
            ),
            starting("c", 3),
            finished("c", 3, ItemStatus::Success),
            BulkPullEvent::JobCompleted {
                succeeded: 2,
                failed: 1,
                cancelled: 0
            },
        ]
    );

    // Progress for an item is reported between its start and finish
    let a_progress = events
        .iter()
        .position(|e| matches!(e, BulkPullEvent::ItemProgress { model, .. } if model == "a"))
        .unwrap();
    let a_finished = events
        .iter()
        .position(|e| matches!(e, BulkPullEvent::ItemFinished { model, .. } if model == "a"))
        .unwrap();
    assert!(a_progress < a_finished);

    assert_eq!(report.items.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
}

#[tokio::test]
async fn test_parallel_pulls_report_in_model_order() {
    let server = backend_with_models(&["a", "b", "c", "d"]).await;
    let job = job_for(&server.uri(), 2);
    assert_eq!(job.concurrency(), 2);

    let (result, events) = run_job(&job, &CancellationToken::new()).await;
    let report = result.unwrap();

    assert_eq!(
        finished_models(&events),
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3),
            ("d".to_string(), 4)
        ]
    );
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        events.last(),
        Some(BulkPullEvent::JobCompleted { succeeded: 3, failed: 1, cancelled: 0 })
    ));
}

#[tokio::test]
async fn test_zero_concurrency_is_clamped() {
    let server = MockServer::start().await;
    let job = job_for(&server.uri(), 0);
    assert_eq!(job.concurrency(), 1);
}

#[tokio::test]
async fn test_list_failure_fails_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let job = job_for(&server.uri(), 1);
    let (result, events) = run_job(&job, &CancellationToken::new()).await;

    assert!(result.is_err());
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], BulkPullEvent::JobFailed { cause } if cause.contains("boom")));
}

#[tokio::test]
async fn test_cancelled_job_marks_every_item_cancelled() {
    let server = backend_with_models(&["a", "b"]).await;
    let job = job_for(&server.uri(), 1);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (result, events) = run_job(&job, &cancel).await;
    let report = result.unwrap();

    assert_eq!(report.cancelled(), 2);
    assert!(
        report
            .items
            .iter()
            .all(|item| item.status == ItemStatus::Cancelled)
    );
    assert!(matches!(
        events.last(),
        Some(BulkPullEvent::JobCompleted { succeeded: 0, failed: 0, cancelled: 2 })
    ));
}
