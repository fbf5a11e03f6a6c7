//! Integration tests for pump-dl
//!
//! These tests use wiremock to simulate HTTP servers and drive the queue
//! through real transfers: redirects, retries, multi-section downloads,
//! cancellation and deletion mid-transfer. Transfers that must be caught
//! halfway run against `StallingServer`, which pauses inside the body.


use pump_dl::{FailureKind, FileStorage, PumpError, PumpingState, QueueEvent, Storage};
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::{
    create_test_queue, state_file, test_config, test_content, wait_for_state, wait_until,
    StallingServer,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_file(server: &MockServer, route: &str, content: &[u8]) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", content.len().to_string())
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(server)
        .await;
}

/// HEAD answers at once, GET stalls for `delay`
async fn mount_slow_file(server: &MockServer, route: &str, content: &[u8], delay: Duration) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", content.len().to_string())
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.to_vec())
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

// =============================================================================
// Basic Download Tests
// =============================================================================

#[tokio::test]
async fn test_basic_download() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = b"Hello, World! This is test content for download.";
    mount_file(&mock_server, "/test-file.txt", content).await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    let url = format!("{}/test-file.txt", mock_server.uri());
    let pumping = queue.add(&url, None).await.expect("Failed to add pumping");
    let id = pumping.id();
    assert_eq!(pumping.state(), PumpingState::Queued);
    assert_eq!(pumping.output(), temp_dir.path().join("test-file.txt"));

    queue.invoke().await.expect("Failed to invoke");
    wait_for_state(&queue, id, PumpingState::Finished, Duration::from_secs(10)).await;

    let downloaded = tokio::fs::read(temp_dir.path().join("test-file.txt"))
        .await
        .expect("Failed to read file");
    assert_eq!(downloaded, content);
    assert!(!temp_dir.path().join("test-file.txt.part").exists());

    let finished = queue.get_by_id(id).unwrap();
    assert_eq!(finished.length(), Some(content.len() as u64));
    assert_eq!(finished.downloaded(), content.len() as u64);
    assert!(finished.finished_at().is_some());

    assert_eq!(
        recorder.states_for(id),
        vec![
            PumpingState::Connecting,
            PumpingState::Downloading,
            PumpingState::Finished,
        ]
    );

    queue.terminate().await.expect("Failed to terminate");
}

#[tokio::test]
async fn test_add_notifies_before_returning() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    let pumping = queue
        .add("http://127.0.0.1:9/never.bin", None)
        .await
        .expect("Failed to add pumping");

    // No workers are running, so nothing else can have happened yet
    assert_eq!(recorder.events(), vec![QueueEvent::Added { id: pumping.id() }]);
    assert_eq!(queue.to_array(), vec![pumping]);
    assert!(test_helpers::state_file(&temp_dir).exists());
}

#[tokio::test]
async fn test_explicit_output_path() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(300);
    mount_file(&mock_server, "/original-name.bin", &content).await;

    let (queue, _recorder) = create_test_queue(test_config(&temp_dir)).await;

    let url = format!("{}/original-name.bin", mock_server.uri());
    let pumping = queue
        .add(&url, Some(std::path::Path::new("nested/custom.bin")))
        .await
        .expect("Failed to add pumping");
    let expected = temp_dir.path().join("nested").join("custom.bin");
    assert_eq!(pumping.output(), expected);

    queue.invoke().await.unwrap();
    wait_for_state(&queue, pumping.id(), PumpingState::Finished, Duration::from_secs(10)).await;

    assert_eq!(tokio::fs::read(&expected).await.unwrap(), content);
    assert!(!temp_dir.path().join("original-name.bin").exists());

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_unknown_length_download() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(777);

    // HEAD refused: length and range support stay unknown
    Mock::given(method("HEAD"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&mock_server)
        .await;

    let (queue, _recorder) = create_test_queue(test_config(&temp_dir)).await;
    let pumping = queue
        .add(&format!("{}/stream", mock_server.uri()), None)
        .await
        .unwrap();
    assert_eq!(pumping.length_or_unknown(), -1);

    queue.invoke().await.unwrap();
    wait_for_state(&queue, pumping.id(), PumpingState::Finished, Duration::from_secs(10)).await;

    let finished = queue.get_by_id(pumping.id()).unwrap();
    assert_eq!(finished.length(), Some(content.len() as u64));
    assert_eq!(tokio::fs::read(temp_dir.path().join("stream")).await.unwrap(), content);

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_body_longer_than_announced_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/liar.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "10")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/liar.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(test_content(20)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue
        .add(&format!("{}/liar.bin", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Failed, Duration::from_secs(10)).await;

    // Not retried, and nothing truncated lands at the output path
    let pumping = queue.get_by_id(id).unwrap();
    assert_eq!(pumping.last_error().unwrap().kind, FailureKind::LengthMismatch);
    assert_eq!(pumping.attempts(), 1);
    assert_eq!(
        recorder.states_for(id),
        vec![
            PumpingState::Connecting,
            PumpingState::Downloading,
            PumpingState::Failed,
        ]
    );
    assert!(!temp_dir.path().join("liar.bin").exists());

    queue.terminate().await.unwrap();
    mock_server.verify().await;
}

// =============================================================================
// Redirect Tests
// =============================================================================

#[tokio::test]
async fn test_redirect_is_followed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(512);
    Mock::given(method("HEAD"))
        .and(path("/start.bin"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/final.bin"))
        .mount(&mock_server)
        .await;
    mount_file(&mock_server, "/final.bin", &content).await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    let url = format!("{}/start.bin", mock_server.uri());
    let id = queue.add(&url, None).await.unwrap().id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Finished, Duration::from_secs(10)).await;

    let pumping = queue.get_by_id(id).unwrap();
    assert_eq!(pumping.declared_url().as_str(), url);
    assert_eq!(pumping.real_url().path(), "/final.bin");
    assert_eq!(pumping.length(), Some(512));

    // The output name comes from the declared URL
    assert_eq!(
        tokio::fs::read(temp_dir.path().join("start.bin")).await.unwrap(),
        content
    );
    assert!(recorder.count(|e| matches!(e, QueueEvent::Updated { id: eid } if *eid == id)) >= 1);

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_redirect_loop_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/b"))
        .mount(&mock_server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/a"))
        .mount(&mock_server)
        .await;

    let config = test_config(&temp_dir).max_redirects(5).attempt_count(1);
    let (queue, _recorder) = create_test_queue(config).await;

    let id = queue
        .add(&format!("{}/a", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Failed, Duration::from_secs(10)).await;

    let failure = queue.get_by_id(id).unwrap().last_error().cloned().unwrap();
    assert_eq!(failure.kind, FailureKind::RedirectLoop);

    queue.terminate().await.unwrap();
}

// =============================================================================
// Retry Tests
// =============================================================================

#[tokio::test]
async fn test_failing_server_exhausts_attempts() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir).attempt_count(3)).await;

    let id = queue
        .add(&format!("{}/broken", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Failed, Duration::from_secs(10)).await;

    // Each attempt connects and then waits; the last wait ends in FAILED
    use PumpingState::*;
    assert_eq!(
        recorder.states_for(id),
        vec![Connecting, Waiting, Connecting, Waiting, Connecting, Waiting, Failed]
    );

    let pumping = queue.get_by_id(id).unwrap();
    assert_eq!(pumping.attempts(), 3);
    assert_eq!(pumping.last_error().unwrap().kind, FailureKind::Connection);

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(256);

    // First HEAD fails, everything after succeeds
    Mock::given(method("HEAD"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    mount_file(&mock_server, "/flaky", &content).await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue
        .add(&format!("{}/flaky", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Finished, Duration::from_secs(10)).await;

    use PumpingState::*;
    assert_eq!(
        recorder.states_for(id),
        vec![Connecting, Waiting, Connecting, Downloading, Finished]
    );
    assert_eq!(tokio::fs::read(temp_dir.path().join("flaky")).await.unwrap(), content);

    queue.terminate().await.unwrap();
}

// =============================================================================
// Multi-Section Tests
// =============================================================================

#[tokio::test]
async fn test_multi_section_download() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(4096);

    Mock::given(method("HEAD"))
        .and(path("/big.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "4096")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&mock_server)
        .await;

    for i in 0..4usize {
        let first = i * 1024;
        let last = first + 1023;
        Mock::given(method("GET"))
            .and(path("/big.bin"))
            .and(header("Range", format!("bytes={}-{}", first, last).as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {}-{}/4096", first, last))
                    .set_body_bytes(content[first..=last].to_vec()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let config = test_config(&temp_dir)
        .max_sections(4)
        .min_section_size(1024);
    let (queue, _recorder) = create_test_queue(config).await;

    let id = queue
        .add(&format!("{}/big.bin", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Finished, Duration::from_secs(10)).await;

    let pumping = queue.get_by_id(id).unwrap();
    assert_eq!(pumping.sections().len(), 4);
    assert!(pumping.sections().iter().all(|s| s.is_complete()));
    assert_eq!(pumping.progress(), 100.0);
    assert_eq!(
        tokio::fs::read(temp_dir.path().join("big.bin")).await.unwrap(),
        content
    );

    queue.terminate().await.unwrap();
    mock_server.verify().await;
}

// =============================================================================
// Worker Pool Tests
// =============================================================================

#[tokio::test]
async fn test_invoke_and_terminate_are_idempotent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    assert!(!queue.is_active());
    queue.invoke().await.unwrap();
    queue.invoke().await.unwrap();
    assert!(queue.is_active());

    queue.terminate().await.unwrap();
    queue.terminate().await.unwrap();
    assert!(!queue.is_active());

    assert_eq!(recorder.events(), vec![QueueEvent::Invoked, QueueEvent::Terminated]);
}

#[tokio::test]
async fn test_terminate_before_invoke_is_silent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    queue.terminate().await.unwrap();
    assert!(recorder.events().is_empty());

    queue.invoke().await.unwrap();
    queue.terminate().await.unwrap();
    queue.terminate().await.unwrap();

    assert_eq!(recorder.count(|e| matches!(e, QueueEvent::Invoked)), 1);
    assert_eq!(recorder.count(|e| matches!(e, QueueEvent::Terminated)), 1);
    assert_eq!(recorder.events(), vec![QueueEvent::Invoked, QueueEvent::Terminated]);
}

#[tokio::test]
async fn test_worker_limit_respected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    for i in 0..3 {
        mount_slow_file(
            &mock_server,
            &format!("/slow{}.bin", i),
            &test_content(128),
            Duration::from_millis(200),
        )
        .await;
    }

    let (queue, _recorder) = create_test_queue(test_config(&temp_dir).max_workers(1)).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let url = format!("{}/slow{}.bin", mock_server.uri(), i);
        ids.push(queue.add(&url, None).await.unwrap().id());
    }
    queue.invoke().await.unwrap();

    let mut max_active = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let stats = queue.stats();
        max_active = max_active.max(stats.connecting + stats.waiting + stats.downloading);
        if stats.finished == 3 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(queue.stats().finished, 3, "All pumpings should finish");
    assert_eq!(max_active, 1, "Only one worker may run at a time");

    // Oldest first
    let finished_at: Vec<_> = ids
        .iter()
        .map(|id| queue.get_by_id(*id).unwrap().finished_at().unwrap())
        .collect();
    assert!(finished_at.windows(2).all(|w| w[0] <= w[1]));

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_terminate_requeues_active_pumping() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    mount_slow_file(&mock_server, "/stall.bin", &test_content(64), Duration::from_secs(30)).await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue
        .add(&format!("{}/stall.bin", mock_server.uri()), None)
        .await
        .unwrap()
        .id();

    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Downloading, Duration::from_secs(10)).await;

    tokio::time::timeout(Duration::from_secs(5), queue.terminate())
        .await
        .expect("terminate should not wait for the stalled response")
        .unwrap();

    assert_eq!(queue.get_by_id(id).unwrap().state(), PumpingState::Queued);
    assert_eq!(recorder.events().last(), Some(&QueueEvent::Terminated));
    assert_eq!(recorder.states_for(id).last(), Some(&PumpingState::Queued));
}

#[tokio::test]
async fn test_dropped_queue_lets_running_workers_finish() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let content = test_content(4096);
    let server = StallingServer::start(content.clone(), 1024, Duration::from_millis(300)).await;

    let (queue, _recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue.add(&server.url("/orphan.bin"), None).await.unwrap().id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Downloading, Duration::from_secs(10)).await;

    // Without terminate the worker keeps the queue alive until it settles
    drop(queue);

    let storage = FileStorage::new(state_file(&temp_dir));
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(stored) = storage.load_all().await {
                if stored.iter().any(|p| p.id() == id && p.state() == PumpingState::Finished) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "orphaned pumping never finished");
    assert_eq!(tokio::fs::read(temp_dir.path().join("orphan.bin")).await.unwrap(), content);
}

// =============================================================================
// Cancel/Delete Tests
// =============================================================================

#[tokio::test]
async fn test_cancel_then_retry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(2048);
    Mock::given(method("HEAD"))
        .and(path("/retry.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "2048")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&mock_server)
        .await;
    // The first GET stalls; later ones answer at once
    Mock::given(method("GET"))
        .and(path("/retry.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.clone())
                .set_delay(Duration::from_secs(30)),
        )
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/retry.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&mock_server)
        .await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue
        .add(&format!("{}/retry.bin", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.invoke().await.unwrap();
    wait_for_state(&queue, id, PumpingState::Downloading, Duration::from_secs(10)).await;

    queue.cancel(id).await.unwrap();
    assert_eq!(queue.get_by_id(id).unwrap().state(), PumpingState::Cancelled);
    assert!(matches!(
        queue.cancel(id).await,
        Err(PumpError::InvalidState { .. })
    ));

    queue.retry(id).await.unwrap();
    wait_for_state(&queue, id, PumpingState::Finished, Duration::from_secs(10)).await;
    assert_eq!(tokio::fs::read(temp_dir.path().join("retry.bin")).await.unwrap(), content);

    use PumpingState::*;
    assert_eq!(
        recorder.states_for(id),
        vec![Connecting, Downloading, Cancelled, Queued, Connecting, Downloading, Finished]
    );

    // Finished pumpings cannot be retried
    assert!(matches!(queue.retry(id).await, Err(PumpError::InvalidState { .. })));

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_cancel_idle_pumping() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    let id = queue
        .add("http://127.0.0.1:9/idle.bin", None)
        .await
        .unwrap()
        .id();
    queue.cancel(id).await.unwrap();

    assert_eq!(queue.get_by_id(id).unwrap().state(), PumpingState::Cancelled);
    assert_eq!(
        recorder.events_for(id).last(),
        Some(&QueueEvent::StateChanged {
            id,
            old_state: PumpingState::Queued,
            new_state: PumpingState::Cancelled,
        })
    );

    // A running pool leaves it alone
    queue.invoke().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get_by_id(id).unwrap().state(), PumpingState::Cancelled);
    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_retry_is_announced_before_the_worker_starts() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mock_server = MockServer::start().await;

    let content = test_content(512);
    mount_file(&mock_server, "/again.bin", &content).await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue
        .add(&format!("{}/again.bin", mock_server.uri()), None)
        .await
        .unwrap()
        .id();
    queue.cancel(id).await.unwrap();
    queue.invoke().await.unwrap();

    queue.retry(id).await.unwrap();
    wait_for_state(&queue, id, PumpingState::Finished, Duration::from_secs(10)).await;

    // QUEUED reaches listeners before the worker's CONNECTING
    use PumpingState::*;
    assert_eq!(
        recorder.states_for(id),
        vec![Cancelled, Queued, Connecting, Downloading, Finished]
    );
    let queued = recorder.events_for(id)[2].clone();
    assert_eq!(
        queued,
        QueueEvent::StateChanged {
            id,
            old_state: Cancelled,
            new_state: Queued,
        }
    );

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_cancel_mid_stream_keeps_part_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let content = test_content(4096);
    let server = StallingServer::start(content.clone(), 1024, Duration::from_secs(1)).await;

    let (queue, _recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue.add(&server.url("/paused.bin"), None).await.unwrap().id();
    queue.invoke().await.unwrap();

    wait_until(Duration::from_secs(10), || {
        queue.get_by_id(id).is_some_and(|p| p.downloaded() >= 1024)
    })
    .await;
    queue.cancel(id).await.unwrap();

    let part = temp_dir.path().join("paused.bin.part");
    let written = std::fs::read(&part).expect("part file should survive cancel");
    assert_eq!(&written[..1024], &content[..1024]);
    let downloaded = queue.get_by_id(id).unwrap().downloaded();
    assert_eq!(downloaded, 1024);

    // The rest of the body arrives after the stall; none of it is written
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(std::fs::read(&part).unwrap(), written);
    let pumping = queue.get_by_id(id).unwrap();
    assert_eq!(pumping.downloaded(), downloaded);
    assert_eq!(pumping.state(), PumpingState::Cancelled);
    assert!(!temp_dir.path().join("paused.bin").exists());

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_delete_mid_transfer() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let content = test_content(4096);
    let server = StallingServer::start(content.clone(), 1024, Duration::from_secs(1)).await;

    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = queue.add(&server.url("/doomed.bin"), None).await.unwrap().id();
    queue.invoke().await.unwrap();

    // Part of the body is already on disk when delete arrives
    wait_until(Duration::from_secs(10), || {
        queue.get_by_id(id).is_some_and(|p| p.downloaded() >= 1024)
    })
    .await;
    let part = temp_dir.path().join("doomed.bin.part");
    wait_until(Duration::from_secs(5), || {
        std::fs::read(&part).is_ok_and(|written| written[..1024] == content[..1024])
    })
    .await;

    queue.delete(id).await.expect("Failed to delete");
    assert!(queue.get_by_id(id).is_none());
    assert!(!part.exists());
    assert_eq!(recorder.events_for(id).last(), Some(&QueueEvent::Deleted { id }));

    // The server resumes sending after the stall; nothing writes the file back
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!part.exists());
    assert!(!temp_dir.path().join("doomed.bin").exists());
    assert_eq!(recorder.events_for(id).last(), Some(&QueueEvent::Deleted { id }));

    assert!(matches!(queue.delete(id).await, Err(PumpError::NotFound(_))));

    queue.terminate().await.unwrap();
}

#[tokio::test]
async fn test_reset_deletes_everything() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let url = format!("http://127.0.0.1:9/file{}.bin", i);
        ids.push(queue.add(&url, None).await.unwrap().id());
    }

    queue.reset().await.unwrap();
    assert!(queue.to_array().is_empty());

    let events = recorder.events();
    let deleted: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Deleted { id } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, ids);
    assert_eq!(events.last(), Some(&QueueEvent::Reset));
}

// =============================================================================
// Error Handling Tests
// =============================================================================

#[tokio::test]
async fn test_invalid_url_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    for bad in ["not a url", "ftp://example.com/file", ""] {
        let result = queue.add(bad, None).await;
        assert!(
            matches!(result, Err(PumpError::InvalidUrl { .. })),
            "{:?} should be rejected",
            bad
        );
    }

    assert!(queue.to_array().is_empty());
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, _recorder) = create_test_queue(test_config(&temp_dir)).await;

    let result = queue
        .add(
            "http://example.com/file",
            Some(std::path::Path::new("../outside.bin")),
        )
        .await;
    assert!(matches!(result, Err(PumpError::Storage { .. })));
    assert!(queue.to_array().is_empty());
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, _recorder) = create_test_queue(test_config(&temp_dir)).await;
    let id = pump_dl::PumpingId::new();

    assert!(queue.get_by_id(id).is_none());
    assert!(matches!(queue.delete(id).await, Err(PumpError::NotFound(_))));
    assert!(matches!(queue.cancel(id).await, Err(PumpError::NotFound(_))));
    assert!(matches!(queue.retry(id).await, Err(PumpError::NotFound(_))));
}

#[tokio::test]
async fn test_listener_can_be_removed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let (queue, recorder) = create_test_queue(test_config(&temp_dir)).await;

    let extra = std::sync::Arc::new(test_helpers::RecordingListener::default());
    let handle = queue.add_listener(extra.clone());
    queue.add("http://127.0.0.1:9/a", None).await.unwrap();
    assert!(queue.remove_listener(handle));
    queue.add("http://127.0.0.1:9/b", None).await.unwrap();

    assert_eq!(extra.events().len(), 1);
    assert_eq!(recorder.events().len(), 2);

    let mut events = queue.subscribe();
    queue.invoke().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Invoked);
    queue.terminate().await.unwrap();
}
