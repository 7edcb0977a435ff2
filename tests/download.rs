mod common;

use std::time::Duration;

use rsdl::{probe, DownloadCoordinator, DownloadError, FailureReason, JobEvent, JobState, ProbeOutcome, RefuseRedirects};
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

#[tokio::test]
async fn segments_reassemble_into_original_bytes() {
    let server = MockServer::start().await;
    let content = body(1000);
    mount_resource(&server, "/file.bin", &content, 4).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/file.bin", dir.path(), 4))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    match events.last() {
        Some(JobEvent::Completed { output_path }) => assert_eq!(output_path, &dir.path().join("file.bin")),
        other => panic!("unexpected final event: {:?}", other),
    }
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
    assert_eq!(files_in(dir.path()), vec!["file.bin"]);
}

#[tokio::test]
async fn progress_is_monotonic_and_reaches_total_once() {
    let server = MockServer::start().await;
    let content = body(64 * 1024 + 7);
    mount_resource(&server, "/big", &content, 6).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/big", dir.path(), 6))
        .start()
        .unwrap();
    let (events, _) = run(job).await;

    let total = content.len() as u64;
    let done = progress(&events);
    assert!(!done.is_empty());
    assert!(done.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", done);
    assert!(done.iter().all(|&b| b <= total));
    assert_eq!(done.iter().filter(|&&b| b == total).count(), 1);
    assert_eq!(*done.last().unwrap(), total);

    for event in &events {
        if let JobEvent::Progress { total_bytes, .. } = event {
            assert_eq!(*total_bytes, total);
        }
    }
}

#[tokio::test]
async fn more_workers_than_bytes() {
    let server = MockServer::start().await;
    let content = body(3);
    mount_resource(&server, "/tiny", &content, 8).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/tiny", dir.path(), 8))
        .start()
        .unwrap();
    let (_, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
}

#[tokio::test]
async fn without_range_support_one_segment_is_used() {
    let server = MockServer::start().await;
    let content = body(100);
    mount_head(&server, "/plain", content.len(), false).await;
    Mock::given(method("GET"))
        .and(path("/plain"))
        .and(header("range", "bytes=0-99"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/plain", dir.path(), 4))
        .start()
        .unwrap();
    let (_, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
}

#[tokio::test]
async fn empty_resource_produces_empty_file() {
    let server = MockServer::start().await;
    mount_head(&server, "/empty", 0, true).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/empty", dir.path(), 4))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert!(progress(&events).is_empty());
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap().len(), 0);
}

#[tokio::test]
async fn missing_resource_fails_the_probe() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/gone", dir.path(), 4))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            reason: FailureReason::Probe(_)
        })
    ));
    assert!(files_in(dir.path()).is_empty());
}

#[tokio::test]
async fn failed_segment_fails_the_job_and_stops_the_rest() {
    let server = MockServer::start().await;
    let content = body(1000);
    mount_head(&server, "/flaky", content.len(), true).await;
    for range in rsdl::plan(1000, 4) {
        let response = if range.index == 2 {
            ResponseTemplate::new(500)
        } else {
            ResponseTemplate::new(206)
                .set_body_bytes(content[range.start as usize..=range.end as usize].to_vec())
                .set_delay(Duration::from_secs(30))
        };
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .and(header("range", range.header_value().as_str()))
            .respond_with(response)
            .mount(&server)
            .await;
    }

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/flaky", dir.path(), 4))
        .start()
        .unwrap();
    let (events, state) = tokio::time::timeout(Duration::from_secs(10), run(job))
        .await
        .expect("job hung after a segment failure");

    assert_eq!(state, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            reason: FailureReason::SegmentTransport(_)
        })
    ));
    assert!(files_in(dir.path()).is_empty(), "left behind: {:?}", files_in(dir.path()));
}

#[tokio::test]
async fn failed_segment_is_retried_when_allowed() {
    let server = MockServer::start().await;
    let content = body(1000);
    let flaky = rsdl::plan(1000, 4)[1];
    Mock::given(method("GET"))
        .and(path("/retry"))
        .and(header("range", flaky.header_value().as_str()))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_resource(&server, "/retry", &content, 4).await;

    let dir = tempdir().unwrap();
    let mut req = request(&server, "/retry", dir.path(), 4);
    req.max_segment_retries = 1;
    let job = DownloadCoordinator::new(req).start().unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
    let done = progress(&events);
    assert!(done.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*done.last().unwrap(), 1000);
}

#[tokio::test]
async fn cancel_mid_flight_leaves_nothing_behind() {
    let server = MockServer::start().await;
    mount_head(&server, "/slow", 1000, true).await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(vec![0u8; 250])
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut job = DownloadCoordinator::new(request(&server, "/slow", dir.path(), 4))
        .start()
        .unwrap();
    job.watch_state()
        .wait_for(|s| *s == JobState::Running)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), job.cancel())
        .await
        .expect("cancel hung")
        .unwrap();
    let events = collect(&mut job).await;

    assert!(matches!(events.last(), Some(JobEvent::Cancelled)));
    assert!(files_in(dir.path()).is_empty(), "left behind: {:?}", files_in(dir.path()));
    assert!(matches!(job.cancel().await, Err(DownloadError::NotCancellable)));
    assert_eq!(job.wait().await, JobState::Cancelled);

    // Cleanup does not disturb a fresh probe of the same resource.
    let client = reqwest::Client::new();
    let url = url::Url::parse(&format!("{}/slow", server.uri())).unwrap();
    assert_eq!(
        probe(&client, &url, None).await.unwrap(),
        ProbeOutcome::Resolved {
            total_bytes: 1000,
            range_supported: true
        }
    );
}

#[tokio::test]
async fn cancel_during_probe() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/stall"))
        .respond_with(head_response(10, true).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut job = DownloadCoordinator::new(request(&server, "/stall", dir.path(), 2))
        .start()
        .unwrap();
    job.cancel().await.unwrap();
    let events = collect(&mut job).await;

    assert_eq!(events, vec![JobEvent::Cancelled]);
    assert!(files_in(dir.path()).is_empty());
}

#[tokio::test]
async fn probe_redirect_restarts_at_new_location() {
    let server = MockServer::start().await;
    let content = body(500);
    Mock::given(method("HEAD"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
        .mount(&server)
        .await;
    mount_resource(&server, "/new", &content, 3).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/old", dir.path(), 3))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Restarted { url } if url.ends_with("/new"))));
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
}

#[tokio::test]
async fn segment_redirect_restarts_whole_job() {
    let server = MockServer::start().await;
    let content = body(800);
    mount_head(&server, "/moving", content.len(), true).await;
    Mock::given(method("GET"))
        .and(path("/moving"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/stable"))
        .mount(&server)
        .await;
    mount_resource(&server, "/stable", &content, 4).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/moving", dir.path(), 4))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    let restarts = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Restarted { .. }))
        .count();
    assert_eq!(restarts, 1);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
    assert_eq!(files_in(dir.path()), vec!["file.bin"]);
}

#[tokio::test]
async fn refused_redirect_fails() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "http://elsewhere.invalid/x"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/old", dir.path(), 2))
        .with_redirect_approver(RefuseRedirects)
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            reason: FailureReason::RedirectRefused(_)
        })
    ));
}

#[tokio::test]
async fn redirect_loop_is_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut req = request(&server, "/loop", dir.path(), 2);
    req.max_redirects = 3;
    let job = DownloadCoordinator::new(req).start().unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            reason: FailureReason::TooManyRedirects(_)
        })
    ));
}

async fn mount_private(server: &MockServer, content: &[u8]) {
    Mock::given(method("HEAD"))
        .and(path("/private"))
        .and(header("authorization", AUTH_ALICE))
        .respond_with(head_response(content.len(), true))
        .mount(server)
        .await;
    mount_segments(server, "/private", content, 2, Some(AUTH_ALICE)).await;
    Mock::given(path("/private"))
        .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", "Basic realm=\"files\""))
        .with_priority(10)
        .mount(server)
        .await;
}

#[tokio::test]
async fn missing_credentials_surface_auth_required() {
    let server = MockServer::start().await;
    mount_private(&server, &body(64)).await;

    let dir = tempdir().unwrap();
    let job = DownloadCoordinator::new(request(&server, "/private", dir.path(), 2))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            reason: FailureReason::AuthRequired(_)
        })
    ));
}

#[tokio::test]
async fn basic_auth_is_sent_on_probe_and_segments() {
    let server = MockServer::start().await;
    let content = body(64);
    mount_private(&server, &content).await;

    let dir = tempdir().unwrap();
    let req = request(&server, "/private", dir.path(), 2).with_credentials("alice", "secret");
    let job = DownloadCoordinator::new(req).start().unwrap();
    let (_, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
}

#[tokio::test]
async fn credentials_stay_with_the_original_origin() {
    let origin = MockServer::start().await;
    let mirror = MockServer::start().await;
    let content = body(200);
    let target = format!("{}/x", mirror.uri());
    Mock::given(method("HEAD"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", target.as_str()))
        .mount(&origin)
        .await;
    mount_resource(&mirror, "/x", &content, 2).await;

    let dir = tempdir().unwrap();
    let req = request(&origin, "/old", dir.path(), 2).with_credentials("alice", "secret");
    let job = DownloadCoordinator::new(req).start().unwrap();
    let (_, state) = run(job).await;

    assert_eq!(state, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);

    let to_origin = origin.received_requests().await.unwrap();
    assert!(to_origin
        .iter()
        .all(|r| r.headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(AUTH_ALICE)));
    let to_mirror = mirror.received_requests().await.unwrap();
    assert_eq!(to_mirror.len(), 3);
    assert!(
        to_mirror.iter().all(|r| !r.headers.contains_key("authorization")),
        "credentials leaked to {}",
        mirror.uri()
    );
}

#[tokio::test]
async fn reassembly_failure_fails_job_and_removes_sinks() {
    let server = MockServer::start().await;
    let content = body(400);
    mount_resource(&server, "/f", &content, 4).await;

    let dir = tempdir().unwrap();
    // The output path is taken by a directory, so creating the output fails.
    std::fs::create_dir(dir.path().join("file.bin")).unwrap();
    let job = DownloadCoordinator::new(request(&server, "/f", dir.path(), 4))
        .start()
        .unwrap();
    let (events, state) = run(job).await;

    assert_eq!(state, JobState::Failed);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Failed {
            reason: FailureReason::Io(_)
        })
    ));
    assert_eq!(files_in(dir.path()), vec!["file.bin"]);
    assert!(dir.path().join("file.bin").is_dir());
}

#[tokio::test]
async fn cancel_is_rejected_once_reassembly_starts() {
    let server = MockServer::start().await;
    let content = body(256 * 1024);
    mount_resource(&server, "/r", &content, 4).await;

    let dir = tempdir().unwrap();
    let mut job = DownloadCoordinator::new(request(&server, "/r", dir.path(), 4))
        .start()
        .unwrap();
    let canceller = job.canceller();
    job.watch_state()
        .wait_for(|s| *s == JobState::Reassembling || s.is_terminal())
        .await
        .unwrap();

    assert!(matches!(job.cancel().await, Err(DownloadError::NotCancellable)));
    assert!(matches!(canceller.cancel().await, Err(DownloadError::NotCancellable)));

    let events = collect(&mut job).await;
    assert!(matches!(events.last(), Some(JobEvent::Completed { .. })));
    assert_eq!(job.wait().await, JobState::Completed);
    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), content);
}

#[tokio::test]
async fn sinks_go_to_the_temp_directory() {
    let server = MockServer::start().await;
    let content = body(300);
    mount_head(&server, "/t", content.len(), true).await;
    for range in rsdl::plan(300, 3) {
        Mock::given(method("GET"))
            .and(path("/t"))
            .and(header("range", range.header_value().as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(content[range.start as usize..=range.end as usize].to_vec())
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
    }

    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = request(&server, "/t", out.path(), 3).with_temp_directory(tmp.path());
    let mut job = DownloadCoordinator::new(req).start().unwrap();
    job.watch_state()
        .wait_for(|s| *s == JobState::Running)
        .await
        .unwrap();

    assert_eq!(files_in(tmp.path()), vec!["file.bin_0", "file.bin_1", "file.bin_2"]);
    assert!(files_in(out.path()).is_empty());

    job.cancel().await.unwrap();
    collect(&mut job).await;
    assert!(files_in(tmp.path()).is_empty());
}
