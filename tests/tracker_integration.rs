//! End-to-end tests for acomm
//!
//! These tests run a requester-side Tracker against a provider-side
//! TaskServer over real unix sockets, plus a mock HTTP hook for the
//! proxying path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use acomm::{
    open_stream, AcommError, Dispatcher, EchoHandler, ErrorKind, MultiRequest, Request, Response,
    StreamBroker, TaskServer, Tracker, TrackerState,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Tracker and echo server sharing one temp dir.
async fn setup() -> (TempDir, Tracker, TaskServer) {
    let tmp = TempDir::new().unwrap();
    let tracker = Tracker::new(tmp.path().join("tracker.sock"));
    tracker.start().unwrap();

    let server = TaskServer::new(tmp.path().join("echo.sock"));
    server.register("echo", EchoHandler);
    server.start().unwrap();
    (tmp, tracker, server)
}

async fn teardown(tracker: Tracker, server: TaskServer) {
    tokio::time::timeout(Duration::from_secs(5), async {
        server.stop().await;
        tracker.stop().await;
    })
    .await
    .expect("shutdown hung");
}

#[tokio::test]
async fn echo_round_trip_through_task_server() {
    let (_tmp, tracker, server) = setup().await;

    let req = Request::new("echo", json!({"pool": "tank", "n": 3}), "");
    let id = req.id().to_string();
    let resp = tracker
        .sync_request(&server.url(), req, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(resp.id, id);
    assert_eq!(resp.result, Some(json!({"pool": "tank", "n": 3})));
    assert_eq!(tracker.num_requests(), 0);
    teardown(tracker, server).await;
}

#[tokio::test]
async fn unknown_task_reaches_requester_as_error_response() {
    let (_tmp, tracker, server) = setup().await;

    let resp = tracker
        .sync_request(
            &server.url(),
            Request::new("dhcp-release", json!(null), ""),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(resp.error_kind(), Some(ErrorKind::UnknownTask));
    teardown(tracker, server).await;
}

#[tokio::test]
async fn unanswered_echo_times_out_after_two_seconds() {
    let tmp = TempDir::new().unwrap();
    let tracker = Tracker::new(tmp.path().join("tracker.sock"));
    tracker.start().unwrap();

    let observed = Arc::new(Mutex::new(None));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let probe = tracker.clone();
    let observed_c = Arc::clone(&observed);
    let r1 = Request::new("echo", json!(null), tracker.response_hook()).on_error(move |_, resp| {
        *observed_c.lock().unwrap() = Some((resp.error_kind(), probe.num_requests()));
        let _ = done_tx.send(());
    });

    let started = Instant::now();
    tracker.track_request(&r1, Duration::from_secs(2)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("timeout handler never ran")
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "fired late: {elapsed:?}");
    assert_eq!(*observed.lock().unwrap(), Some((Some(ErrorKind::Timeout), 0)));
    assert_eq!(tracker.num_requests(), 0);
    tracker.stop().await;
}

#[tokio::test]
async fn late_response_after_removal_is_untracked() {
    let (_tmp, tracker, server) = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_c = Arc::clone(&calls);

    let req = Request::new("echo", json!(1), tracker.response_hook()).on_success(move |_, _| {
        calls_c.fetch_add(1, Ordering::SeqCst);
    });
    tracker.track_request(&req, Duration::ZERO).unwrap();
    assert!(tracker.remove_request(req.id()));

    let err = tracker
        .handle_response(Response::success(req.id(), json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, AcommError::UntrackedResponse(_)));

    // Same over the wire: the server answers, nobody is listening for it.
    Dispatcher::new().send(&server.url(), &req).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    teardown(tracker, server).await;
}

#[tokio::test]
async fn multi_request_with_one_removed() {
    let (tmp, tracker, server) = setup().await;
    let multi = MultiRequest::new(&tracker);
    let dispatcher = Dispatcher::new();

    let ra = Request::new("echo", json!("a-args"), tracker.response_hook());
    let rb = Request::new("echo", json!("b-args"), tracker.response_hook());
    multi.add_request("a", &ra, Duration::from_secs(5)).unwrap();
    multi.add_request("b", &rb, Duration::from_secs(5)).unwrap();

    dispatcher.send(&server.url(), &ra).await.unwrap();
    // rb's provider is unreachable, so it is withdrawn.
    let dead = acomm::Endpoint::unix_url(&tmp.path().join("dead.sock"));
    assert!(dispatcher.send(&dead, &rb).await.is_err());
    assert!(multi.remove_request(&rb));

    let responses = tokio::time::timeout(Duration::from_secs(5), multi.responses())
        .await
        .expect("responses hung");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses["a"].result, Some(json!("a-args")));
    teardown(tracker, server).await;
}

#[tokio::test]
async fn multi_request_fan_out() {
    let (_tmp, tracker, server) = setup().await;
    let multi = MultiRequest::new(&tracker);
    let dispatcher = Dispatcher::new();

    let reqs: Vec<Request> = (0..10)
        .map(|i| Request::new("echo", json!(i), tracker.response_hook()))
        .collect();
    for (i, req) in reqs.iter().enumerate() {
        multi.add_request(format!("n{i}"), req, Duration::from_secs(5)).unwrap();
    }
    let mut sends = Vec::new();
    for req in &reqs {
        let dispatcher = dispatcher.clone();
        let dest = server.url();
        let req = req.clone();
        sends.push(tokio::spawn(async move { dispatcher.send(&dest, &req).await }));
    }
    for send in sends {
        send.await.unwrap().unwrap();
    }

    let responses = multi.responses().await;
    assert_eq!(responses.len(), 10);
    for i in 0..10 {
        assert_eq!(responses[&format!("n{i}")].result, Some(json!(i)));
    }
    teardown(tracker, server).await;
}

#[tokio::test]
async fn proxied_request_is_relayed_to_http_hook() {
    let (_tmp, tracker, server) = setup().await;
    let mock = MockServer::start().await;

    let remote = Request::new("echo", json!({"from": "remote"}), format!("{}/hook", mock.uri()));
    let id = remote.id().to_string();
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({"id": id, "result": {"from": "remote"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": ""})))
        .expect(1)
        .mount(&mock)
        .await;

    let local = tracker.proxy_unix(remote).unwrap();
    assert_eq!(local.id(), id);
    assert!(tracker.get(&id).unwrap().is_proxied());

    // Local provider only speaks unix sockets.
    Dispatcher::new().send(&server.url(), &local).await.unwrap();

    // stop() returns once the relay has concluded.
    teardown(tracker.clone(), server).await;
    assert!(tracker.get(&id).is_none());
    assert_eq!(tracker.state(), TrackerState::Stopped);
}

#[tokio::test]
async fn stream_scenario_hello_world() {
    let tmp = TempDir::new().unwrap();
    let broker = StreamBroker::new(tmp.path());
    let url = broker
        .new_stream(std::io::Cursor::new(b"hello world".to_vec()))
        .unwrap();

    let mut conn = open_stream(&url).await.unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"hello world");

    for _ in 0..100 {
        if broker.num_streams() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(broker.num_streams(), 0);
    assert!(open_stream(&url).await.is_err(), "listener should be stopped");
}

#[tokio::test]
async fn stream_url_travels_with_request_and_response() {
    let (_tmp, tracker, server) = setup().await;

    let url = tracker
        .new_stream_unix(std::io::Cursor::new(vec![7u8; 256 * 1024]))
        .unwrap();
    let req = Request::new("echo", json!(null), "").with_stream_url(url.clone());
    let resp = tracker
        .sync_request(&server.url(), req, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(resp.stream_url.as_deref(), Some(url.as_str()));

    let mut conn = open_stream(&url).await.unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf.len(), 256 * 1024);
    assert!(buf.iter().all(|b| *b == 7));
    teardown(tracker, server).await;
}
