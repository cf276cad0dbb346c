//! End-to-end tests driving the bridge with the scripted engine.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::StatusCode;
use parking_lot::Mutex;
use tether_net::sim::{ERR_NAME_NOT_RESOLVED, Exchange, ScriptedEngine, SimCommand};
use tether_net::{
    BridgeConfig, CancelReason, ClientContext, Completion, EngineError, LifecycleState,
    RequestBridge, RequestDelegate, RequestOutcome, ResponseInfo, UrlRequestParams,
    client_context,
};

const WAIT: Duration = Duration::from_secs(5);

fn engine() -> Arc<ScriptedEngine> {
    Arc::new(ScriptedEngine::new(2).unwrap())
}

fn bridge(config: BridgeConfig, engine: &Arc<ScriptedEngine>) -> RequestBridge {
    RequestBridge::new(config, engine.clone()).unwrap()
}

/// Register a listener that forwards `(context as u32, connect_elapsed_ms)`.
fn finished_events(bridge: &RequestBridge) -> Receiver<(Option<u32>, u64)> {
    let (tx, rx) = unbounded();
    bridge.add_finished_listener(Arc::new(move |context: &ClientContext, elapsed: u64| {
        let _ = tx.send((context.downcast_ref::<u32>().copied(), elapsed));
    }));
    rx
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_redirects_then_streamed_body() {
    let engine = engine();
    engine.script(
        "http://example.com/start",
        Exchange::ok(body(2048))
            .redirect("http://example.com/hop")
            .redirect("http://example.com/final")
            .connect_time(25),
    );
    let config = BridgeConfig::builder().read_buffer_size(1024).build().unwrap();
    let bridge = bridge(config, &engine);
    let finished = finished_events(&bridge);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/start").unwrap(),
            client_context(7_u32),
        )
        .unwrap();
    let completion = request.wait_timeout(WAIT).unwrap();

    assert_eq!(
        completion.outcome,
        RequestOutcome::Succeeded {
            final_url: "http://example.com/final".to_string(),
            status: StatusCode::OK,
            redirect_count: 2,
            body_len: 2048,
        }
    );
    assert_eq!(completion.body.as_ref(), body(2048).as_slice());
    assert_eq!(completion.client_context.downcast_ref::<u32>(), Some(&7));

    // Every redirect followed; reads of 1024, 1024 and 0 bytes.
    assert_eq!(
        engine.commands(request.handle()),
        vec![
            SimCommand::Start,
            SimCommand::FollowRedirect,
            SimCommand::FollowRedirect,
            SimCommand::Read { capacity: 1024 },
            SimCommand::Read { capacity: 1024 },
            SimCommand::Read { capacity: 1024 },
        ]
    );

    assert_eq!(finished.recv_timeout(WAIT), Ok((Some(7), 25)));
    assert!(finished.recv_timeout(Duration::from_millis(100)).is_err());

    let snapshot = bridge.snapshot(request.handle()).unwrap();
    assert_eq!(snapshot.state, LifecycleState::Succeeded);
    assert_eq!(snapshot.final_url.as_deref(), Some("http://example.com/final"));
    assert_eq!(snapshot.status, Some(StatusCode::OK));
    assert_eq!(snapshot.body_len, 2048);
    // Two redirect responses plus the final one.
    assert_eq!(bridge.correlation_entries().unwrap(), 3);
}

#[test]
fn test_failure_before_response_is_not_correlated() {
    let engine = engine();
    let bridge = bridge(BridgeConfig::default(), &engine);
    let finished = finished_events(&bridge);

    let request = bridge
        .start(
            UrlRequestParams::get("http://unscripted.invalid/").unwrap(),
            client_context(1_u32),
        )
        .unwrap();
    let completion = request.wait_timeout(WAIT).unwrap();

    assert_eq!(
        completion.outcome,
        RequestOutcome::Failed {
            message: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            code: ERR_NAME_NOT_RESOLVED,
        }
    );
    assert!(completion.body.is_empty());

    // The finished event carries no response metadata, so it cannot be
    // traced back and no listener runs.
    assert!(finished.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(bridge.correlation_entries().unwrap(), 0);
}

#[test]
fn test_failure_mid_body_keeps_received_bytes() {
    let engine = engine();
    engine.script(
        "http://example.com/flaky",
        Exchange::ok(body(4096))
            .connect_time(3)
            .fail_after(1024, EngineError::new(-101, "net::ERR_CONNECTION_RESET")),
    );
    let config = BridgeConfig::builder().read_buffer_size(512).build().unwrap();
    let bridge = bridge(config, &engine);
    let finished = finished_events(&bridge);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/flaky").unwrap(),
            client_context(2_u32),
        )
        .unwrap();
    let completion = request.wait_timeout(WAIT).unwrap();

    assert_eq!(
        completion.outcome,
        RequestOutcome::Failed {
            message: "net::ERR_CONNECTION_RESET".to_string(),
            code: -101,
        }
    );
    assert_eq!(completion.body.len(), 1024);
    assert_eq!(finished.recv_timeout(WAIT), Ok((Some(2), 3)));
}

#[test]
fn test_application_cancel() {
    let engine = engine();
    engine.script(
        "http://example.com/slow",
        Exchange::ok(body(64)).latency(Duration::from_millis(50)),
    );
    let bridge = bridge(BridgeConfig::default(), &engine);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/slow").unwrap(),
            client_context(()),
        )
        .unwrap();
    bridge.cancel(request.handle()).unwrap();

    let completion = request.wait_timeout(WAIT).unwrap();
    assert_eq!(
        completion.outcome,
        RequestOutcome::Canceled {
            reason: CancelReason::Application
        }
    );
    assert!(engine.commands(request.handle()).contains(&SimCommand::Cancel));
}

#[test]
fn test_request_timeout() {
    let engine = engine();
    engine.script(
        "http://example.com/hang",
        Exchange::ok(body(64)).latency(Duration::from_millis(400)),
    );
    let config = BridgeConfig::builder()
        .request_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let bridge = bridge(config, &engine);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/hang").unwrap(),
            client_context(()),
        )
        .unwrap();
    let completion = request.wait_timeout(WAIT).unwrap();
    assert_eq!(
        completion.outcome,
        RequestOutcome::Canceled {
            reason: CancelReason::Timeout
        }
    );
}

#[test]
fn test_completed_request_does_not_time_out() {
    let engine = engine();
    engine.script("http://example.com/fast", Exchange::ok(body(16)));
    let config = BridgeConfig::builder()
        .request_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let bridge = bridge(config, &engine);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/fast").unwrap(),
            client_context(()),
        )
        .unwrap();
    assert!(request.wait_timeout(WAIT).unwrap().outcome.is_success());

    thread::sleep(Duration::from_millis(200));
    assert!(!engine.commands(request.handle()).contains(&SimCommand::Cancel));
}

#[test]
fn test_redirect_limit() {
    let engine = engine();
    engine.script(
        "http://example.com/loop",
        Exchange::ok(body(8))
            .redirect("http://example.com/1")
            .redirect("http://example.com/2")
            .redirect("http://example.com/3"),
    );
    let config = BridgeConfig::builder().max_redirects(2).build().unwrap();
    let bridge = bridge(config, &engine);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/loop").unwrap(),
            client_context(()),
        )
        .unwrap();
    let completion = request.wait_timeout(WAIT).unwrap();

    assert_eq!(
        completion.outcome,
        RequestOutcome::Canceled {
            reason: CancelReason::TooManyRedirects
        }
    );
    assert_eq!(completion.redirect_count, 3);
    assert_eq!(
        engine.commands(request.handle()),
        vec![
            SimCommand::Start,
            SimCommand::FollowRedirect,
            SimCommand::FollowRedirect,
            SimCommand::Cancel,
        ]
    );
}

#[derive(Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl RequestDelegate for Recorder {
    fn on_redirect(&mut self, redirect_count: u32, new_location: &str) {
        self.events
            .lock()
            .push(format!("redirect #{redirect_count} {new_location}"));
    }

    fn on_response_started(&mut self, info: &ResponseInfo) {
        self.events.lock().push(format!(
            "status {} via {} ({})",
            info.status.as_u16(),
            info.url_chain.join(" -> "),
            info.header("content-type").unwrap_or("-"),
        ));
    }

    fn on_completed(&mut self, completion: &Completion) {
        self.events
            .lock()
            .push(format!("completed {}", completion.body.len()));
    }
}

#[test]
fn test_delegate_sees_progress_in_order() {
    let engine = engine();
    engine.script(
        "http://example.com/a",
        Exchange::ok(body(10))
            .redirect("http://example.com/b")
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain")),
    );
    let bridge = bridge(BridgeConfig::default(), &engine);
    let recorder = Recorder::default();
    let events = recorder.events.clone();

    let request = bridge
        .start_with_delegate(
            UrlRequestParams::get("http://example.com/a").unwrap(),
            client_context(()),
            Box::new(recorder),
        )
        .unwrap();
    request.wait_timeout(WAIT).unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            "redirect #1 http://example.com/b".to_string(),
            "status 200 via http://example.com/a -> http://example.com/b (text/plain)".to_string(),
            "completed 10".to_string(),
        ]
    );
}

#[test]
fn test_concurrent_requests_are_correlated_independently() {
    const REQUESTS: u32 = 24;

    let engine = Arc::new(ScriptedEngine::new(4).unwrap());
    for i in 0..REQUESTS {
        engine.script(
            format!("http://example.com/{i}"),
            Exchange::ok(body(100 + i as usize))
                .redirect(format!("http://example.com/{i}/moved"))
                .connect_time(i64::from(i)),
        );
    }
    let config = BridgeConfig::builder().read_buffer_size(64).build().unwrap();
    let bridge = bridge(config, &engine);
    let finished = finished_events(&bridge);

    let starters: Vec<_> = (0..4)
        .map(|lane| {
            let bridge = bridge.clone();
            thread::spawn(move || {
                (0..REQUESTS)
                    .filter(|i| i % 4 == lane)
                    .map(|i| {
                        let params = UrlRequestParams::get(format!("http://example.com/{i}")).unwrap();
                        (i, bridge.start(params, client_context(i)).unwrap())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for starter in starters {
        for (i, request) in starter.join().unwrap() {
            let completion = request.wait_timeout(WAIT).unwrap();
            assert_eq!(completion.body.len(), 100 + i as usize);
            assert_eq!(completion.redirect_count, 1);
        }
    }

    let mut seen: Vec<_> = (0..REQUESTS)
        .map(|_| finished.recv_timeout(WAIT).unwrap())
        .collect();
    seen.sort();
    let expected: Vec<_> = (0..REQUESTS).map(|i| (Some(i), u64::from(i))).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_correlation_entries_expire_after_grace() {
    let engine = engine();
    engine.script("http://example.com/x", Exchange::ok(body(4)));
    let config = BridgeConfig::builder()
        .correlation_grace(Duration::from_millis(30))
        .build()
        .unwrap();
    let bridge = bridge(config, &engine);

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/x").unwrap(),
            client_context(()),
        )
        .unwrap();
    request.wait_timeout(WAIT).unwrap();

    let deadline = Instant::now() + WAIT;
    while bridge.correlation_entries().unwrap() > 0 {
        assert!(Instant::now() < deadline, "correlation entries never expired");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Release the held finished event for `request` once the engine has it.
fn release_finished(engine: &ScriptedEngine, request: tether_net::RequestHandle) {
    let deadline = Instant::now() + WAIT;
    while !engine.release_finished(request) {
        assert!(Instant::now() < deadline, "finished event never produced");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_finished_event_after_destroy_is_dropped() {
    let engine = engine();
    engine.script(
        "http://example.com/gone",
        Exchange::ok(body(4)).connect_time(9).hold_finished_event(),
    );
    engine.script(
        "http://example.com/kept",
        Exchange::ok(body(4)).connect_time(9).hold_finished_event(),
    );
    let bridge = bridge(BridgeConfig::default(), &engine);
    let finished = finished_events(&bridge);

    let gone = bridge
        .start(
            UrlRequestParams::get("http://example.com/gone").unwrap(),
            client_context(5_u32),
        )
        .unwrap();
    let kept = bridge
        .start(
            UrlRequestParams::get("http://example.com/kept").unwrap(),
            client_context(6_u32),
        )
        .unwrap();
    gone.wait_timeout(WAIT).unwrap();
    kept.wait_timeout(WAIT).unwrap();

    bridge.destroy(gone.handle()).unwrap();
    assert_eq!(bridge.active_requests().unwrap(), 1);
    assert_eq!(
        engine.commands(gone.handle()).last(),
        Some(&SimCommand::Destroy)
    );
    // The destroyed request's response is still known to the registry.
    assert_eq!(bridge.correlation_entries().unwrap(), 2);

    // Late event for the destroyed request, then one for the live request.
    release_finished(&engine, gone.handle());
    release_finished(&engine, kept.handle());

    // Both events go through the executor in order, so the first listener
    // call seen must belong to the live request.
    assert_eq!(finished.recv_timeout(WAIT).unwrap(), (Some(6), 9));
    assert!(finished.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(bridge.active_requests().unwrap(), 1);
}

#[test]
fn test_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
executor_name = "file-bridge"
read_buffer_size = 256
max_redirects = 4
"#
    )
    .unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.executor_name, "file-bridge");
    assert_eq!(config.max_redirects, 4);

    let engine = engine();
    engine.script("http://example.com/cfg", Exchange::ok(body(300)));
    let bridge = bridge(config, &engine);
    assert_eq!(bridge.executor().name(), "file-bridge");

    let request = bridge
        .start(
            UrlRequestParams::get("http://example.com/cfg").unwrap(),
            client_context(()),
        )
        .unwrap();
    request.wait_timeout(WAIT).unwrap();

    let reads: Vec<_> = engine
        .commands(request.handle())
        .into_iter()
        .filter(|command| matches!(command, SimCommand::Read { .. }))
        .collect();
    assert_eq!(reads, vec![SimCommand::Read { capacity: 256 }; 3]);
}

#[test]
fn test_shutdown_stops_accepting_requests() {
    let engine = engine();
    let bridge = bridge(BridgeConfig::default(), &engine);
    bridge.shutdown();

    assert!(!bridge.executor().is_running());
    assert!(
        bridge
            .start(
                UrlRequestParams::get("http://example.com/").unwrap(),
                client_context(()),
            )
            .is_err()
    );
}
