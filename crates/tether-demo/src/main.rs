//! Fetch a redirecting URL through the bridge and report connection timing.
//!
//! The request runs against the in-process scripted engine, which replays a
//! three-hop redirect chain ending in a small JSON document.
//!
//! Usage: `tether-demo [CONFIG.toml]`. Set `RUST_LOG` (for example
//! `RUST_LOG=tether_net=debug`) to see the bridge's internal events.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use http::HeaderValue;
use http::header::CONTENT_TYPE;
use tether_core::{tether_error, tether_info, tether_warn};
use tether_net::sim::{Exchange, ScriptedEngine};
use tether_net::{
    BridgeConfig, ClientContext, Completion, RequestBridge, RequestDelegate, RequestOutcome,
    ResponseInfo, UrlRequestParams, client_context,
};
use tracing_subscriber::EnvFilter;

const URL: &str = "http://httpbin.org/redirect/3";
const USER_AGENT: &str = "Tether-Demo-Client";

/// How long to wait for the finished event after the request completes.
const FINISHED_WAIT: Duration = Duration::from_secs(2);

/// Prints request progress as it happens.
struct ConsoleDelegate;

impl RequestDelegate for ConsoleDelegate {
    fn on_redirect(&mut self, redirect_count: u32, new_location: &str) {
        println!("Redirect #{redirect_count} to: {new_location}");
    }

    fn on_response_started(&mut self, info: &ResponseInfo) {
        println!("Response started. Status: {}", info.status.as_u16());
    }

    fn on_completed(&mut self, completion: &Completion) {
        match &completion.outcome {
            RequestOutcome::Succeeded { final_url, .. } => {
                println!();
                println!("Final URL: {final_url}");
                println!("Redirects: {}", completion.redirect_count);
                println!("Response length: {} bytes", completion.body.len());
                println!();
            }
            RequestOutcome::Failed { message, .. } => println!("Request failed: {message}"),
            RequestOutcome::Canceled { reason } => println!("Request canceled: {reason}"),
        }
    }
}

fn script(engine: &ScriptedEngine) {
    let body = br#"{
  "args": {},
  "headers": {
    "Host": "httpbin.org",
    "User-Agent": "Tether-Demo-Client"
  },
  "url": "http://httpbin.org/get"
}
"#;
    engine.script(
        URL,
        Exchange::ok(&body[..])
            .redirect("http://httpbin.org/relative-redirect/2")
            .redirect("http://httpbin.org/relative-redirect/1")
            .redirect("http://httpbin.org/get")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .connect_time(38)
            .latency(Duration::from_millis(20)),
    );
}

fn load_config() -> Result<BridgeConfig, tether_net::ConfigError> {
    match std::env::args_os().nth(1) {
        Some(path) => BridgeConfig::load(path),
        None => Ok(BridgeConfig::default()),
    }
}

fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let config = load_config()?;
    let engine = Arc::new(ScriptedEngine::new(2)?);
    script(&engine);

    let bridge = RequestBridge::new(config, engine)?;

    let (finished_tx, finished_rx) = bounded(1);
    bridge.add_finished_listener(Arc::new(move |_: &ClientContext, connect_elapsed_ms: u64| {
        println!("request finish, connect elapse {connect_elapsed_ms} ms");
        let _ = finished_tx.try_send(());
    }));
    println!("request finished listener registered");

    let params = UrlRequestParams::get(URL)?.header("User-Agent", USER_AGENT)?;
    let request = bridge.start_with_delegate(params, client_context(URL), Box::new(ConsoleDelegate))?;
    tether_info!(request = %request.handle(), url = URL, "request started");

    let Some(completion) = request.wait() else {
        tether_error!("bridge stopped before the request completed");
        return Ok(false);
    };

    if finished_rx.recv_timeout(FINISHED_WAIT).is_err() {
        tether_warn!("no request-finished event; connection statistics unavailable");
    }

    bridge.destroy(request.handle())?;
    bridge.shutdown();
    Ok(completion.outcome.is_success())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tether_error!(%err, "demo failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
