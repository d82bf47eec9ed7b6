//! Status poll fallback against an in-process HTTP server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use opsdeck_notify::{HttpStatusSource, PollConfig, PollOutcome, StatusPoller};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Hits(Arc<AtomicUsize>);

async fn status(Path(token): Path<String>, State(hits): State<Hits>) -> Response {
    hits.0.fetch_add(1, Ordering::SeqCst);
    match token.as_str() {
        "paid" => Json(json!({"payment_status": "paid"})).into_response(),
        "expired" => Json(json!({"status": "expired"})).into_response(),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        "garbage" => "<html>not json</html>".into_response(),
        _ => Json(json!({})).into_response(),
    }
}

async fn spawn_server() -> (SocketAddr, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/status/:token", get(status))
        .with_state(hits.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, hits)
}

fn config(addr: SocketAddr, max_attempts: u32) -> PollConfig {
    PollConfig {
        api_url: format!("http://{addr}"),
        max_attempts,
        interval: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
    }
}

async fn poll(addr: SocketAddr, max_attempts: u32, token: &str) -> PollOutcome {
    let config = config(addr, max_attempts);
    let source = HttpStatusSource::new(&config).expect("source");
    StatusPoller::new(source, &config)
        .expect("poller")
        .run(token)
        .await
}

#[test_timeout::tokio_timeout_test(10)]
async fn empty_responses_exhaust_instead_of_failing() {
    let (addr, hits) = spawn_server().await;
    let started = Instant::now();

    let outcome = poll(addr, 3, "pending").await;

    assert_eq!(outcome, PollOutcome::Exhausted { attempts: 3 });
    assert_eq!(hits.0.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test_timeout::tokio_timeout_test(10)]
async fn paid_confirms_on_the_first_request() {
    let (addr, hits) = spawn_server().await;
    assert_eq!(
        poll(addr, 5, "paid").await,
        PollOutcome::Confirmed { attempts: 1 }
    );
    assert_eq!(hits.0.load(Ordering::SeqCst), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn expired_is_a_terminal_failure() {
    let (addr, _hits) = spawn_server().await;
    assert_eq!(
        poll(addr, 5, "expired").await,
        PollOutcome::Failed {
            status: "expired".into(),
            attempts: 1
        }
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn server_errors_and_garbage_are_inconclusive() {
    let (addr, hits) = spawn_server().await;
    assert_eq!(
        poll(addr, 2, "broken").await,
        PollOutcome::Exhausted { attempts: 2 }
    );
    assert_eq!(
        poll(addr, 2, "garbage").await,
        PollOutcome::Exhausted { attempts: 2 }
    );
    assert_eq!(hits.0.load(Ordering::SeqCst), 4);
}

#[test_timeout::tokio_timeout_test(10)]
async fn unreachable_server_still_respects_the_attempt_budget() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let started = Instant::now();
    assert_eq!(
        poll(addr, 3, "paid").await,
        PollOutcome::Exhausted { attempts: 3 }
    );
    assert!(started.elapsed() >= Duration::from_millis(100));
}
