//! Catch-all HTTP handler for worker-backed streaming responses.
//!
//! This module defines [`KeepWarmService`], which owns the [`JobSupervisor`]
//! and serves every `GET` and `POST` request, whatever its path, in the same
//! way:
//!
//! 1. Drain the request body (bounded by `max_body_bytes`).
//! 2. Spawn a worker process bound to a fresh [`ResultSlot`].
//! 3. Return a `200` whose body is fed by a [`StreamSession`] running on its
//!    own task.
//!
//! Errors before step 3 are reported as plain HTTP errors. Once the response
//! has started, failures can only truncate the body.

use crate::server::{
    config::ServerConfig,
    telemetry::{
        decrement_streams_inflight, increment_request_errors, increment_requests,
        increment_streams_inflight, increment_workers_spawned, outcome_label,
        record_body_bytes, record_stream_duration, record_stream_outcome,
        record_workers_terminated, terminates_worker,
    },
};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Method, Uri, header},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get},
};
use core::{sync::atomic::Ordering, time::Duration};
use keepwarm_core::{Error, JobSupervisor, ResultSlot, StreamSession, drain};
use portable_atomic::{AtomicBool, AtomicUsize};
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Shared state behind the catch-all route.
#[derive(Clone)]
pub struct KeepWarmService {
    config: Arc<ServerConfig>,
    supervisor: Arc<JobSupervisor>,
    streams_inflight: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
}

impl KeepWarmService {
    pub fn new(config: ServerConfig) -> Self {
        let supervisor = JobSupervisor::new(config.worker.clone());
        Self {
            config: Arc::new(config),
            supervisor: Arc::new(supervisor),
            streams_inflight: Arc::new(AtomicUsize::new(0)),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Router accepting `GET` and `POST` on `/` and on every nested path.
    pub fn router(&self) -> Router {
        let catch_all: MethodRouter<Self> = get(dispatch).post(dispatch);
        Router::new()
            .route("/", catch_all.clone())
            .route("/{*path}", catch_all)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub fn streams_inflight(&self) -> usize {
        self.streams_inflight.load(Ordering::Acquire)
    }

    pub fn live_workers(&self) -> usize {
        self.supervisor.live_workers()
    }

    /// Stops accepting requests, lets in-flight streams finish for up to
    /// `shutdown_timeout` seconds, then kills whatever workers remain.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new requests");
        self.accepting.store(false, Ordering::Release);

        // === Phase 1: Wait for in-flight streams to drain ===
        tracing::info!(
            "Draining in-flight streams ({} active, {} live workers)",
            self.streams_inflight(),
            self.live_workers()
        );
        let grace = Duration::from_secs(self.config.shutdown_timeout);
        let drained = timeout(grace, async {
            while self.streams_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight streams drained successfully"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} streams still active)",
                self.streams_inflight()
            ),
        }

        // === Phase 2: Kill remaining workers ===
        record_workers_terminated(self.live_workers() as u64);
        self.supervisor.shutdown(Duration::from_secs(3)).await
    }
}

/// Decrements the in-flight stream count when the stream task ends, however
/// it ends.
struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        Self(Arc::clone(counter))
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
    }
}

#[tracing::instrument(skip_all, fields(%method, path = %uri.path()))]
async fn dispatch(
    State(service): State<KeepWarmService>,
    method: Method,
    uri: Uri,
    body: Body,
) -> Result<Response, Error> {
    increment_requests();
    start_stream(&service, body)
        .await
        .inspect_err(|e| {
            increment_request_errors();
            tracing::warn!("Request rejected: {e}");
        })
}

async fn start_stream(service: &KeepWarmService, body: Body) -> Result<Response, Error> {
    if !service.accepting.load(Ordering::Acquire) {
        return Err(Error::ServiceShutdown);
    }

    let start = Instant::now();
    let body = drain(body.into_data_stream(), service.config.max_body_bytes).await?;
    tracing::info!("Received {} byte body", body.len());
    tracing::trace!("Body: {}", String::from_utf8_lossy(&body));
    record_body_bytes(body.len() as f64);

    let slot = ResultSlot::new();
    let worker = service.supervisor.spawn(body, slot.clone())?;
    increment_workers_spawned();
    tracing::debug!("Worker {} started (pid {:?})", worker.id(), worker.pid());

    let stream_config = service.config.stream.clone();
    let (tx, rx) = mpsc::channel(stream_config.buffer_size);
    let session = StreamSession::new(slot, worker, stream_config);
    let guard = InflightGuard::new(&service.streams_inflight);

    let fut = async move {
        let _guard = guard;
        let outcome = session.run(tx).await;
        tracing::info!(
            "Stream finished: {} after {:?}",
            outcome_label(&outcome),
            start.elapsed()
        );
        record_stream_outcome(&outcome);
        if terminates_worker(&outcome) {
            record_workers_terminated(1);
        }
        record_stream_duration(start.elapsed().as_millis() as f64);
    }
    .instrument(tracing::info_span!("streaming"));
    tokio::spawn(fut);

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::{
        body::to_bytes,
        http::{Request, StatusCode},
    };
    use keepwarm_core::{StreamConfig, WorkerCommand};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tower::ServiceExt;

    fn service(worker: WorkerCommand) -> KeepWarmService {
        let mut config = ServerConfig::with_worker(worker);
        config.stream = StreamConfig {
            settle_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(20),
            ..StreamConfig::default()
        };
        config.shutdown_timeout = 1;
        KeepWarmService::new(config)
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").args(["-c", script])
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn post_streams_worker_result() {
        let service = service(sh("cat > /dev/null; sleep 0.2; printf done"));
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::from("hello"))
            .unwrap();

        let resp = service.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"done");
        assert!(wait_until(|| service.streams_inflight() == 0).await);
    }

    #[tokio::test]
    async fn get_on_nested_path_is_accepted() {
        let service = service(sh("printf ok"));
        let req = Request::builder()
            .uri("/some/deep/path?x=1")
            .body(Body::empty())
            .unwrap();

        let resp = service.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn worker_receives_the_full_body() {
        let service = service(WorkerCommand::new("cat"));
        let payload = vec![b'z'; 2 * 1024 * 1024 + 17];
        let req = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .body(Body::from(payload.clone()))
            .unwrap();

        let resp = service.router().oneshot(req).await.unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), payload.len());
        assert_eq!(&body[..], &payload[..]);
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let service = service(sh("printf done"));
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let resp = service.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(service.live_workers(), 0);
    }

    #[tokio::test]
    async fn oversized_body_never_spawns_a_worker() {
        let mut config = ServerConfig::with_worker(sh("printf done"));
        config.max_body_bytes = 4;
        let service = KeepWarmService::new(config);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::from("hello"))
            .unwrap();

        let resp = service.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(service.live_workers(), 0);
        assert_eq!(service.streams_inflight(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_server_error() {
        let service = service(WorkerCommand::new("/nonexistent/keepwarm-worker"));
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let resp = service.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(service.streams_inflight(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_results() {
        let service = service(sh("read -r delay; sleep \"$delay\"; printf \"$delay\""));
        let router = service.router();

        let request = |body: &'static str| {
            let router = router.clone();
            async move {
                let req = Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::from(body))
                    .unwrap();
                let resp = router.oneshot(req).await.unwrap();
                to_bytes(resp.into_body(), usize::MAX).await.unwrap()
            }
        };

        let (slow, fast) = tokio::join!(request("0.3\n"), request("0.1\n"));
        assert_eq!(&slow[..], b"0.3");
        assert_eq!(&fast[..], b"0.1");
    }

    #[tokio::test]
    async fn client_disconnect_kills_the_worker() {
        let mut config = ServerConfig::with_worker(WorkerCommand::new("sleep").arg("30"));
        config.stream.settle_delay = Duration::from_millis(10);
        config.stream.poll_interval = Duration::from_millis(100);
        let poll_interval = config.stream.poll_interval;
        let service = KeepWarmService::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, service.router()).into_future());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST /job HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        // Wait for the response head so the stream is known to be running.
        let mut head = [0_u8; 12];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"HTTP/1.1 200");
        assert_eq!(service.live_workers(), 1);

        sleep(Duration::from_millis(50)).await;
        drop(client);
        let disconnected_at = Instant::now();

        while service.live_workers() > 0 && disconnected_at.elapsed() < Duration::from_secs(2) {
            sleep(Duration::from_millis(5)).await;
        }
        let elapsed = disconnected_at.elapsed();
        assert_eq!(service.live_workers(), 0);
        assert!(
            elapsed <= poll_interval + Duration::from_millis(100),
            "worker outlived the disconnect by {elapsed:?}"
        );
        assert!(wait_until(|| service.streams_inflight() == 0).await);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests_and_kills_workers() {
        let service = service(WorkerCommand::new("sleep").arg("30"));
        let router = service.router();

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(service.live_workers(), 1);

        service.shutdown().await.unwrap();
        assert_eq!(service.live_workers(), 0);

        // The stream of the killed worker ends with an error.
        assert!(to_bytes(resp.into_body(), usize::MAX).await.is_err());

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
