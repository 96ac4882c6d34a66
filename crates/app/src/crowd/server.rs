//! Actix Web surface for streaming mode: the multipart feed, counters,
//! run-state control and probes.
//!
//! The server runs on its own thread with a dedicated actix `System` so the
//! pipeline worker never shares a runtime with request handling.

use std::net::SocketAddr;

use actix_web::{
    App, HttpResponse, HttpServer,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use crossbeam_channel::bounded;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::crowd::{
    control::RunState,
    data::{CountResponse, StatsResponse, StatusResponse},
    health,
    pipeline::SessionHandles,
    telemetry,
};

const BOUNDARY: &str = "frame";

/// Handle for the HTTP server thread.
pub(crate) struct HttpServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl HttpServerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal graceful shutdown and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bind `addr` and serve on a dedicated thread. Binding failures are reported
/// back to the caller instead of being logged from the thread.
pub(crate) fn spawn_http_server(addr: SocketAddr, shared: SessionHandles) -> Result<HttpServerHandle> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = bounded::<std::io::Result<SocketAddr>>(1);

    let handle = telemetry::spawn_thread("crowd-http", move || {
        let system = actix_web::rt::System::new();
        let result = system.block_on(async move {
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(shared.clone()))
                    .configure(configure)
            })
            .workers(2)
            .bind(addr);
            let server = match bound {
                Ok(server) => server,
                Err(err) => {
                    let _ = ready_tx.send(Err(std::io::Error::new(err.kind(), err.to_string())));
                    return Err(err);
                }
            };
            let local = server.addrs().first().copied().unwrap_or(addr);
            let server = server.run();
            let _ = ready_tx.send(Ok(local));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });
            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn HTTP server thread")?;

    let local_addr = match ready_rx.recv() {
        Ok(Ok(local)) => local,
        Ok(Err(err)) => {
            let _ = handle.join();
            return Err(err).with_context(|| format!("failed to bind {addr}"));
        }
        Err(_) => {
            let _ = handle.join();
            return Err(anyhow!("HTTP server thread exited before binding"));
        }
    };
    info!(addr = %local_addr, "HTTP server listening");

    Ok(HttpServerHandle {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
        local_addr,
    })
}

/// Route table, shared with the handler tests.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed", web::get().to(video_feed))
        .route("/count", web::get().to(count))
        .route("/stats", web::get().to(stats))
        .route("/start_stream", web::post().to(start_stream))
        .route("/stop_stream", web::post().to(stop_stream))
        .route("/health", web::get().to(health_probe))
        .route("/ready", web::get().to(ready_probe))
        .route("/metrics", web::get().to(metrics_route));
}

/// Multipart JPEG feed. Each connection is a hub subscriber for as long as
/// the body is being polled.
async fn video_feed(shared: web::Data<SessionHandles>) -> HttpResponse {
    let mut subscriber = shared.hub.subscribe();
    let stream = stream! {
        while let Some(artifact) = subscriber.next().await {
            let mut payload = Vec::with_capacity(artifact.jpeg.len() + 128);
            payload.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
            payload.extend_from_slice(
                format!(
                    "Content-Length: {}\r\nX-Sequence: {}\r\nX-Frame-Kind: {}\r\nX-People-Count: {}\r\nX-Timestamp: {}\r\n\r\n",
                    artifact.jpeg.len(),
                    artifact.sequence,
                    artifact.kind.label(),
                    artifact.counters.current_count,
                    artifact.timestamp_ms
                )
                .as_bytes(),
            );
            payload.extend_from_slice(&artifact.jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        ))
        .streaming(stream)
}

async fn count(shared: web::Data<SessionHandles>) -> HttpResponse {
    HttpResponse::Ok().json(CountResponse {
        people_count: shared.control.counters().current_count(),
    })
}

async fn stats(shared: web::Data<SessionHandles>) -> HttpResponse {
    HttpResponse::Ok().json(StatsResponse::new(
        shared.control.snapshot(),
        shared.hub.subscriber_count(),
        shared.control.run_state(),
    ))
}

async fn start_stream(shared: web::Data<SessionHandles>) -> HttpResponse {
    if shared.control.start() {
        info!("run state -> running");
    }
    HttpResponse::Ok().json(StatusResponse::new("started"))
}

async fn stop_stream(shared: web::Data<SessionHandles>) -> HttpResponse {
    if shared.control.stop() {
        info!("run state -> idle");
    }
    HttpResponse::Ok().json(StatusResponse::new("stopped"))
}

async fn health_probe() -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse::new("ok"))
}

async fn ready_probe(shared: web::Data<SessionHandles>) -> HttpResponse {
    let running = shared.control.run_state() == RunState::Running;
    match shared
        .health
        .stale_component(health::current_millis(), running)
    {
        None => HttpResponse::Ok().json(StatusResponse::new("ready")),
        Some(component) => HttpResponse::build(StatusCode::SERVICE_UNAVAILABLE).json(StatusResponse {
            status: "stalled",
            component: Some(component.label()),
        }),
    }
}

async fn metrics_route() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
