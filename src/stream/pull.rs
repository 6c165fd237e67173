//! 最新フレームとステータスをポーリングで返す HTTP サーバ

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::frame::StreamState;

const STOP_WAIT: Duration = Duration::from_secs(1);

const UNAVAILABLE_BODY: &str = "Stream not available - no frames are being published";

const COMMON_HEADERS: [(HeaderName, &str); 7] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
    (header::CONNECTION, "close"),
];

type SharedState = Arc<StreamState>;

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], body.into()).into_response()
}

/// `now` 時点で鮮度窓内なら最新フレーム、そうでなければ 503
pub fn frame_response(state: &StreamState, now: f64) -> Response {
    match state.latest_frame() {
        // ロック外でコピー済みのフレームを返す
        Some(frame) if frame.is_fresh(now) => {
            ([(header::CONTENT_TYPE, "image/jpeg")], frame.encoded).into_response()
        }
        _ => text(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY),
    }
}

fn status_body(state: &StreamState, now: f64) -> Result<Vec<u8>> {
    serde_json::to_vec(&state.status(now)).context("status encode")
}

pub fn status_response(state: &StreamState, now: f64) -> Response {
    match status_body(state, now) {
        Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(e) => {
            tracing::error!("pull: request error: {e:#}");
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Server Error: {e}"))
        }
    }
}

async fn latest_frame(State(state): State<SharedState>) -> Response {
    frame_response(&state, state.now())
}

async fn status(State(state): State<SharedState>) -> Response {
    status_response(&state, state.now())
}

async fn not_found() -> Response {
    text(StatusCode::NOT_FOUND, "Not Found")
}

/// プリフライトはここで打ち切り、それ以外はリクエスト数に数える
async fn preflight_and_count(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    state.record_request();
    next.run(request).await
}

async fn common_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    for (name, value) in COMMON_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

fn get_only(handler: MethodRouter<SharedState>) -> MethodRouter<SharedState> {
    // GET 以外のメソッドも 404
    handler.fallback(not_found)
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get_only(get(latest_frame)))
        .route("/stream", get_only(get(latest_frame)))
        .route("/status", get_only(get(status)))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            preflight_and_count,
        ))
        .layer(middleware::map_response(common_headers))
        .with_state(state)
}

/// `/`・`/stream`・`/status` を返すポーリング用サーバ
pub struct PullServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PullServer {
    /// 127.0.0.1:`port` で待ち受ける。tokio ランタイム内で呼ぶこと
    pub fn start(port: u16, state: SharedState) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("failed to bind pull server port {port}"))?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);
        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("pull: server error: {e}");
            }
        });

        tracing::info!("pull: serving http://{local_addr}/stream");

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 受付を止めて最大1秒待つ。タイムアウトしたらタスクを打ち切る
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(STOP_WAIT, &mut handle).await {
            Ok(_) => tracing::info!("pull: stopped"),
            Err(_) => {
                tracing::warn!("pull: server did not stop within {STOP_WAIT:?}");
                handle.abort();
            }
        }
    }
}

impl Drop for PullServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
