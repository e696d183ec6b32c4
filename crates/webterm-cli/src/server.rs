//! HTTP transport adapter.
//!
//! A pure mapping layer: requests become broker calls, broker errors
//! become status codes, and the subscriber's snapshot loop becomes an SSE
//! stream. No session state lives here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use futures::stream::Stream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use webterm_core::error::{parse_terminal_id, BrokerError, ErrorKind};
use webterm_core::protocol::OpenedResponse;

use crate::broker::session::{SessionBroker, Subscriber};

/// Build the application router.
///
/// Wrong-method requests on the API routes fall through to 404 rather than
/// axum's default 405; anything else is handed to the static asset
/// directory, which 404s unknown paths.
pub fn router(broker: Arc<SessionBroker>, assets: PathBuf) -> Router {
    Router::new()
        .route("/open", post(open_terminal).fallback(not_found))
        .route("/write/:id", put(write_terminal).fallback(not_found))
        .route("/read/:id", get(read_terminal).fallback(not_found))
        .fallback_service(ServeDir::new(assets))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Bind the listen address and serve until SIGINT.
pub async fn serve(listen: &str, broker: Arc<SessionBroker>, assets: PathBuf) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen:?}"))?;

    let app = router(broker, assets);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("http server error")
}

/// Map a broker error onto a transport failure code with a `[KIND]`-tagged
/// body.
fn error_response(err: &BrokerError) -> (StatusCode, String) {
    let status = match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Parse => StatusCode::BAD_REQUEST,
        ErrorKind::Allocation | ErrorKind::Spawn | ErrorKind::Io => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.tagged())
}

async fn open_terminal(State(broker): State<Arc<SessionBroker>>) -> Response {
    match broker.open().await {
        Ok(id) => Json(OpenedResponse { terminal_id: id }).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn write_terminal(
    State(broker): State<Arc<SessionBroker>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let id = match parse_terminal_id(&id) {
        Ok(id) => id,
        Err(err) => return error_response(&err).into_response(),
    };

    match broker.write(id, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn read_terminal(
    State(broker): State<Arc<SessionBroker>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_terminal_id(&id) {
        Ok(id) => id,
        Err(err) => return error_response(&err).into_response(),
    };

    match broker.subscribe(id).await {
        Ok(subscriber) => Sse::new(snapshot_stream(subscriber)).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

/// Adapt a subscriber's pull loop into an SSE event stream.
///
/// Each event carries the full accumulated output, base64-encoded with the
/// no-pad standard alphabet. The stream ends when the subscriber does;
/// axum dropping it on client disconnect stops this consumer without
/// touching the session.
fn snapshot_stream(subscriber: Subscriber) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(subscriber, |mut subscriber| async move {
        let snapshot = subscriber.next_snapshot().await?;
        let event = Event::default().data(STANDARD_NO_PAD.encode(&snapshot));
        Some((Ok(event), subscriber))
    })
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
