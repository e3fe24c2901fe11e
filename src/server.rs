use crate::{
    host::ShimHost,
    protocol::{Request, Response, TabId},
    session::{CoordinatorClient, TabRegistry},
    usage::UsageStore,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time};
use tokio_stream::{
    Stream, StreamExt,
    wrappers::{BroadcastStream, ReceiverStream},
};

/// Event streams never finish on their own, so graceful shutdown gets a
/// bounded wait before the listener is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ServerState {
    pub client: CoordinatorClient,
    pub registry: TabRegistry,
    pub store: UsageStore,
    pub host: ShimHost,
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/messages", post(post_message))
        .route("/v1/tabs/:tab_id/directives", get(directive_stream))
        .route("/v1/events", get(notice_stream))
        .route("/v1/host", get(host_stream))
        .with_state(Arc::new(state))
}

pub async fn spawn(listen_addr: &str, state: ServerState) -> Result<ServerHandle> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("failed to parse listen_addr {listen_addr}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let router = router(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %addr, "message endpoint started");

    Ok(ServerHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

impl ServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match time::timeout(SHUTDOWN_GRACE, &mut self.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(anyhow!(err)),
            Err(_) => {
                tracing::info!("event streams still open, closing listener");
                self.join.abort();
                Ok(())
            }
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<Request>,
) -> Result<Json<Response>, StatusCode> {
    let kind = request.kind();
    match state.client.request(request).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            tracing::warn!(kind, error = %err, "message not handled");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// One tab's observer listens here. The open stream is what marks the tab's
/// observer as loaded; dropping it unregisters the tab.
async fn directive_stream(
    State(state): State<Arc<ServerState>>,
    Path(tab_id): Path<TabId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (lease, rx) = state.registry.attach(tab_id);
    let stream = ReceiverStream::new(rx).filter_map(move |directive| {
        let _attached = &lease;
        to_event(&directive)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn notice_stream(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.store.subscribe()).filter_map(|notice| match notice {
        Ok(notice) => to_event(&notice),
        Err(err) => {
            tracing::debug!(error = %err, "notice subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn host_stream(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("browser shim attached");
    let stream = BroadcastStream::new(state.host.subscribe()).filter_map(|command| match command {
        Ok(command) => to_event(&command),
        Err(err) => {
            tracing::warn!(error = %err, "browser shim lagged, host commands dropped");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_event<T: Serialize>(payload: &T) -> Option<Result<Event, Infallible>> {
    match Event::default().json_data(payload) {
        Ok(event) => Some(Ok(event)),
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode event");
            None
        }
    }
}
