mod config;
mod coordinator;
mod engine;
mod fallback;
mod notify;
mod protocol;
mod rules;
mod store;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream::SplitSink, Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    config::SwitchConfig,
    coordinator::{submit, Coordinator, CoordinatorMessage},
    engine::JsonRuleEngine,
    fallback::{FallbackHandler, PageEvent},
    notify::PageHandle,
    protocol::{parse_page_message, Notice, PageMessage, Request, Response},
    rules::RuleSynchronizer,
    store::ToggleStore,
};

static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, config_path) = SwitchConfig::load_or_create()?;
    let store = ToggleStore::new(config.storage_document(&config_path));
    let engine = JsonRuleEngine::new(config.rules_document(&config_path));

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<CoordinatorMessage>();

    // The last value this process knows to be in the toggle document, shared
    // by the coordinator and the storage watcher. Seeded before either task
    // starts, so a write landing in between still surfaces as a change.
    let persisted = Arc::new(AtomicBool::new(match store.load() {
        Ok(value) => value,
        Err(err) => {
            warn!(?err, "could not read the toggle document; assuming replacement off");
            false
        }
    }));
    tokio::spawn(run_storage_watcher(
        store.clone(),
        inbox_tx.clone(),
        config.storage_poll_ms,
        persisted.clone(),
    ));

    let addr: SocketAddr = config
        .ws_bind
        .parse()
        .with_context(|| format!("invalid ws bind address: {}", config.ws_bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed binding listener on {addr}"))?;
    info!("page socket listening on ws://{addr}/pages");
    info!("toggle control available at http://{addr}/toggle");

    let app = routes(inbox_tx);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(?err, "http server crashed");
        }
    });

    Coordinator::new(store, RuleSynchronizer::new(engine), persisted)
        .run(inbox_rx)
        .await;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    url: String,
}

fn routes(tx: mpsc::UnboundedSender<CoordinatorMessage>) -> Router {
    Router::new()
        .route(
            "/pages",
            get({
                let tx = tx.clone();
                move |ws: WebSocketUpgrade, Query(page): Query<PageQuery>| {
                    let tx = tx.clone();
                    async move {
                        ws.on_upgrade(move |socket: WebSocket| {
                            handle_page_socket(socket, page.url, tx)
                        })
                    }
                }
            }),
        )
        .route(
            "/toggle",
            post({
                let tx = tx.clone();
                move || {
                    let tx = tx.clone();
                    async move { control_endpoint(tx, Request::Toggle).await }
                }
            }),
        )
        .route(
            "/status",
            get({
                let tx = tx.clone();
                move || {
                    let tx = tx.clone();
                    async move { control_endpoint(tx, Request::GetStatus).await }
                }
            }),
        )
        .route("/health", get(|| async { "ok" }))
}

// The UI surface: one round trip to the coordinator per call. A missing
// acknowledgment means the coordinator is gone.
async fn control_endpoint(
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
    request: Request,
) -> Result<Json<Response>, StatusCode> {
    match submit(&tx, request).await {
        Some(response) => Ok(Json(response)),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

// One task per page connection: announce it, serve it, retract it. The
// retraction is the single exit point, so once a page is announced the
// coordinator's page map cannot keep feeding a socket whose task is gone.
async fn handle_page_socket<S>(socket: S, url: String, tx: mpsc::UnboundedSender<CoordinatorMessage>)
where
    S: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Unpin,
{
    let id = NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
    let page = PageHandle {
        url,
        outbound: outbound_tx,
    };
    if tx.send(CoordinatorMessage::PageOpened { id, page }).is_err() {
        error!("coordinator inbox closed; dropping page socket");
        return;
    }
    serve_page(socket, &tx, outbound_rx).await;
    let _ = tx.send(CoordinatorMessage::PageClosed { id });
}

// Prime the page's fallback handler with the current status, then relay
// coordinator pushes and page traffic until either side goes away.
async fn serve_page<S>(
    socket: S,
    tx: &mpsc::UnboundedSender<CoordinatorMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Unpin,
{
    let Some(Response::Status { is_replacing }) = submit(tx, Request::GetStatus).await else {
        error!("coordinator inbox closed; dropping page socket");
        return;
    };
    let mut fallback = FallbackHandler::new();
    fallback.handle(PageEvent::StatusChanged { is_replacing });

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            pushed = outbound_rx.recv() => {
                let Some(payload) = pushed else { break };
                // A status push also drives this page's fallback state.
                if let Ok(Notice::StatusChanged { is_replacing }) = serde_json::from_str(&payload) {
                    fallback.handle(PageEvent::StatusChanged { is_replacing });
                }
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !process_page_text(&text, tx, &mut fallback, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!(?err, "page socket receive error");
                        break;
                    }
                }
            }
        }
    }
}

// Returns false when the socket should close (page writer or coordinator
// gone). Unknown payloads only cost a log line.
async fn process_page_text<S>(
    text: &str,
    tx: &mpsc::UnboundedSender<CoordinatorMessage>,
    fallback: &mut FallbackHandler,
    sink: &mut SplitSink<S, Message>,
) -> bool
where
    S: Sink<Message> + Unpin,
{
    match parse_page_message(text) {
        Ok(PageMessage::Request(request)) => {
            let Some(response) = submit(tx, request).await else {
                error!("coordinator inbox closed; closing page socket");
                return false;
            };
            let payload = match serde_json::to_string(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(?err, "failed serializing acknowledgment");
                    return true;
                }
            };
            sink.send(Message::Text(payload)).await.is_ok()
        }
        Ok(PageMessage::Event(event)) => {
            for effect in fallback.handle(event) {
                let payload = match serde_json::to_string(&effect) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(?err, "failed serializing page effect");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(err) => {
            warn!(?err, payload = %text, "ignored unknown payload");
            true
        }
    }
}

// The change-notification half of the storage contract: poll the document and
// report values departing from what this process last wrote or adopted. The
// shared flag keeps a foreign write visible even when it restores the old
// value within one poll interval of our own save.
async fn run_storage_watcher(
    store: ToggleStore,
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
    poll_ms: u64,
    persisted: Arc<AtomicBool>,
) {
    let interval = Duration::from_millis(poll_ms.clamp(100, 10_000));
    loop {
        sleep(interval).await;
        let current = match store.load() {
            Ok(value) => value,
            Err(err) => {
                warn!(?err, "storage watcher could not read the toggle document");
                continue;
            }
        };
        let known = persisted.load(Ordering::Relaxed);
        if current == known {
            continue;
        }
        debug!(old = known, new = current, "toggle document changed on disk");
        if tx
            .send(CoordinatorMessage::StorageChanged {
                old: known,
                new: current,
            })
            .is_err()
        {
            info!("coordinator inbox closed; stopping storage watcher");
            return;
        }
        persisted.store(current, Ordering::Relaxed);
    }
}
