use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Query, State,
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::conversations::{Conversation, ConversationRegistry, ConversationSummary};
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::history::{DayGroups, HistoryStore};
use crate::llm::BackendFactory;
use crate::protocol::ServerFrame;
use crate::session::SessionManager;

const DEFAULT_HISTORY_LIMIT: i64 = 100;
const MAX_HISTORY_LIMIT: i64 = 500;
const DEFAULT_CONVERSATIONS_LIMIT: i64 = 50;
const MAX_CONVERSATIONS_LIMIT: i64 = 200;

/// Buffered frames per connection, each direction.
const CHANNEL_CAPACITY: usize = 100;

/// Shared by every request and connection.
#[derive(Clone)]
pub struct AppState {
    pub history: HistoryStore,
    pub registry: ConversationRegistry,
    pub factory: Arc<dyn BackendFactory>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Database, factory: Arc<dyn BackendFactory>, config: Config) -> Self {
        Self {
            history: HistoryStore::new(db.clone()),
            registry: ConversationRegistry::new(db),
            factory,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat", get(ws_chat))
        .route("/history", get(get_history))
        .route("/conversations", get(list_conversations).post(create_conversation))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `listen_addr` and serve until `shutdown` resolves.
pub async fn start_server(
    listen_addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {}", listen_addr))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving HTTP")?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok\n"
}

async fn ws_chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let span = tracing::info_span!("ws", connection_id = %Uuid::new_v4());
    ws.on_upgrade(move |socket| handle_socket(socket, state).instrument(span))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("Client connected");
    let (mut sender, mut receiver) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

    // Sole owner of the sink, so frames go out whole and in order.
    let writer = tokio::spawn(
        async move {
            while let Some(frame) = frame_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::warn!("Failed to serialize {} frame: {}", frame.kind(), e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .in_current_span(),
    );

    let reader = tokio::spawn(
        async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    let mut session = SessionManager::new(
        state.history.clone(),
        state.factory.clone(),
        frame_tx,
        &state.config,
    );
    session.run(inbound_rx).await;

    reader.abort();
    // Last sender goes with the session; the writer drains and exits.
    drop(session);
    let _ = writer.await;
    tracing::info!("Client disconnected");
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    session_id: Option<String>,
    before_id: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    session_id: String,
    groups: DayGroups,
    next_cursor: Option<i64>,
}

async fn get_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Json<HistoryResponse>> {
    let Query(query) = query?;
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("session_id is required"))?;
    let limit = bounded_limit(query.limit, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT)?;

    let page = state
        .history
        .paged_by_day(&session_id, query.before_id, limit)
        .await?;

    Ok(Json(HistoryResponse {
        session_id,
        groups: page.groups,
        next_cursor: page.next_cursor,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Conversation>> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateConversationRequest::default()
    } else {
        serde_json::from_slice::<CreateConversationRequest>(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid body: {}", e)))?
    };

    let conversation = state.registry.create(request.title).await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ConversationList {
    items: Vec<ConversationSummary>,
}

async fn list_conversations(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<ConversationList>> {
    let Query(query) = query?;
    let limit = bounded_limit(query.limit, DEFAULT_CONVERSATIONS_LIMIT, MAX_CONVERSATIONS_LIMIT)?;
    let items = state.registry.list(limit).await?;
    Ok(Json(ConversationList { items }))
}

fn bounded_limit(limit: Option<i64>, default: i64, max: i64) -> ApiResult<u32> {
    let limit = limit.unwrap_or(default);
    if !(1..=max).contains(&limit) {
        return Err(ApiError::bad_request(format!("limit must be between 1 and {}", max)));
    }
    u32::try_from(limit).map_err(|_| ApiError::bad_request("limit out of range"))
}
