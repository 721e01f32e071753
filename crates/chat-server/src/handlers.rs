//! Connection handlers for the Pulse Chat server.
//!
//! Each WebSocket maps to one hub connection. Clients send JSON text
//! commands and get JSON text replies; channel events arrive as binary
//! frames produced by the event codec.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pulse_chat_core::model::{
    Attachment, Channel, ChannelKind, ChannelMember, MemberRole, Message as ChatMessage,
    MessageQuery,
};
use pulse_chat_core::store::BlobStore;
use pulse_chat_core::{
    ChatError, ChatResult, ChatService, InMemoryStore, LocalBlobStore, SendMessage, UploadRequest,
};
use pulse_chat_protocol::{ClientCommand, ServerReply};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Most messages returned by one history request.
const MAX_HISTORY_PAGE: usize = 200;

/// Shared server state.
pub struct AppState {
    /// The messaging core.
    pub service: Arc<ChatService>,
    /// Server configuration.
    pub config: Config,
    /// Fires when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the core over an in-memory store and the given blob store, then
    /// create the configured moderation rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the core cannot be opened or a seed rule is invalid.
    pub async fn new(config: Config, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        let service = ChatService::open(store, blobs, config.core_config())
            .await
            .context("Failed to open chat service")?;

        for rule in &config.moderation.rules {
            let created = service
                .moderation()
                .create_rule(rule.clone())
                .await
                .with_context(|| format!("Invalid moderation rule {:?}", rule.pattern))?;
            debug!(rule = %created.id, pattern = %created.pattern, "Seeded moderation rule");
        }

        Ok(Self {
            service: Arc::new(service),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Build the state with blobs on the local filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be created.
    pub async fn open(config: Config) -> Result<Self> {
        let dir = config.attachments.storage_path();
        let blobs = LocalBlobStore::new(&dir, config.attachments.public_url.clone())
            .await
            .with_context(|| format!("Failed to open blob storage at {}", dir.display()))?;
        Self::new(config, Arc::new(blobs)).await
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = usize::try_from(state.config.attachments.pipeline.max_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/channels", post(create_channel))
        .route("/channels/:channel_id/members", post(add_member))
        .route("/channels/:channel_id/messages", get(list_messages))
        .route(
            "/messages/:message_id/attachments",
            post(upload_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/attachments/:attachment_id", delete(delete_attachment))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until shutdown.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Pulse Chat server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}?user_id=<uuid>",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    Ok(())
}

/// Resolve on Ctrl-C or when `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// A core error as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ChatError::AttachmentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ChatError::InvalidAttachmentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ChatError::Moderated { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            ChatError::Storage(_) | ChatError::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        metrics::record_error(self.0.code());
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.hub().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "channels": stats.channel_count,
    }))
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CreateChannelRequest {
    name: String,
    kind: ChannelKind,
    creator_id: Uuid,
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<Channel>), ApiError> {
    let channel = state
        .service
        .create_channel(&req.name, req.kind, req.creator_id)
        .await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    actor_id: Uuid,
    user_id: Uuid,
    #[serde(default)]
    role: Option<MemberRole>,
}

async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<ChannelMember>), ApiError> {
    let member = state
        .service
        .add_member(
            channel_id,
            req.actor_id,
            req.user_id,
            req.role.unwrap_or(MemberRole::Member),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    user_id: Uuid,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    before: Option<DateTime<Utc>>,
    #[serde(default)]
    before_id: Option<Uuid>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let mut query = MessageQuery {
        before: params.before,
        before_id: params.before_id,
        ..MessageQuery::default()
    };
    if let Some(limit) = params.limit {
        query.limit = limit.clamp(1, MAX_HISTORY_PAGE);
    }

    let messages = state
        .service
        .get_channel_messages(channel_id, params.user_id, &query)
        .await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    user_id: Uuid,
    channel_id: Uuid,
    filename: String,
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Attachment>), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let request = UploadRequest {
        filename: params.filename,
        content_type,
        size: body.len() as u64,
        message_id,
        channel_id: params.channel_id,
        uploader_id: params.user_id,
    };

    let cancel = state.shutdown.child_token();
    let attachment = state
        .service
        .attachments()
        .upload(request, std::io::Cursor::new(body), &cancel)
        .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn delete_attachment(
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<Uuid>,
    Query(params): Query<UserParams>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .attachments()
        .delete(attachment_id, params.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserParams>,
) -> Response {
    if state.service.hub().connection_count() >= state.config.limits.max_connections {
        warn!(user = %params.user_id, "Connection limit reached");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, params.user_id))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user_id: Uuid) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut handle = match state.service.connect(user_id).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(user = %user_id, error = %e, "Failed to open hub connection");
            metrics::record_error(e.code());
            return;
        }
    };
    let connection_id = handle.id();
    metrics::record_hub_stats(&state.service.hub().stats());

    debug!(connection = %connection_id, user = %user_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(state.config.heartbeat.interval());
    heartbeat.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Events fanned out by the hub
            frame = handle.recv() => {
                match frame {
                    Some(frame) => {
                        metrics::record_frame(frame.len(), "outbound");
                        if sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!(connection = %connection_id, "Hub closed connection");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_frame(text.len(), "inbound");
                        let reply = handle_text(&text, user_id, &state).await;
                        if send_reply(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        let reply = ServerReply::error(0, "bad_request", "commands must be JSON text frames");
                        if send_reply(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_pong.elapsed() > state.config.heartbeat.timeout() {
                    warn!(connection = %connection_id, "Heartbeat timeout, dropping connection");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.service.disconnect(connection_id);
    drop(handle);
    metrics::record_hub_stats(&state.service.hub().stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Parse and run one text command.
async fn handle_text(text: &str, user_id: Uuid, state: &AppState) -> ServerReply {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => {
            let name = command_name(&command);
            let start = Instant::now();
            let reply = dispatch_command(command, user_id, state).await;
            metrics::record_command(name, start.elapsed().as_secs_f64());
            reply
        }
        Err(e) => {
            debug!(user = %user_id, error = %e, "Malformed command");
            metrics::record_error("bad_request");
            ServerReply::error(0, "bad_request", e.to_string())
        }
    }
}

fn command_name(command: &ClientCommand) -> &'static str {
    match command {
        ClientCommand::SendMessage { .. } => "send_message",
        ClientCommand::EditMessage { .. } => "edit_message",
        ClientCommand::DeleteMessage { .. } => "delete_message",
        ClientCommand::AddReaction { .. } => "add_reaction",
        ClientCommand::RemoveReaction { .. } => "remove_reaction",
        ClientCommand::MarkRead { .. } => "mark_read",
        ClientCommand::Ping { .. } => "ping",
    }
}

#[derive(Serialize)]
struct Removed {
    removed: bool,
}

async fn dispatch_command(command: ClientCommand, user_id: Uuid, state: &AppState) -> ServerReply {
    let service = &state.service;

    match command {
        ClientCommand::SendMessage {
            request_id,
            channel_id,
            content,
            parent_id,
        } => {
            let mut request = SendMessage::new(channel_id, user_id, content);
            if let Some(parent_id) = parent_id {
                request = request.reply_to(parent_id);
            }
            let result = service.send_message(request).await;
            if let Ok(message) = &result {
                spawn_mark_delivered(state, message.id);
            }
            reply(request_id, result)
        }

        ClientCommand::EditMessage {
            request_id,
            message_id,
            content,
        } => reply(
            request_id,
            service.edit_message(message_id, user_id, &content).await,
        ),

        ClientCommand::DeleteMessage {
            request_id,
            message_id,
        } => reply(request_id, service.delete_message(message_id, user_id).await),

        ClientCommand::AddReaction {
            request_id,
            message_id,
            emoji,
        } => reply(
            request_id,
            service.add_reaction(message_id, user_id, &emoji).await,
        ),

        ClientCommand::RemoveReaction {
            request_id,
            message_id,
            emoji,
        } => reply(
            request_id,
            service
                .remove_reaction(message_id, user_id, &emoji)
                .await
                .map(|removed| Removed { removed }),
        ),

        ClientCommand::MarkRead {
            request_id,
            message_id,
        } => reply(request_id, service.mark_read(message_id, user_id).await),

        ClientCommand::Ping { timestamp } => ServerReply::Pong { timestamp },
    }
}

/// Advance recipients to `delivered` once the message has been handed to
/// the hub.
fn spawn_mark_delivered(state: &AppState, message_id: Uuid) {
    let delivery = Arc::clone(state.service.delivery());
    tokio::spawn(async move {
        if let Err(e) = delivery.mark_delivered(message_id).await {
            warn!(message = %message_id, error = %e, "Failed to mark message delivered");
        }
    });
}

fn reply<T: Serialize>(request_id: u64, result: ChatResult<T>) -> ServerReply {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => ServerReply::Ok { request_id, data },
            Err(e) => {
                error!(request_id, error = %e, "Failed to serialize reply");
                metrics::record_error("serialize");
                ServerReply::error(request_id, "internal", "failed to serialize reply")
            }
        },
        Err(e) => {
            metrics::record_error(e.code());
            if e.is_client_error() {
                debug!(request_id, error = %e, "Command rejected");
            } else {
                error!(request_id, error = %e, "Command failed");
            }
            ServerReply::error(request_id, e.code(), e.to_string())
        }
    }
}

/// Send a reply as a JSON text frame.
async fn send_reply(sender: &mut SplitSink<WebSocket, Message>, reply: &ServerReply) -> Result<()> {
    let text = serde_json::to_string(reply)?;
    metrics::record_frame(text.len(), "outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}
