//! The relay: authenticated WebSocket routing plus the HTTP lookups the
//! clients need (public keys, history, escrowed keys, friends).
//!
//! Each accepted frame is checked against the connection gate, stamped with an
//! id and creation time, then persisted and forwarded concurrently. Neither
//! path waits on the other; a recipient who is offline simply finds the
//! message in history later.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::{bearer_token, AuthError, Claims, TokenAuthority};
use crate::config::{GateMode, KeyCustody, RelayConfig};
use crate::gate::{ConnectionGate, FriendshipGate, OpenGate};
use crate::logging::{msg_id, peer_id};
use crate::protocol::{parse_outbound, DeliveredFrame, OutboundFrame};
use crate::registry::{ConnectionRegistry, DeliveryOutcome, FrameReceiver};
use crate::storage::{now_millis, MessageRecord, NewMessage, SharedStorage, StorageError};

/// Hands out nondecreasing creation times.
struct MessageClock {
    last: AtomicU64,
}

impl MessageClock {
    fn starting_at(floor: u64) -> Self {
        Self {
            last: AtomicU64::new(floor),
        }
    }

    fn next(&self) -> u64 {
        let now = now_millis();
        self.last.fetch_max(now, Ordering::SeqCst).max(now)
    }
}

#[derive(Clone)]
pub struct RelayState {
    config: Arc<RelayConfig>,
    storage: SharedStorage,
    registry: ConnectionRegistry,
    gate: Arc<dyn ConnectionGate>,
    authority: TokenAuthority,
    clock: Arc<MessageClock>,
    /// Client-proposed ids accepted but not yet through `append`.
    claimed_ids: Arc<Mutex<HashSet<String>>>,
}

impl RelayState {
    pub async fn new(
        config: RelayConfig,
        storage: SharedStorage,
        gate: Arc<dyn ConnectionGate>,
        authority: TokenAuthority,
    ) -> Self {
        let floor = match storage.lock().await.latest_created_at() {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!(error = %e, "relay: cannot read newest message time, clock starts at now");
                0
            }
        };
        Self {
            config: Arc::new(config),
            storage,
            registry: ConnectionRegistry::new(),
            gate,
            authority,
            clock: Arc::new(MessageClock::starting_at(floor)),
            claimed_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// State wired from configuration alone: gate chosen by `config.gate`,
    /// tokens verified with `config.jwt_secret`.
    pub async fn from_config(
        config: RelayConfig,
        storage: SharedStorage,
    ) -> Result<Self, AuthError> {
        let authority = TokenAuthority::new(&config.jwt_secret)?;
        let gate: Arc<dyn ConnectionGate> = match config.gate {
            GateMode::Friends => Arc::new(FriendshipGate::new(storage.clone())),
            GateMode::Open => Arc::new(OpenGate),
        };
        Ok(Self::new(config, storage, gate, authority).await)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn gate_name(&self) -> &'static str {
        self.gate.name()
    }

    /// Id for an accepted frame. A proposed UUID is kept only while no stored
    /// or in-flight message uses it; otherwise a fresh v4 id is minted.
    async fn claim_id(&self, sender: &str, proposed: Option<String>) -> (String, bool) {
        let Some(proposed) = proposed
            .and_then(|p| Uuid::parse_str(&p).ok())
            .map(|id| id.to_string())
        else {
            return (Uuid::new_v4().to_string(), false);
        };

        let mut claimed = self.claimed_ids.lock().await;
        let taken = claimed.contains(&proposed)
            || match self.storage.lock().await.get_message(&proposed) {
                Ok(existing) => existing.is_some(),
                Err(e) => {
                    tracing::error!(msg = %msg_id(&proposed), error = %e, "relay: id lookup failed");
                    true
                }
            };
        if taken {
            tracing::warn!(
                peer = %peer_id(sender),
                msg = %msg_id(&proposed),
                "relay: proposed id already in use, minting a fresh one"
            );
            return (Uuid::new_v4().to_string(), false);
        }
        claimed.insert(proposed.clone());
        (proposed, true)
    }

    async fn release_id(&self, id: &str) {
        self.claimed_ids.lock().await.remove(id);
    }
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/ws", get(ws_handler))
        .route("/messages/:peer_id", get(fetch_history))
        .route("/users/me/keys", get(fetch_my_keys))
        .route("/users/:user_id/public-key", get(fetch_public_key))
        .route("/friends", get(fetch_friends))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error")]
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(detail) => {
                tracing::error!("relay: request failed: {detail}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn authenticate(state: &RelayState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = bearer_token(headers)?;
    Ok(state.authority.verify(token)?)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

async fn healthcheck(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len().await,
        "gate": state.gate.name(),
    }))
}

/// Conversation with `peer_id`, projected for the caller. Messages the peer
/// sent to the caller are marked read afterwards.
async fn fetch_history(
    State(state): State<RelayState>,
    Path(peer): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let storage = state.storage.lock().await;
    let history = storage.list_conversation(&claims.id, &peer)?;
    let marked = storage.mark_read(&peer, &claims.id)?;
    drop(storage);

    tracing::debug!(
        peer = %peer_id(&claims.id),
        with = %peer_id(&peer),
        messages = history.len(),
        marked,
        "relay: history served"
    );
    Ok(Json(history))
}

async fn fetch_public_key(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers)?;
    let public_key = state.storage.lock().await.public_key(&user_id)?;
    Ok(Json(json!({ "publicKey": public_key })))
}

async fn fetch_my_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let claims = authenticate(&state, &headers)?;
    if state.config.key_custody == KeyCustody::ClientHeld {
        return Err(ApiError::NotFound(
            "private keys are held by clients on this relay".to_string(),
        ));
    }
    let keys = state
        .storage
        .lock()
        .await
        .escrowed_keys(&claims.id)?
        .ok_or_else(|| ApiError::NotFound("no escrowed key pair".to_string()))?;
    Ok(Json(keys))
}

async fn fetch_friends(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let friends = state.storage.lock().await.list_friends(&claims.id)?;
    Ok(Json(friends))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<RelayState>,
) -> Response {
    let claims = match query
        .token
        .as_deref()
        .ok_or(AuthError::MissingToken)
        .and_then(|token| state.authority.verify(token))
    {
        Ok(claims) => claims,
        Err(e) => {
            tracing::info!(error = %e, "relay: refused websocket handshake");
            return ApiError::Unauthorized(e).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_ws_connection(socket, claims.id, state))
}

async fn handle_ws_connection(mut socket: WebSocket, identity: String, state: RelayState) {
    let (handle, mut rx): (_, FrameReceiver) = state.registry.channel();
    let conn_id = handle.conn_id;
    if let Some(previous) = state.registry.register(&identity, handle).await {
        tracing::info!(
            peer = %peer_id(&identity),
            previous,
            conn_id,
            "relay: reconnected, older connection superseded"
        );
    }
    tracing::info!(peer = %peer_id(&identity), conn_id, "relay: websocket connected");

    // Set once a newer connection for the same identity takes over routing.
    let mut superseded = false;

    loop {
        tokio::select! {
            outgoing = rx.recv(), if !superseded => {
                match outgoing {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => superseded = true,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &identity, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!(peer = %peer_id(&identity), "relay: dropping binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %peer_id(&identity), error = %e, "relay: websocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.registry.unregister(&identity, conn_id).await;
    tracing::info!(peer = %peer_id(&identity), conn_id, "relay: websocket disconnected");
}

/// Validate, authorize, persist and forward one client frame. Failures are
/// logged and affect only this frame.
async fn handle_frame(state: &RelayState, sender: &str, text: &str) {
    if text.len() > state.config.max_frame_bytes {
        tracing::warn!(
            peer = %peer_id(sender),
            bytes = text.len(),
            limit = state.config.max_frame_bytes,
            "relay: dropping oversize frame"
        );
        return;
    }

    let frame = match parse_outbound(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(peer = %peer_id(sender), error = %e, "relay: dropping frame");
            return;
        }
    };

    if !state.gate.is_authorized(sender, &frame.to).await {
        tracing::warn!(
            peer = %peer_id(sender),
            to = %peer_id(&frame.to),
            "relay: sender may not message recipient, frame dropped"
        );
        return;
    }

    let OutboundFrame { to, id, payload } = frame;
    let (id, claimed) = state.claim_id(sender, id).await;
    let created_at = state.clock.next();

    let delivered = DeliveredFrame {
        id: id.clone(),
        from: sender.to_string(),
        created_at,
        payload: payload.for_recipient(),
    };
    let message = NewMessage {
        id: id.clone(),
        sender_id: sender.to_string(),
        receiver_id: to.clone(),
        created_at: Some(created_at),
        payload,
    };

    match serde_json::to_string(&delivered) {
        Ok(delivered) => {
            let store = async {
                let storage = state.storage.lock().await;
                storage.append(&message)
            };
            let route = state.registry.deliver(&to, delivered);
            let (stored, routed) = tokio::join!(store, route);
            log_outcome(sender, &message, stored, routed);
        }
        Err(e) => tracing::error!(msg = %msg_id(&id), error = %e, "relay: could not encode frame"),
    }

    if claimed {
        state.release_id(&id).await;
    }
}

fn log_outcome(
    sender: &str,
    message: &NewMessage,
    stored: Result<MessageRecord, StorageError>,
    routed: DeliveryOutcome,
) {
    let msg = msg_id(&message.id);
    let to = peer_id(&message.receiver_id);
    match stored {
        Ok(record) => tracing::info!(
            %msg,
            from = %peer_id(sender),
            %to,
            kind = record.payload.message_type().as_str(),
            "relay: stored"
        ),
        Err(e) => tracing::error!(%msg, error = %e, "relay: failed to store"),
    }
    match routed {
        DeliveryOutcome::Delivered => tracing::debug!(%msg, %to, "relay: delivered live"),
        DeliveryOutcome::Miss => {
            tracing::debug!(%msg, %to, "relay: recipient offline, left for history")
        }
    }
}
