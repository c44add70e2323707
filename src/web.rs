//! HTTP/WebSocket surface (spec §6.1, ambient health routes).
//!
//! Grounded in the teacher's axum router setup in `main.rs` and the
//! original's `server.py`/`manager.py` (health routes returning
//! `{"status":"ok"}`, auth-then-admission-then-accept sequencing).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    extract::ws::{Message, WebSocket},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::adapter::{AdapterConfig, EngineAdapter};
use crate::admission::ConnectionManager;
use crate::config::GatewayConfig;
use crate::dispatch::DispatchContext;
use crate::engine::EngineConnectionFactory;
use crate::message_loop::{self, FrameOutcome, FrameSource, LoopExit, MessageLoopConfig};
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::session::SessionState;
use crate::watchdog::{ExpiryReason, Watchdog};
use crate::writer::{ClientSink, EnvelopeWriter};

#[derive(Clone)]
pub struct AppState {
    pub config: &'static GatewayConfig,
    pub connections: Arc<ConnectionManager>,
    pub engine_factory: Arc<dyn EngineConnectionFactory>,
}

pub fn build_router(state: AppState) -> Router {
    let ws_path = state.config.web.ws_path.clone();
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route(&ws_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct WsAuthQuery {
    api_key: Option<String>,
}

/// Constant-time string comparison for the API key check (spec §6.1).
/// Hand-rolled rather than pulled from a dedicated crate: the comparison
/// is a single short-lived check, not a cryptographic primitive the rest
/// of the gateway builds on.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn extract_api_key(headers: &HeaderMap, query: &WsAuthQuery) -> Option<String> {
    if let Some(key) = &query.api_key {
        if !key.is_empty() {
            return Some(key.clone());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let presented = extract_api_key(&headers, &query).unwrap_or_default();
    let authenticated =
        !state.config.web.api_key.is_empty() && constant_time_eq(&presented, &state.config.web.api_key);

    if !authenticated {
        return ws.on_upgrade(|socket| async move {
            reject_connection(socket, "authentication_failed", "authentication required", 4001).await;
        });
    }

    let Some(slot) = state.connections.try_admit() else {
        return ws.on_upgrade(|socket| async move {
            reject_connection(socket, "server_at_capacity", "server at capacity", 4002).await;
        });
    };

    ws.on_upgrade(move |socket| async move {
        run_session(socket, state.clone()).await;
        state.connections.release(slot);
    })
}

async fn reject_connection(socket: WebSocket, code: &str, message: &str, close_code: u16) {
    let (mut sender, _recv) = socket.split();
    let envelope = crate::codec::serialize(
        "error",
        crate::codec::UNKNOWN_SESSION_ID,
        crate::codec::UNKNOWN_REQUEST_ID,
        serde_json::json!({ "code": code, "message": message, "details": {} }),
    );
    let _ = sender.send(Message::Text(envelope)).await;
    let _ = sender
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: close_code,
            reason: message.to_string().into(),
        })))
        .await;
}

struct WsFrameSource {
    recv: futures::stream::SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv_text(&mut self, timeout: Duration) -> FrameOutcome {
        match tokio::time::timeout(timeout, self.recv.next()).await {
            Err(_) => FrameOutcome::TimedOut,
            Ok(None) => FrameOutcome::Closed,
            Ok(Some(Err(_))) => FrameOutcome::Closed,
            Ok(Some(Ok(Message::Text(text)))) => FrameOutcome::Text(text),
            Ok(Some(Ok(Message::Close(_)))) => FrameOutcome::Closed,
            Ok(Some(Ok(_))) => FrameOutcome::TimedOut,
        }
    }
}

struct WsClientSink {
    sender: tokio::sync::Mutex<futures::stream::SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl ClientSink for WsClientSink {
    async fn send(&self, text: String) {
        let mut sender = self.sender.lock().await;
        if let Err(e) = sender.send(Message::Text(text)).await {
            warn!(error = %e, "failed to write client envelope");
        }
    }
}

async fn run_session(socket: WebSocket, state: AppState) {
    let (ws_sender, ws_recv) = socket.split();
    let client_sink: Arc<dyn ClientSink> = Arc::new(WsClientSink {
        sender: tokio::sync::Mutex::new(ws_sender),
    });
    let frame_source: Box<dyn FrameSource> = Box::new(WsFrameSource { recv: ws_recv });

    let watchdog = Watchdog::new();
    let session = Arc::new(SessionState::new(watchdog.clone()));
    let writer = Arc::new(EnvelopeWriter::new(session.clone(), client_sink));

    let engine = state.engine_factory.new_connection(writer.clone());
    let adapter = EngineAdapter::new(
        AdapterConfig {
            served_model_name: state.config.model.served_model_name.clone(),
            sample_rate_hz: state.config.model.sample_rate_hz,
            internal_roll: state.config.streaming.stt_internal_roll,
            segment_seconds: state.config.streaming.stt_segment_seconds.max(1.0),
            overlap_seconds: state.config.streaming.stt_segment_overlap_seconds,
            max_backlog_seconds: state.config.streaming.stt_max_backlog_seconds,
            engine_max_context_tokens: state.config.streaming.engine_max_context_tokens,
            audio_token_headroom: state.config.streaming.audio_token_headroom,
            generation_timeout: Duration::from_secs(120),
        },
        engine,
        writer.clone(),
    );
    let _feeder_handle = adapter.spawn_feeder();

    let ctx = Arc::new(DispatchContext {
        session: session.clone(),
        adapter: adapter.clone(),
        writer: writer.clone(),
        served_model_name: state.config.model.served_model_name.clone(),
        max_utterance_audio_seconds: state.config.limits.max_utterance_audio_seconds,
        bytes_per_second: state.config.model.bytes_per_second(),
    });

    let (inbound_tx, inbound_rx) = mpsc::channel(state.config.limits.inbound_queue_max);
    let processor_handle = tokio::spawn(message_loop::run_processor(inbound_rx, ctx, session.clone()));

    let session_for_watchdog = session.clone();
    let expiry_reason: Arc<std::sync::Mutex<Option<ExpiryReason>>> = Arc::new(std::sync::Mutex::new(None));
    let expiry_reason_for_cb = expiry_reason.clone();
    let watchdog_handle = watchdog.spawn(
        state.config.lifecycle.idle_timeout_s,
        state.config.lifecycle.watchdog_tick_s,
        state.config.lifecycle.max_connection_duration_s,
        move || session_for_watchdog.is_busy(),
        move |reason: ExpiryReason| {
            *expiry_reason_for_cb.lock().unwrap() = Some(reason);
        },
    );

    let message_limiter = Arc::new(std::sync::Mutex::new(SlidingWindowRateLimiter::new(
        "message",
        state.config.limits.ws_max_messages_per_window,
        state.config.limits.ws_message_window_seconds,
    )));
    let cancel_limiter = Arc::new(std::sync::Mutex::new(SlidingWindowRateLimiter::new(
        "cancel",
        state.config.limits.ws_max_cancels_per_window,
        state.config.limits.ws_cancel_window_seconds,
    )));

    let exit = message_loop::run_receiver(
        frame_source,
        MessageLoopConfig {
            watchdog_tick_s: state.config.lifecycle.watchdog_tick_s,
            inbound_queue_max: state.config.limits.inbound_queue_max,
        },
        watchdog.clone(),
        writer.clone(),
        message_limiter,
        cancel_limiter,
        inbound_tx,
    )
    .await;

    info!(?exit, "session ended");
    watchdog.stop();
    adapter.cancel().await;
    drop(processor_handle);
    drop(watchdog_handle);

    let reason = *expiry_reason.lock().unwrap();
    let (close_code, close_reason) = exit_to_close_reason(exit, reason);
    info!(close_code, close_reason, "session close reason resolved");
}

fn exit_to_close_reason(exit: LoopExit, expiry: Option<ExpiryReason>) -> (u16, &'static str) {
    match exit {
        LoopExit::ClientEnd => (1000, "client end"),
        LoopExit::SocketClosed => (1000, "socket closed"),
        LoopExit::WatchdogExpired => {
            let reason = expiry.unwrap_or(ExpiryReason::Idle);
            (reason.close_code(), reason.reason_text())
        }
        LoopExit::InboundQueueOverflow => (4002, "inbound queue full"),
    }
}
