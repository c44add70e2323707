//! Per-session message loop (spec §4.H): a receiver task and a processor
//! task decoupled by a bounded inbound queue.
//!
//! Grounded in the original's `run_message_loop` / `_receive_and_enqueue` /
//! `_inbound_processor_loop` / `_recv_text_with_watchdog`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::{self, Envelope};
use crate::dispatch::DispatchContext;
use crate::error::GatewayError;
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::watchdog::Watchdog;
use crate::writer::EnvelopeWriter;

/// Abstracts the WebSocket transport so the loop can be driven by a real
/// socket or a fake in tests.
#[async_trait]
pub trait FrameSource: Send {
    /// `Ok(Some(text))` on a text frame, `Ok(None)` on clean socket
    /// closure, `Err(())` on timeout (caller re-checks `should_close`).
    async fn recv_text(&mut self, timeout: Duration) -> FrameOutcome;
}

pub enum FrameOutcome {
    Text(String),
    Closed,
    TimedOut,
}

pub struct MessageLoopConfig {
    pub watchdog_tick_s: f64,
    pub inbound_queue_max: usize,
}

/// Why the receiver stopped; drives the final close frame the caller
/// sends on the real socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    ClientEnd,
    SocketClosed,
    WatchdogExpired,
    InboundQueueOverflow,
}

/// Runs the receiver half: reads frames, handles control messages inline,
/// rate-limits and enqueues data messages. Returns when the socket closes,
/// the client sends `end`, the watchdog requests a stop, or the inbound
/// queue overflows.
pub async fn run_receiver(
    mut source: Box<dyn FrameSource>,
    config: MessageLoopConfig,
    watchdog: Watchdog,
    writer: Arc<EnvelopeWriter>,
    message_limiter: Arc<std::sync::Mutex<SlidingWindowRateLimiter>>,
    cancel_limiter: Arc<std::sync::Mutex<SlidingWindowRateLimiter>>,
    inbound_tx: mpsc::Sender<Envelope>,
) -> LoopExit {
    let timeout = Duration::from_secs_f64((config.watchdog_tick_s * 2.0).max(1.0));

    loop {
        if watchdog.should_close() {
            return LoopExit::WatchdogExpired;
        }

        let outcome = source.recv_text(timeout).await;
        let text = match outcome {
            FrameOutcome::TimedOut => continue,
            FrameOutcome::Closed => return LoopExit::SocketClosed,
            FrameOutcome::Text(t) => t,
        };

        watchdog.touch();

        let envelope = match codec::parse(&text) {
            Ok(env) => env,
            Err(e) => {
                writer
                    .send_error("invalid_message", &e.to_string(), serde_json::json!({}))
                    .await;
                continue;
            }
        };

        match envelope.msg_type.as_str() {
            "ping" => {
                writer.send_pong().await;
                continue;
            }
            "pong" => {
                continue;
            }
            "end" => {
                writer.send_session_end().await;
                return LoopExit::ClientEnd;
            }
            _ => {}
        }

        let limiter = if envelope.msg_type == "cancel" {
            Some(&cancel_limiter)
        } else {
            Some(&message_limiter)
        };

        if let Some(limiter) = limiter {
            let result = limiter.lock().unwrap().consume();
            if let Err(GatewayError::RateLimitExceeded {
                kind,
                retry_in,
                limit,
                window_seconds,
            }) = result
            {
                let err = GatewayError::RateLimitExceeded {
                    kind,
                    retry_in,
                    limit,
                    window_seconds,
                };
                writer.send_error(err.code(), "rate limit exceeded", err.details()).await;
                continue;
            }
        }

        if inbound_tx.try_send(envelope).is_err() {
            writer
                .send_error(
                    "internal_error",
                    "inbound queue full",
                    serde_json::json!({ "inbound_queue_max": config.inbound_queue_max }),
                )
                .await;
            return LoopExit::InboundQueueOverflow;
        }
    }
}

/// Runs the processor half: drains the inbound queue strictly FIFO and
/// invokes the matching dispatch handler.
pub async fn run_processor(mut inbound_rx: mpsc::Receiver<Envelope>, ctx: Arc<DispatchContext>, session: Arc<crate::session::SessionState>) {
    while let Some(envelope) = inbound_rx.recv().await {
        session.observe_session_id(&envelope.session_id);
        session.set_request_id(&envelope.request_id);

        match envelope.msg_type.as_str() {
            "session.update" => ctx.handle_session_update(&envelope.request_id, envelope.payload).await,
            "input_audio_buffer.commit" => ctx.handle_commit(&envelope.request_id, envelope.payload).await,
            "input_audio_buffer.append" => ctx.handle_append(&envelope.request_id, envelope.payload).await,
            "cancel" => ctx.handle_cancel(envelope.payload).await,
            other => {
                ctx.writer
                    .send_error(
                        "invalid_message",
                        &format!("unknown message type '{other}'"),
                        serde_json::json!({}),
                    )
                    .await;
            }
        }
    }
}
