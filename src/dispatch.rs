//! Dispatch handlers (spec §4.I): the four data-message handlers invoked
//! by the processor task once an envelope has cleared the codec and rate
//! limiter.
//!
//! Grounded in the original's `HANDLERS` dict (`_handle_session_update`,
//! `_handle_commit`, `_handle_append`, `_handle_cancel`).

use std::sync::Arc;

use serde_json::Value;

use crate::adapter::EngineAdapter;
use crate::codec::{AppendPayload, CancelPayload, CommitPayload, SessionUpdatePayload};
use crate::error::GatewayError;
use crate::session::SessionState;
use crate::writer::EnvelopeWriter;

pub struct DispatchContext {
    pub session: Arc<SessionState>,
    pub adapter: Arc<EngineAdapter>,
    pub writer: Arc<EnvelopeWriter>,
    pub served_model_name: String,
    pub max_utterance_audio_seconds: f64,
    pub bytes_per_second: u64,
}

impl DispatchContext {
    async fn reject(&self, reason: &'static str, message: &str, details: Value) {
        let err = GatewayError::invalid_payload_with_details(reason, message, details);
        self.writer.send_error(err.code(), message, err.details()).await;
    }

    pub async fn handle_session_update(&self, request_id: &str, payload: Value) {
        let update: SessionUpdatePayload = serde_json::from_value(payload).unwrap_or_default();
        if let Some(model) = &update.model {
            if model != &self.served_model_name {
                self.reject(
                    "unsupported_model",
                    "unsupported model",
                    serde_json::json!({ "requested": model, "served_model_name": self.served_model_name }),
                )
                .await;
                return;
            }
        }
        self.session.set_request_id(request_id);
        self.adapter.ensure_initialized().await;
        self.adapter.handle_session_update(update.model.as_deref()).await;
    }

    pub async fn handle_commit(&self, request_id: &str, payload: Value) {
        self.session.set_request_id(request_id);
        let commit: CommitPayload = serde_json::from_value(payload).unwrap_or(CommitPayload { r#final: false });

        self.adapter.ensure_initialized().await;

        if !commit.r#final {
            let active = self.session.active_request_id();
            let inflight = self.session.inflight_request_id();
            let mismatched = active.as_deref().is_some_and(|a| a != request_id)
                || inflight.as_deref().is_some_and(|i| i != request_id);
            if mismatched {
                self.adapter.cancel().await;
                self.session.set_inflight_request_id(None);
            }
            self.session.set_active_request_id(Some(request_id.to_string()));
            self.session.reset_active_request_audio_bytes();
            self.writer.reset_for_new_utterance().await;
            self.adapter.handle_commit(false).await;
            return;
        }

        let active = self.session.active_request_id();
        match active {
            None => {
                self.reject("no_active_request", "no active request to commit", serde_json::json!({}))
                    .await;
            }
            Some(active_id) if active_id != request_id => {
                self.reject(
                    "request_id_mismatch",
                    "request_id does not match the active utterance",
                    serde_json::json!({ "active_request_id": active_id }),
                )
                .await;
            }
            Some(_) => {
                self.session.set_inflight_request_id(Some(request_id.to_string()));
                self.adapter.handle_commit(true).await;
                self.session.set_active_request_id(None);
                self.session.reset_active_request_audio_bytes();
            }
        }
    }

    pub async fn handle_append(&self, request_id: &str, payload: Value) {
        let active = self.session.active_request_id();
        if active.as_deref() != Some(request_id) {
            self.reject(
                "no_active_request",
                "no active request for this append",
                serde_json::json!({}),
            )
            .await;
            return;
        }

        let append: AppendPayload = match serde_json::from_value(payload) {
            Ok(p) => p,
            Err(_) => {
                self.reject("invalid_audio", "append payload missing 'audio'", serde_json::json!({}))
                    .await;
                return;
            }
        };

        let decoded_bytes = self.adapter.handle_append(append.audio).await;

        if self.max_utterance_audio_seconds > 0.0 {
            let total_bytes = self.session.add_active_request_audio_bytes(decoded_bytes);
            let max_audio_bytes = (self.max_utterance_audio_seconds * self.bytes_per_second as f64) as u64;
            if total_bytes > max_audio_bytes {
                let received_audio_seconds = total_bytes as f64 / self.bytes_per_second as f64;
                self.writer
                    .send_error(
                        GatewayError::UtteranceTooLong {
                            max_audio_seconds: self.max_utterance_audio_seconds,
                            max_audio_bytes,
                            received_audio_seconds,
                            received_audio_bytes: total_bytes,
                        }
                        .code(),
                        "utterance exceeded maximum audio duration",
                        GatewayError::UtteranceTooLong {
                            max_audio_seconds: self.max_utterance_audio_seconds,
                            max_audio_bytes,
                            received_audio_seconds,
                            received_audio_bytes: total_bytes,
                        }
                        .details(),
                    )
                    .await;
                self.adapter.cancel().await;
                self.session.set_active_request_id(None);
                self.session.set_inflight_request_id(None);
                self.session.reset_active_request_audio_bytes();
            }
        }
    }

    pub async fn handle_cancel(&self, payload: Value) {
        let cancel: CancelPayload = serde_json::from_value(payload).unwrap_or_default();
        self.adapter.cancel().await;
        self.session.set_active_request_id(None);
        self.session.set_inflight_request_id(None);
        self.session.reset_active_request_audio_bytes();
        let reason = cancel.reason.unwrap_or_else(|| "client_request".to_string());
        self.writer.send_cancelled(&reason).await;
    }
}
