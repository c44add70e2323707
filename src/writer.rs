//! Envelope writer (spec §4.J): translates raw engine events into client
//! envelopes.
//!
//! The engine writes to this as if it were a WebSocket (it implements
//! [`EngineSink`]); this module owns the [`TranscriptAssembler`], the
//! suppression counter used to swallow the synthetic `transcription.done`
//! emitted at a segment-roll seam, and the session_id/request_id
//! resolution the original's `EnvelopeWebSocket.send_text` performs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::assembler::TranscriptAssembler;
use crate::codec::{self, UNKNOWN_REQUEST_ID};
use crate::engine::EngineSink;
use crate::error::normalize_engine_code;
use crate::session::SessionState;

/// Destination for serialized client envelopes: the actual WebSocket
/// sender half, abstracted so the writer can be tested without a socket.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, text: String);
}

pub struct EnvelopeWriter {
    session: Arc<SessionState>,
    client: Arc<dyn ClientSink>,
    assembler: tokio::sync::Mutex<TranscriptAssembler>,
    suppress_done_count: AtomicU64,
}

impl EnvelopeWriter {
    pub fn new(session: Arc<SessionState>, client: Arc<dyn ClientSink>) -> Self {
        Self {
            session,
            client,
            assembler: tokio::sync::Mutex::new(TranscriptAssembler::new()),
            suppress_done_count: AtomicU64::new(0),
        }
    }

    /// Called by the adapter immediately before rolling a segment, so the
    /// synthetic `transcription.done` the engine emits at the seam does
    /// not surface as a client-visible `final`/`done` pair.
    pub fn suppress_next_done(&self) {
        self.suppress_done_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Reset the assembler and suppression counter for a fresh utterance.
    pub async fn reset_for_new_utterance(&self) {
        let mut assembler = self.assembler.lock().await;
        *assembler = TranscriptAssembler::new();
        self.suppress_done_count.store(0, Ordering::SeqCst);
    }

    async fn emit(&self, msg_type: &str, payload: Value) {
        let session_id = self.session.session_id();
        let request_id = self.session.resolve_outbound_request_id();
        let text = codec::serialize(msg_type, &session_id, &request_id, payload);
        self.client.send(text).await;
        self.session.watchdog.touch();
    }

    pub async fn send_pong(&self) {
        self.emit("pong", Value::Object(Default::default())).await;
    }

    pub async fn send_session_end(&self) {
        self.emit("session_end", Value::Object(Default::default())).await;
    }

    pub async fn send_cancelled(&self, reason: &str) {
        self.emit("cancelled", serde_json::json!({ "reason": reason })).await;
    }

    /// Overload drop status (spec §4.J "Status emissions").
    pub async fn send_status(
        &self,
        kind: &str,
        dropped_seconds: Option<f64>,
        max_backlog_seconds: Option<f64>,
        source: Option<&str>,
    ) {
        let mut payload = Map::new();
        payload.insert("kind".to_string(), Value::String(kind.to_string()));
        if let Some(d) = dropped_seconds {
            payload.insert("dropped_seconds".to_string(), serde_json::json!(d));
        }
        if let Some(m) = max_backlog_seconds {
            payload.insert("max_backlog_seconds".to_string(), serde_json::json!(m));
        }
        if let Some(s) = source {
            payload.insert("source".to_string(), Value::String(s.to_string()));
        }
        self.emit("status", Value::Object(payload)).await;
    }

    pub async fn send_error(&self, code: &str, message: &str, details: Value) {
        self.emit(
            "error",
            serde_json::json!({ "code": code, "message": message, "details": details }),
        )
        .await;
    }

    async fn handle_delta(&self, payload: &Value) {
        let delta = payload.get("delta").and_then(Value::as_str).unwrap_or("");
        let outcome = {
            let mut assembler = self.assembler.lock().await;
            assembler.on_delta(delta)
        };
        if let Some(token) = outcome.token {
            self.emit("token", serde_json::json!({ "text": token })).await;
        }
    }

    async fn handle_done(&self, payload: &Value) {
        let text = payload.get("text").and_then(Value::as_str);
        let (outcome, merged) = {
            let mut assembler = self.assembler.lock().await;
            assembler.on_done(text)
        };

        let request_id = self.session.resolve_outbound_request_id();
        self.session.clear_inflight_if_matches(&request_id);

        if let Some(token) = outcome.token {
            self.emit("token", serde_json::json!({ "text": token })).await;
        }

        let previous = self.suppress_done_count.load(Ordering::SeqCst);
        if previous > 0 {
            self.suppress_done_count.store(previous - 1, Ordering::SeqCst);
            return;
        }

        self.emit("final", serde_json::json!({ "normalized_text": merged })).await;
        self.emit("done", serde_json::json!({ "usage": Value::Object(Default::default()) }))
            .await;
    }

    async fn handle_error(&self, payload: &Value) {
        let request_id = self.session.resolve_outbound_request_id();
        self.session.clear_inflight_if_matches(&request_id);
        self.suppress_done_count.store(0, Ordering::SeqCst);

        let raw_code = payload.get("code").and_then(Value::as_str).unwrap_or("");
        let code = normalize_engine_code(raw_code);
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("engine error")
            .to_string();
        self.send_error(code, &message, serde_json::json!({ "reason_code": raw_code }))
            .await;
    }

    /// Anything else: forward as-is, with `type` stripped into the
    /// envelope and the remaining fields as payload.
    async fn handle_passthrough(&self, msg_type: &str, mut obj: Map<String, Value>) {
        obj.remove("type");
        self.emit(msg_type, Value::Object(obj)).await;
    }
}

#[async_trait]
impl EngineSink for EnvelopeWriter {
    async fn send_text(&self, raw_event: &str) {
        let Ok(value) = serde_json::from_str::<Value>(raw_event) else {
            return;
        };
        let Some(obj) = value.as_object() else {
            return;
        };
        let msg_type = obj.get("type").and_then(Value::as_str).unwrap_or("").to_string();

        match msg_type.as_str() {
            "transcription.delta" => self.handle_delta(&value).await,
            "transcription.done" => self.handle_done(&value).await,
            "error" => self.handle_error(&value).await,
            "" => {}
            other => self.handle_passthrough(other, obj.clone()).await,
        }
    }
}

/// Falls back to `"unknown"` when the session/request id cannot be
/// resolved at all (should not happen once [`SessionState::new`] seeds
/// both fields, kept as documentation of the contract).
#[allow(dead_code)]
const _UNKNOWN_FALLBACK: &str = UNKNOWN_REQUEST_ID;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use crate::watchdog::Watchdog;

    struct RecordingSink {
        sent: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: StdMutex::new(Vec::new()) })
        }

        fn messages(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl ClientSink for RecordingSink {
        async fn send(&self, text: String) {
            self.sent.lock().unwrap().push(text);
        }
    }

    fn new_writer() -> (Arc<EnvelopeWriter>, Arc<RecordingSink>) {
        let session = Arc::new(SessionState::new(Watchdog::new()));
        let sink = RecordingSink::new();
        let writer = Arc::new(EnvelopeWriter::new(session, sink.clone()));
        (writer, sink)
    }

    #[tokio::test]
    async fn simple_utterance_emits_tokens_then_final_and_done() {
        let (writer, sink) = new_writer();
        writer.send_text(r#"{"type":"transcription.delta","delta":"hel"}"#).await;
        writer.send_text(r#"{"type":"transcription.delta","delta":"lo"}"#).await;
        writer.send_text(r#"{"type":"transcription.done","text":"hello"}"#).await;

        let msgs = sink.messages();
        let types: Vec<&str> = msgs.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["token", "token", "final", "done"]);
        assert_eq!(msgs[2]["payload"]["normalized_text"], "hello");
    }

    #[tokio::test]
    async fn suppressed_done_emits_nothing() {
        let (writer, sink) = new_writer();
        writer.send_text(r#"{"type":"transcription.delta","delta":"the quick"}"#).await;
        writer.suppress_next_done();
        writer.send_text(r#"{"type":"transcription.done"}"#).await;
        let msgs = sink.messages();
        let types: Vec<&str> = msgs.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["token"]);
    }

    #[tokio::test]
    async fn suppressed_done_still_emits_residual_token() {
        // The engine surfaces this segment's text only via `done`, not a
        // prior delta, so the seam carries a residual token that must not
        // be dropped just because the final/done pair is suppressed.
        let (writer, sink) = new_writer();
        writer.suppress_next_done();
        writer.send_text(r#"{"type":"transcription.done","text":"the quick"}"#).await;
        let msgs = sink.messages();
        let types: Vec<&str> = msgs.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["token"]);
        assert_eq!(msgs[0]["payload"]["text"], "the quick");
    }

    #[tokio::test]
    async fn error_event_normalizes_unknown_code() {
        let (writer, sink) = new_writer();
        writer.send_text(r#"{"type":"error","code":"weird_upstream_code","message":"boom"}"#).await;
        let msgs = sink.messages();
        assert_eq!(msgs[0]["type"], "error");
        assert_eq!(msgs[0]["payload"]["code"], "internal_error");
        assert_eq!(msgs[0]["payload"]["details"]["reason_code"], "weird_upstream_code");
    }

    #[tokio::test]
    async fn passthrough_events_forward_remaining_fields_as_payload() {
        let (writer, sink) = new_writer();
        writer.send_text(r#"{"type":"session.updated","model":"m1"}"#).await;
        let msgs = sink.messages();
        assert_eq!(msgs[0]["type"], "session.updated");
        assert_eq!(msgs[0]["payload"]["model"], "m1");
    }

    #[tokio::test]
    async fn all_envelopes_carry_unknown_ids_when_none_set() {
        let (writer, sink) = new_writer();
        writer.send_pong().await;
        let msgs = sink.messages();
        assert_eq!(msgs[0]["session_id"], "unknown");
        assert_eq!(msgs[0]["request_id"], "unknown");
    }
}
