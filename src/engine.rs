//! Engine-facing interface: the abstract inference-engine collaborator.
//!
//! The inference engine itself is out of scope (see SPEC_FULL.md §1); this
//! module only defines the narrow boundary the adapter talks across,
//! mirroring the original's `RealtimeConnectionAdapter` wrapping a
//! vLLM `RealtimeConnection`. Grounded in the teacher's
//! `VoiceInferenceClient`/`VoiceClientError` shape for the trait's error
//! surface, generalized to an engine-agnostic trait object instead of a
//! concrete WS client, since the spec treats the engine as a pluggable
//! collaborator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

/// The sink an engine writes raw protocol events to, "as if it were a
/// WebSocket" (spec §6.4). The envelope writer implements this.
#[async_trait]
pub trait EngineSink: Send + Sync {
    async fn send_text(&self, raw_event: &str);
}

/// A live connection to one session's slice of the inference engine.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Forward a typed client event (`session.update`,
    /// `input_audio_buffer.append`, `input_audio_buffer.commit`) to the
    /// engine.
    async fn handle_event(&self, event_type: &str, payload: Value) -> GatewayResult<()>;

    /// Best-effort cleanup: cancel in-flight generation, drop buffered
    /// audio. Errors are swallowed by the caller (logged at debug).
    async fn cleanup(&self);

    /// Wait for the engine to finish generating for the current segment,
    /// bounded by `timeout`. Used around segment rolls and final commits.
    async fn await_generation(&self, timeout: Duration) -> GatewayResult<()>;
}

/// Constructs a fresh [`EngineConnection`] bound to a per-session sink.
/// Mirrors the original's `runtime_deps.realtime_bridge.new_connection`.
pub trait EngineConnectionFactory: Send + Sync {
    fn new_connection(&self, sink: Arc<dyn EngineSink>) -> Arc<dyn EngineConnection>;
}

#[cfg(any(test, feature = "mock-engine"))]
pub mod mock {
    //! In-process fake engine used by tests and the integration harness.
    //! Echoes appended audio length back as deterministic transcript text
    //! so segment rolling / dedup behavior can be exercised without a real
    //! inference backend.

    use super::*;
    use tokio::sync::Mutex;

    pub struct MockEngine {
        sink: Arc<dyn EngineSink>,
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        segment_word_count: u64,
        words: Vec<&'static str>,
    }

    const WORD_BANK: &[&str] = &[
        "the", "quick", "brown", "fox", "jumps", "over", "the", "lazy", "dog", "again",
    ];

    impl MockEngine {
        pub fn new(sink: Arc<dyn EngineSink>) -> Self {
            Self {
                sink,
                state: Mutex::new(MockState::default()),
            }
        }

        async fn emit(&self, event: Value) {
            self.sink.send_text(&event.to_string()).await;
        }
    }

    #[async_trait]
    impl EngineConnection for MockEngine {
        async fn handle_event(&self, event_type: &str, payload: Value) -> GatewayResult<()> {
            match event_type {
                "session.update" => {
                    self.emit(serde_json::json!({"type": "session.updated"})).await;
                }
                "input_audio_buffer.append" => {
                    let mut state = self.state.lock().await;
                    let idx = (state.segment_word_count as usize) % WORD_BANK.len();
                    state.words.push(WORD_BANK[idx]);
                    state.segment_word_count += 1;
                    let delta = format!("{} ", WORD_BANK[idx]);
                    drop(state);
                    self.emit(serde_json::json!({"type": "transcription.delta", "delta": delta}))
                        .await;
                }
                "input_audio_buffer.commit" => {
                    let is_final = payload
                        .get("final")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if is_final {
                        let mut state = self.state.lock().await;
                        let words = std::mem::take(&mut state.words);
                        state.segment_word_count = 0;
                        drop(state);
                        let text = words.join(" ");
                        self.emit(serde_json::json!({"type": "transcription.done", "text": text}))
                            .await;
                    }
                }
                _ => {}
            }
            Ok(())
        }

        async fn cleanup(&self) {
            let mut state = self.state.lock().await;
            state.words.clear();
            state.segment_word_count = 0;
        }

        async fn await_generation(&self, _timeout: Duration) -> GatewayResult<()> {
            // The mock engine emits synchronously inline with handle_event,
            // so by the time this is called generation for the segment has
            // already completed.
            Ok(())
        }
    }

    pub struct MockEngineFactory;

    impl EngineConnectionFactory for MockEngineFactory {
        fn new_connection(&self, sink: Arc<dyn EngineSink>) -> Arc<dyn EngineConnection> {
            Arc::new(MockEngine::new(sink))
        }
    }
}
