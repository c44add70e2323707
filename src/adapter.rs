//! Engine adapter (spec §4.F): owns per-session audio flow between the
//! message loop and the abstract inference engine, including segment
//! rolling for bounded-context engines.
//!
//! Grounded in the original's `RealtimeConnectionAdapter` for the overall
//! shape (forward client events, own a feeder task) generalized per the
//! distilled spec's richer §4.F, since the original's adapter is a thin
//! wrapper and does not itself implement segment rolling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::audio_queue::TrackedAudioQueue;
use crate::engine::EngineConnection;
use crate::writer::EnvelopeWriter;

/// Engine token step (spec §6.5): ~80ms per token at 16kHz mono PCM16.
const BYTES_PER_TOKEN: u64 = 2_560;

/// Estimate decoded byte length of a base64 string without decoding it
/// (spec §4.F.5).
pub fn estimate_decoded_bytes(s: &str) -> u64 {
    if s.is_empty() {
        return 0;
    }
    let padding = s.chars().rev().take_while(|&c| c == '=').count() as u64;
    let raw = (s.len() as u64 * 3) / 4;
    raw.saturating_sub(padding)
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub served_model_name: String,
    pub sample_rate_hz: u32,
    pub internal_roll: bool,
    pub segment_seconds: f64,
    pub overlap_seconds: f64,
    pub max_backlog_seconds: f64,
    pub engine_max_context_tokens: u64,
    pub audio_token_headroom: u64,
    pub generation_timeout: Duration,
}

impl AdapterConfig {
    fn bytes_per_second(&self) -> u64 {
        self.sample_rate_hz as u64 * 2
    }

    fn safe_max_audio_bytes(&self) -> u64 {
        self.engine_max_context_tokens
            .saturating_sub(self.audio_token_headroom)
            .saturating_mul(BYTES_PER_TOKEN)
    }

    fn segment_target_bytes(&self) -> u64 {
        let configured = (self.segment_seconds * self.bytes_per_second() as f64) as u64;
        configured.min(self.safe_max_audio_bytes())
    }

    fn overlap_target_bytes(&self) -> u64 {
        (self.overlap_seconds * self.bytes_per_second() as f64) as u64
    }
}

struct PendingChunk {
    audio_b64: String,
    decoded_bytes: u64,
}

pub struct EngineAdapter {
    config: AdapterConfig,
    engine: Arc<dyn EngineConnection>,
    writer: Arc<EnvelopeWriter>,

    initialized: AtomicBool,
    active: AtomicBool,
    finalize_requested: AtomicBool,
    closing_segment: AtomicBool,
    stopped: AtomicBool,
    segment_bytes_sent: AtomicU64,
    pending_total_bytes: AtomicU64,

    pending: Mutex<VecDeque<PendingChunk>>,
    overlap_ring: Mutex<VecDeque<PendingChunk>>,
    tracked: Mutex<TrackedAudioQueue>,

    wake: Notify,
}

/// Where an overload drop happened, for the `status` envelope's `source`.
pub const OVERLOAD_SOURCE_CLIENT_BUFFER: &str = "client_buffer";
pub const OVERLOAD_SOURCE_ENGINE_QUEUE: &str = "engine_queue";

impl EngineAdapter {
    pub fn new(config: AdapterConfig, engine: Arc<dyn EngineConnection>, writer: Arc<EnvelopeWriter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            writer,
            initialized: AtomicBool::new(false),
            active: AtomicBool::new(false),
            finalize_requested: AtomicBool::new(false),
            closing_segment: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            segment_bytes_sent: AtomicU64::new(0),
            pending_total_bytes: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            overlap_ring: Mutex::new(VecDeque::new()),
            tracked: Mutex::new(TrackedAudioQueue::new()),
            wake: Notify::new(),
        })
    }

    /// Spawn the feeder task for this adapter. Call once per session.
    pub fn spawn_feeder(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_feeder().await })
    }

    pub async fn ensure_initialized(&self) {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self
                .engine
                .handle_event("session.update", json!({ "model": self.config.served_model_name }))
                .await;
        }
    }

    pub async fn handle_session_update(&self, model: Option<&str>) {
        let _ = self
            .engine
            .handle_event("session.update", json!({ "model": model }))
            .await;
    }

    pub async fn handle_commit(&self, is_final: bool) {
        if !is_final {
            self.reset_utterance_buffers().await;
            self.active.store(true, Ordering::SeqCst);
            self.finalize_requested.store(false, Ordering::SeqCst);
            self.wake.notify_one();
            let _ = self
                .engine
                .handle_event("input_audio_buffer.commit", json!({ "final": false }))
                .await;
        } else {
            self.finalize_requested.store(true, Ordering::SeqCst);
            self.wake.notify_one();
        }
    }

    /// Appends a chunk of base64 audio. Returns the estimated decoded byte
    /// count so the caller (dispatch handler) can track utterance totals.
    pub async fn handle_append(&self, audio_b64: String) -> u64 {
        let decoded_bytes = estimate_decoded_bytes(&audio_b64);
        {
            let mut pending = self.pending.lock().await;
            pending.push_back(PendingChunk { audio_b64, decoded_bytes });
        }
        let new_total = self.pending_total_bytes.fetch_add(decoded_bytes, Ordering::SeqCst) + decoded_bytes;

        let max_backlog_bytes =
            (self.config.max_backlog_seconds * self.config.bytes_per_second() as f64) as u64;
        if new_total > max_backlog_bytes {
            let dropped_bytes = self.drop_oldest_pending(max_backlog_bytes).await;
            if dropped_bytes > 0 {
                let dropped_seconds = dropped_bytes as f64 / self.config.bytes_per_second() as f64;
                self.writer
                    .send_status(
                        "overload_drop",
                        Some(dropped_seconds),
                        Some(self.config.max_backlog_seconds),
                        Some(OVERLOAD_SOURCE_CLIENT_BUFFER),
                    )
                    .await;
            }
        }

        self.wake.notify_one();
        decoded_bytes
    }

    async fn drop_oldest_pending(&self, max_backlog_bytes: u64) -> u64 {
        let mut pending = self.pending.lock().await;
        let mut dropped = 0u64;
        while self.pending_total_bytes.load(Ordering::SeqCst) > max_backlog_bytes {
            match pending.pop_front() {
                Some(chunk) => {
                    self.pending_total_bytes.fetch_sub(chunk.decoded_bytes, Ordering::SeqCst);
                    dropped += chunk.decoded_bytes;
                }
                None => break,
            }
        }
        dropped
    }

    pub async fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.reset_utterance_buffers().await;
        self.active.store(false, Ordering::SeqCst);
        self.finalize_requested.store(false, Ordering::SeqCst);
        while self.tracked.lock().await.try_get().is_some() {}
        self.engine.cleanup().await;
    }

    async fn reset_utterance_buffers(&self) {
        self.pending.lock().await.clear();
        self.overlap_ring.lock().await.clear();
        self.pending_total_bytes.store(0, Ordering::SeqCst);
        self.segment_bytes_sent.store(0, Ordering::SeqCst);
    }

    async fn push_overlap(&self, chunk: PendingChunk) {
        let mut ring = self.overlap_ring.lock().await;
        ring.push_back(chunk);
        let target = self.config.overlap_target_bytes();
        let mut total: u64 = ring.iter().map(|c| c.decoded_bytes).sum();
        while total > target {
            match ring.pop_front() {
                Some(evicted) => total -= evicted.decoded_bytes,
                None => break,
            }
        }
    }

    async fn push_tracked_and_check_backlog(&self, decoded_bytes: u64) {
        let samples = (decoded_bytes / 2) as usize;
        let mut tracked = self.tracked.lock().await;
        tracked.put(Some(vec![0i16; samples]));
        let dropped_seconds =
            tracked.drop_oldest_to_max_backlog(self.config.max_backlog_seconds, self.config.sample_rate_hz);
        drop(tracked);
        if dropped_seconds > 0.0 {
            self.writer
                .send_status(
                    "overload_drop",
                    Some(dropped_seconds),
                    Some(self.config.max_backlog_seconds),
                    Some(OVERLOAD_SOURCE_ENGINE_QUEUE),
                )
                .await;
        }
    }

    async fn roll_segment(&self) {
        self.closing_segment.store(true, Ordering::SeqCst);
        self.writer.suppress_next_done();

        if let Err(e) = self
            .engine
            .handle_event("input_audio_buffer.commit", json!({ "final": true }))
            .await
        {
            warn!(error = %e, "engine rejected segment-roll commit");
        }
        if let Err(e) = self.engine.await_generation(self.config.generation_timeout).await {
            warn!(error = %e, "timed out awaiting segment generation during roll");
        }

        self.segment_bytes_sent.store(0, Ordering::SeqCst);
        let _ = self
            .engine
            .handle_event("input_audio_buffer.commit", json!({ "final": false }))
            .await;

        let ring_snapshot: Vec<(String, u64)> = {
            let ring = self.overlap_ring.lock().await;
            ring.iter().map(|c| (c.audio_b64.clone(), c.decoded_bytes)).collect()
        };
        for (audio, bytes) in ring_snapshot {
            let _ = self
                .engine
                .handle_event("input_audio_buffer.append", json!({ "audio": audio }))
                .await;
            self.segment_bytes_sent.fetch_add(bytes, Ordering::SeqCst);
        }

        self.closing_segment.store(false, Ordering::SeqCst);
    }

    async fn final_close(&self) {
        if let Err(e) = self
            .engine
            .handle_event("input_audio_buffer.commit", json!({ "final": true }))
            .await
        {
            warn!(error = %e, "engine rejected final commit");
        }
        if let Err(e) = self.engine.await_generation(self.config.generation_timeout).await {
            warn!(error = %e, "timed out awaiting final generation");
        }
        self.active.store(false, Ordering::SeqCst);
        self.reset_utterance_buffers().await;
        self.finalize_requested.store(false, Ordering::SeqCst);
    }

    async fn run_feeder(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            if !self.active.load(Ordering::SeqCst) {
                self.wake.notified().await;
                continue;
            }

            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    return;
                }
                let popped = { self.pending.lock().await.pop_front() };
                if let Some(chunk) = popped {
                    self.pending_total_bytes.fetch_sub(chunk.decoded_bytes, Ordering::SeqCst);
                    let decoded_bytes = chunk.decoded_bytes;

                    if let Err(e) = self
                        .engine
                        .handle_event(
                            "input_audio_buffer.append",
                            json!({ "audio": chunk.audio_b64.clone() }),
                        )
                        .await
                    {
                        debug!(error = %e, "engine append failed");
                    }
                    self.segment_bytes_sent.fetch_add(decoded_bytes, Ordering::SeqCst);

                    self.push_tracked_and_check_backlog(decoded_bytes).await;
                    self.push_overlap(chunk).await;

                    if self.config.internal_roll
                        && !self.finalize_requested.load(Ordering::SeqCst)
                        && self.segment_bytes_sent.load(Ordering::SeqCst) >= self.config.segment_target_bytes()
                    {
                        self.roll_segment().await;
                    }
                    continue;
                }

                if self.finalize_requested.load(Ordering::SeqCst) {
                    self.final_close().await;
                    break;
                }
                break;
            }

            if self.active.load(Ordering::SeqCst) {
                self.wake.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_decoded_bytes_accounts_for_padding() {
        assert_eq!(estimate_decoded_bytes(""), 0);
        // "YQ==" decodes to 1 byte ('a').
        assert_eq!(estimate_decoded_bytes("YQ=="), 1);
        // "YWI=" decodes to 2 bytes ('a','b').
        assert_eq!(estimate_decoded_bytes("YWI="), 2);
        // "YWJj" decodes to 3 bytes ('a','b','c'), no padding.
        assert_eq!(estimate_decoded_bytes("YWJj"), 3);
    }

    #[test]
    fn segment_target_respects_safe_context_ceiling() {
        let config = AdapterConfig {
            served_model_name: "m".into(),
            sample_rate_hz: 16_000,
            internal_roll: true,
            segment_seconds: 3600.0,
            overlap_seconds: 0.8,
            max_backlog_seconds: 5.0,
            engine_max_context_tokens: 100,
            audio_token_headroom: 50,
            generation_timeout: Duration::from_secs(1),
        };
        // safe_max_audio_bytes = (100-50)*2560 = 128000, far below the
        // 3600s*32000 byte/s configured target, so the ceiling wins.
        assert_eq!(config.segment_target_bytes(), 128_000);
    }

    #[test]
    fn overlap_target_bytes_from_seconds() {
        let config = AdapterConfig {
            served_model_name: "m".into(),
            sample_rate_hz: 16_000,
            internal_roll: true,
            segment_seconds: 60.0,
            overlap_seconds: 0.8,
            max_backlog_seconds: 5.0,
            engine_max_context_tokens: 4096,
            audio_token_headroom: 64,
            generation_timeout: Duration::from_secs(1),
        };
        assert_eq!(config.overlap_target_bytes(), (0.8 * 32_000.0) as u64);
    }
}
