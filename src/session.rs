//! Per-connection session state (spec §3 data model).
//!
//! Ported from the original `EnvelopeState` dataclass, widened with the
//! inflight/audio-byte-counter fields the distilled spec's §3 calls out
//! explicitly. Shared by the message loop, dispatch handlers, adapter, and
//! writer via a single `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::codec::{UNKNOWN_REQUEST_ID, UNKNOWN_SESSION_ID};
use crate::watchdog::Watchdog;

pub struct SessionState {
    session_id: Mutex<String>,
    request_id: Mutex<String>,
    active_request_id: Mutex<Option<String>>,
    inflight_request_id: Mutex<Option<String>>,
    active_request_audio_bytes: AtomicU64,
    pub watchdog: Watchdog,
}

impl SessionState {
    pub fn new(watchdog: Watchdog) -> Self {
        Self {
            session_id: Mutex::new(UNKNOWN_SESSION_ID.to_string()),
            request_id: Mutex::new(UNKNOWN_REQUEST_ID.to_string()),
            active_request_id: Mutex::new(None),
            inflight_request_id: Mutex::new(None),
            active_request_audio_bytes: AtomicU64::new(0),
            watchdog,
        }
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    /// The first client-supplied session_id wins; later ones are ignored
    /// to match the spec's "first client-supplied string" rule.
    pub fn observe_session_id(&self, candidate: &str) {
        let mut guard = self.session_id.lock().unwrap();
        if *guard == UNKNOWN_SESSION_ID {
            *guard = candidate.to_string();
        }
    }

    pub fn request_id(&self) -> String {
        self.request_id.lock().unwrap().clone()
    }

    pub fn set_request_id(&self, value: &str) {
        *self.request_id.lock().unwrap() = value.to_string();
    }

    pub fn active_request_id(&self) -> Option<String> {
        self.active_request_id.lock().unwrap().clone()
    }

    pub fn set_active_request_id(&self, value: Option<String>) {
        *self.active_request_id.lock().unwrap() = value;
    }

    pub fn inflight_request_id(&self) -> Option<String> {
        self.inflight_request_id.lock().unwrap().clone()
    }

    pub fn set_inflight_request_id(&self, value: Option<String>) {
        *self.inflight_request_id.lock().unwrap() = value;
    }

    /// Clears `inflight_request_id` only if it currently equals `request_id`.
    pub fn clear_inflight_if_matches(&self, request_id: &str) {
        let mut guard = self.inflight_request_id.lock().unwrap();
        if guard.as_deref() == Some(request_id) {
            *guard = None;
        }
    }

    pub fn active_request_audio_bytes(&self) -> u64 {
        self.active_request_audio_bytes.load(Ordering::Relaxed)
    }

    pub fn add_active_request_audio_bytes(&self, n: u64) -> u64 {
        self.active_request_audio_bytes.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn reset_active_request_audio_bytes(&self) {
        self.active_request_audio_bytes.store(0, Ordering::Relaxed);
    }

    /// The request_id a currently-addressed outbound envelope should carry:
    /// inflight, then active, then the last request_id seen from the
    /// client.
    pub fn resolve_outbound_request_id(&self) -> String {
        self.inflight_request_id()
            .or_else(|| self.active_request_id())
            .unwrap_or_else(|| self.request_id())
    }

    /// True while an utterance is in flight awaiting a terminal engine
    /// event; suppresses idle expiry in the watchdog.
    pub fn is_busy(&self) -> bool {
        self.inflight_request_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_locks_to_first_value() {
        let s = SessionState::new(Watchdog::new());
        assert_eq!(s.session_id(), "unknown");
        s.observe_session_id("abc");
        s.observe_session_id("def");
        assert_eq!(s.session_id(), "abc");
    }

    #[test]
    fn resolve_outbound_prefers_inflight_then_active_then_last() {
        let s = SessionState::new(Watchdog::new());
        s.set_request_id("r-last");
        assert_eq!(s.resolve_outbound_request_id(), "r-last");

        s.set_active_request_id(Some("r-active".to_string()));
        assert_eq!(s.resolve_outbound_request_id(), "r-active");

        s.set_inflight_request_id(Some("r-inflight".to_string()));
        assert_eq!(s.resolve_outbound_request_id(), "r-inflight");
    }

    #[test]
    fn clear_inflight_if_matches_is_conditional() {
        let s = SessionState::new(Watchdog::new());
        s.set_inflight_request_id(Some("r1".to_string()));
        s.clear_inflight_if_matches("r2");
        assert_eq!(s.inflight_request_id(), Some("r1".to_string()));
        s.clear_inflight_if_matches("r1");
        assert_eq!(s.inflight_request_id(), None);
    }
}
