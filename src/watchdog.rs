//! Per-connection idle + max-duration lifecycle watchdog.
//!
//! Ported from the original `WebSocketLifecycle`: a cooperative
//! single-task loop sleeping `tick` seconds, checking max-duration first
//! (never suppressed) then idle (suppressed while "busy").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

/// Why the watchdog decided to close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Idle,
    MaxDuration,
}

impl ExpiryReason {
    pub fn close_code(self) -> u16 {
        match self {
            ExpiryReason::Idle => 4000,
            ExpiryReason::MaxDuration => 4003,
        }
    }

    pub fn reason_text(self) -> &'static str {
        match self {
            ExpiryReason::Idle => "idle timeout",
            ExpiryReason::MaxDuration => "max duration",
        }
    }
}

struct Inner {
    connection_start: Instant,
    last_activity_millis: AtomicU64,
    stop: AtomicBool,
    notify: Notify,
}

/// Shared handle to a running watchdog. Cloning shares the same underlying
/// state; `touch()` is cheap enough to call on every inbound/outbound
/// frame.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                connection_start: now,
                last_activity_millis: AtomicU64::new(0),
                stop: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Reset the idle clock to now. Invoked on every inbound client frame
    /// (regardless of validity) and every outbound envelope.
    pub fn touch(&self) {
        let elapsed = self.inner.connection_start.elapsed().as_millis() as u64;
        self.inner.last_activity_millis.store(elapsed, Ordering::Relaxed);
    }

    pub fn should_close(&self) -> bool {
        self.inner.stop.load(Ordering::Relaxed)
    }

    fn mark_expired(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        self.inner.notify.notify_waiters();
    }

    /// Force an external stop (e.g. session teardown) without an expiry
    /// reason.
    pub fn stop(&self) {
        self.mark_expired();
    }

    /// Spawn the watchdog task. `is_busy` reports whether an in-flight
    /// utterance is suppressing idle expiry; it never suppresses
    /// max-duration expiry.
    pub fn spawn<F>(
        &self,
        idle_timeout_s: f64,
        tick_s: f64,
        max_connection_duration_s: f64,
        is_busy: F,
        on_expire: impl Fn(ExpiryReason) + Send + 'static,
    ) -> JoinHandle<()>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let watchdog = self.clone();
        let tick = Duration::from_secs_f64(tick_s.max(0.001));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = watchdog.inner.notify.notified() => {}
                }
                if watchdog.should_close() {
                    return;
                }

                let elapsed_since_start = watchdog.inner.connection_start.elapsed().as_secs_f64();
                if max_connection_duration_s > 0.0 && elapsed_since_start >= max_connection_duration_s {
                    info!("watchdog: max connection duration reached");
                    watchdog.mark_expired();
                    on_expire(ExpiryReason::MaxDuration);
                    return;
                }

                if is_busy() {
                    continue;
                }

                let last_activity_ms = watchdog.inner.last_activity_millis.load(Ordering::Relaxed);
                let idle_elapsed = elapsed_since_start - (last_activity_ms as f64 / 1000.0);
                if idle_timeout_s > 0.0 && idle_elapsed >= idle_timeout_s {
                    info!("watchdog: idle timeout reached");
                    watchdog.mark_expired();
                    on_expire(ExpiryReason::Idle);
                    return;
                }
            }
        })
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_without_activity() {
        let wd = Watchdog::new();
        let fired: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let handle = wd.spawn(2.0, 0.5, 0.0, || false, move |reason| {
            assert_eq!(reason, ExpiryReason::Idle);
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(3)).await;
        let _ = handle.await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(wd.should_close());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_suppresses_idle_but_not_max_duration() {
        let wd = Watchdog::new();
        let fired: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let handle = wd.spawn(1.0, 0.25, 3.0, || true, move |reason| {
            assert_eq!(reason, ExpiryReason::MaxDuration);
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(4)).await;
        let _ = handle.await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiry_reason_maps_to_spec_close_codes() {
        assert_eq!(ExpiryReason::Idle.close_code(), 4000);
        assert_eq!(ExpiryReason::Idle.reason_text(), "idle timeout");
        assert_eq!(ExpiryReason::MaxDuration.close_code(), 4003);
        assert_eq!(ExpiryReason::MaxDuration.reason_text(), "max duration");
    }
}
