//! Sliding-window throttle for outbound API calls.
//! At most `max_calls` dispatches fall inside any window of length `period`.
//! `acquire` defers the caller until a slot frees; `try_acquire` rejects.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::translate::TranslateError;

pub struct Throttle {
    max_calls: usize,
    period: Duration,
    /// Dispatch instants inside the current window, oldest first.
    window: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            window: Mutex::new(VecDeque::with_capacity(max_calls.max(1))),
        }
    }

    /// Take a slot now, or report how long until one frees.
    fn reserve(&self, now: Instant) -> Result<(), Duration> {
        let mut window = self.window.lock();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.period {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() < self.max_calls {
            window.push_back(now);
            return Ok(());
        }
        // Window is full: the oldest entry decides when the next slot opens.
        let oldest = window[0];
        Err((oldest + self.period).saturating_duration_since(now))
    }

    /// Non-blocking: reject with `Throttled` when the window is full.
    pub fn try_acquire(&self) -> Result<(), TranslateError> {
        self.reserve(Instant::now())
            .map_err(|wait| TranslateError::Throttled {
                retry_after_ms: wait.as_millis().max(1) as u64,
            })
    }

    /// Wait for a slot. Returns `Cancelled` if the token fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Duration, TranslateError> {
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(TranslateError::Cancelled);
            }
            match self.reserve(Instant::now()) {
                Ok(()) => return Ok(start.elapsed()),
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "throttle window full, deferring");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
                    }
                }
            }
        }
    }

    /// Calls dispatched in the window ending now.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.window
            .lock()
            .iter()
            .filter(|&&t| now.duration_since(t) < self.period)
            .count()
    }
}
