use crate::error::{EngineError, EngineResult};
use crate::retry::{sleep_or_cancel, CancelSignal};
use log::warn;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// At most `max_calls` per one-minute window. A caller over the limit waits
/// for the window to roll over instead of being rejected.
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    window_start: Option<Instant>,
    calls_in_window: u32,
}

impl RateLimiter {
    pub fn new(max_calls: u32) -> EngineResult<Self> {
        Self::with_window(max_calls, WINDOW)
    }

    pub fn with_window(max_calls: u32, window: Duration) -> EngineResult<Self> {
        if max_calls == 0 {
            return Err(EngineError::Configuration(
                "rate limiter requires at least one call per window".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(EngineError::Configuration(
                "rate limiter window must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            max_calls,
            window,
            state: Mutex::new(WindowState::default()),
        })
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    /// Reserves one call slot, sleeping until the window resets if needed.
    /// The lock is held across the wait so queued callers are served in order.
    pub async fn acquire(&self, cancel: Option<&CancelSignal>) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let window_expired = state
            .window_start
            .map(|start| now.duration_since(start) >= self.window)
            .unwrap_or(true);
        if window_expired {
            state.window_start = Some(now);
            state.calls_in_window = 0;
        }

        if state.calls_in_window >= self.max_calls {
            let elapsed = state
                .window_start
                .map(|start| now.duration_since(start))
                .unwrap_or_default();
            let wait = self.window.saturating_sub(elapsed);
            warn!(
                "Rate limit reached. Sleeping for {:.1} seconds",
                wait.as_secs_f64()
            );
            sleep_or_cancel(wait, cancel).await?;
            state.window_start = Some(Instant::now());
            state.calls_in_window = 0;
        }

        state.calls_in_window += 1;
        Ok(())
    }
}
