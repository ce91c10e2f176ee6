use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep of [`CancelToken::sleep`].
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Shared cancellation flag checked by every worker loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early on cancellation.
    ///
    /// Returns `false` if the token was cancelled before `dur` elapsed.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_STEP));
        }
    }
}

/// Cancel the returned token on SIGINT/SIGTERM.
pub fn setup_shutdown() -> anyhow::Result<CancelToken> {
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received");
        handler_token.cancel();
    })?;
    Ok(token)
}
