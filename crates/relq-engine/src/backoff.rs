use std::future::Future;
use std::time::Duration;

use relq_store::StoreError;
use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(50);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Exponential backoff schedule for transient storage failures. The overall
/// bound comes from the caller's per-call timeout, not from here.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            delay: INITIAL_DELAY,
        }
    }

    pub async fn sleep(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(MAX_DELAY);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

/// Repeat `op` until it stops failing with [`StoreError::Transient`].
///
/// Capture only shared references (and other `Copy` values) in a `move`
/// closure so each produced future borrows the caller's data rather than
/// the closure's environment.
pub(crate) async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = Backoff::new();
    loop {
        match op().await {
            Err(StoreError::Transient(reason)) => {
                debug!(%reason, "transient storage failure, backing off");
                backoff.sleep().await;
            }
            other => return other,
        }
    }
}
