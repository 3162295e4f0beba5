use std::{
    cmp,
    future::Future,
    ops::Div,
    sync::Arc,
    time::Duration,
};

use rand::Rng;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    /// Ensures that fail will return the max_backoff value the next time it
    /// is called.
    pub fn max_backoff(&mut self) {
        self.num_failures = u32::MAX.div(2);
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        // See https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.random::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

/// The distinguished retryable failure: any transport-level remote error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("network error: {0}")]
pub struct NetworkError(pub String);

/// Component-level connectivity signal. Push and get loops gate on it and
/// retry helpers abort immediately when it reports offline.
#[derive(Clone)]
pub struct OnlineDetector {
    sender: Arc<watch::Sender<bool>>,
}

impl OnlineDetector {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn set_online(&self, online: bool) {
        self.sender.send_replace(online);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for OnlineDetector {
    fn default() -> Self {
        Self::new(true)
    }
}

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retries `f` on [`NetworkError`] with jittered exponential backoff, up to
/// `max_attempts` tries. Anything else fails immediately, as does going (or
/// being) offline.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    online: &OnlineDetector,
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backoff = Backoff::new(RETRY_INITIAL_BACKOFF, RETRY_MAX_BACKOFF);
    loop {
        if !online.online() {
            return Err(NetworkError("offline".to_owned()).into());
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retryable = error.downcast_ref::<NetworkError>().is_some();
                if !retryable || backoff.failures() + 1 >= max_attempts || !online.online() {
                    return Err(error);
                }
                let delay = backoff.fail(&mut rand::rng());
                tracing::warn!(?delay, %error, "remote call failed, backing off");
                tokio::time::sleep(delay).await;
            },
        }
    }
}
