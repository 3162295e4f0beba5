use std::{
    sync::Arc,
    time::Duration,
};

/// Whether a failed fetch should be retried, given how many failures have
/// already happened.
#[derive(Clone)]
pub enum Retry {
    Never,
    Count(u32),
    Predicate(Arc<dyn Fn(u32, &anyhow::Error) -> bool + Send + Sync>),
}

impl Retry {
    pub fn should_retry(&self, failure_count: u32, error: &anyhow::Error) -> bool {
        match self {
            Retry::Never => false,
            Retry::Count(max) => failure_count < *max,
            Retry::Predicate(f) => f(failure_count, error),
        }
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Retry::Never => write!(f, "Never"),
            Retry::Count(n) => write!(f, "Count({n})"),
            Retry::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

#[derive(Clone)]
pub enum RetryDelay {
    /// Exponential from 1s, doubled per failure, capped at 30s.
    Default,
    Fixed(Duration),
    Fn(Arc<dyn Fn(u32, &anyhow::Error) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub fn delay(&self, failure_count: u32, error: &anyhow::Error) -> Duration {
        match self {
            RetryDelay::Default => {
                let base = Duration::from_secs(1);
                let exp = base
                    .checked_mul(2u32.saturating_pow(failure_count.saturating_sub(1)))
                    .unwrap_or(Duration::from_secs(30));
                exp.min(Duration::from_secs(30))
            },
            RetryDelay::Fixed(duration) => *duration,
            RetryDelay::Fn(f) => f(failure_count, error),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Default => write!(f, "Default"),
            RetryDelay::Fixed(d) => write!(f, "Fixed({d:?})"),
            RetryDelay::Fn(_) => write!(f, "Fn(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delay_doubles_and_caps() {
        let delay = RetryDelay::Default;
        let err = anyhow::anyhow!("x");
        assert_eq!(delay.delay(1, &err), Duration::from_secs(1));
        assert_eq!(delay.delay(2, &err), Duration::from_secs(2));
        assert_eq!(delay.delay(3, &err), Duration::from_secs(4));
        assert_eq!(delay.delay(10, &err), Duration::from_secs(30));
    }

    #[test]
    fn retry_policies() {
        let err = anyhow::anyhow!("x");
        assert!(!Retry::Never.should_retry(0, &err));
        assert!(Retry::Count(3).should_retry(2, &err));
        assert!(!Retry::Count(3).should_retry(3, &err));
        let only_first = Retry::Predicate(Arc::new(|count, _| count == 0));
        assert!(only_first.should_retry(0, &err));
        assert!(!only_first.should_retry(1, &err));
    }
}
