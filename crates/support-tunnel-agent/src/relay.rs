//! Subscription upkeep shared by both endpoints.

use std::time::Duration;

use support_tunnel_core::traits::{BusEvent, Subscription};
use tokio::time::Instant;

/// First resubscribe delay after a subscription ends.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
/// Resubscribe delay cap.
pub const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Doubling retry delay with a cap.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) const fn resubscribe() -> Self {
        Self::new(RESUBSCRIBE_DELAY, MAX_RESUBSCRIBE_DELAY)
    }

    pub(crate) const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Next event of the subscription. Never resolves while there is none.
pub(crate) async fn next_event(subscription: &mut Option<Subscription>) -> Option<BusEvent> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

/// Sleep until `deadline`. Never resolves without one.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_subscription_never_yields() {
        let mut none = None;
        let waited = tokio::time::timeout(Duration::from_millis(20), next_event(&mut none)).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_doubles_to_cap() {
        let mut backoff = Backoff::resubscribe();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
