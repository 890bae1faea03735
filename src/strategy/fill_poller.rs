use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{InstrumentKey, OrderId};
use crate::exchange::BrokerClient;

/// Result of one throttled poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Throttled or backing off; nothing was asked
    Skipped,
    /// Entry is still working
    StillOpen,
    /// Entry left the open-order list
    Filled,
    /// Broker read failed; state assumed unchanged
    Unknown,
}

/// Throttled open-order poll for one entry order.
///
/// Fills are inferred from the entry disappearing from the broker's
/// open-order list. Rate-limit responses push the next poll out with
/// exponential backoff.
pub struct FillPoller {
    broker: Arc<dyn BrokerClient>,
    instrument: InstrumentKey,
    entry_order_id: OrderId,
    poll_interval: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    next_backoff: Duration,
    last_poll: Option<Instant>,
    backoff_until: Option<Instant>,
    entry_open: bool,
}

impl FillPoller {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        instrument: InstrumentKey,
        entry_order_id: OrderId,
        poll_interval: Duration,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            broker,
            instrument,
            entry_order_id,
            poll_interval,
            backoff_base,
            backoff_max,
            next_backoff: backoff_base,
            last_poll: None,
            backoff_until: None,
            entry_open: true,
        }
    }

    /// Last known state of the entry order.
    pub fn entry_open(&self) -> bool {
        self.entry_open
    }

    pub fn mark_filled(&mut self) {
        self.entry_open = false;
    }

    pub fn backing_off(&self, now: Instant) -> bool {
        self.backoff_until.map_or(false, |until| now < until)
    }

    /// Poll unless throttled or backing off.
    pub async fn poll(&mut self) -> PollOutcome {
        let now = Instant::now();
        if self.backing_off(now) {
            return PollOutcome::Skipped;
        }
        if let Some(last) = self.last_poll {
            if now.duration_since(last) < self.poll_interval {
                return PollOutcome::Skipped;
            }
        }
        self.last_poll = Some(now);

        match self.broker.search_open_orders().await {
            Ok(orders) => {
                self.next_backoff = self.backoff_base;
                self.entry_open = orders.iter().any(|o| o.order_id == self.entry_order_id);
                if self.entry_open {
                    PollOutcome::StillOpen
                } else {
                    PollOutcome::Filled
                }
            }
            Err(e) if e.is_rate_limited() => {
                let wait = self.next_backoff;
                self.backoff_until = Some(now + wait);
                self.next_backoff = (wait * 2).min(self.backoff_max);
                debug!(
                    "searchOpen rate limited for {}; backing off {:?}",
                    self.instrument, wait
                );
                PollOutcome::Unknown
            }
            Err(e) => {
                warn!("searchOpen failed for {}: {}", self.instrument, e);
                PollOutcome::Unknown
            }
        }
    }

    /// Unthrottled check used during fill confirmation. Errors read as "still open".
    pub async fn entry_open_now(&self) -> bool {
        match self.broker.search_open_orders().await {
            Ok(orders) => orders.iter().any(|o| o.order_id == self.entry_order_id),
            Err(e) => {
                if !e.is_rate_limited() {
                    warn!("searchOpen failed during fill confirm for {}: {}", self.instrument, e);
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OpenOrder, OrderKind, Side};
    use crate::error::TrailgateError;
    use crate::exchange::MockBrokerClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry() -> OpenOrder {
        OpenOrder {
            order_id: OrderId::from(1),
            instrument: InstrumentKey::from("X"),
            kind: Some(OrderKind::Limit),
            side: Some(Side::Buy),
            size: 1,
            limit_price: None,
            stop_price: None,
        }
    }

    fn poller(broker: MockBrokerClient) -> FillPoller {
        FillPoller::new(
            Arc::new(broker),
            InstrumentKey::from("X"),
            OrderId::from(1),
            Duration::from_millis(500),
            Duration::from_secs(3),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_throttled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut broker = MockBrokerClient::new();
        broker.expect_search_open_orders().returning(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(vec![entry()])
        });
        let mut p = poller(broker);

        assert_eq!(p.poll().await, PollOutcome::StillOpen);
        assert_eq!(p.poll().await, PollOutcome::Skipped);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(p.poll().await, PollOutcome::StillOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_entry_reads_as_filled() {
        let mut broker = MockBrokerClient::new();
        broker.expect_search_open_orders().returning(|| Ok(vec![]));
        let mut p = poller(broker);
        assert_eq!(p.poll().await, PollOutcome::Filled);
        assert!(!p.entry_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_doubles_and_caps() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_search_open_orders()
            .returning(|| Err(TrailgateError::RateLimited("searchOpen".into())));
        let mut p = poller(broker);

        assert_eq!(p.poll().await, PollOutcome::Unknown);
        assert!(p.entry_open());
        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert_eq!(p.poll().await, PollOutcome::Skipped);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(p.poll().await, PollOutcome::Unknown);
        // second backoff is 6s
        tokio::time::advance(Duration::from_millis(5_999)).await;
        assert_eq!(p.poll().await, PollOutcome::Skipped);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(p.poll().await, PollOutcome::Unknown);
        // third would be 12s, capped at 10s
        tokio::time::advance(Duration::from_millis(10_000)).await;
        assert_eq!(p.poll().await, PollOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_entry_open_now_assumes_open_on_error() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_search_open_orders()
            .returning(|| Err(TrailgateError::Broker("503".into())));
        let p = poller(broker);
        assert!(p.entry_open_now().await);
    }
}
