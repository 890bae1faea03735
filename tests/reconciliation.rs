mod common;

use common::{entry, mnq, orchestrator, FakeBroker, FakeHub};
use rust_decimal_macros::dec;
use std::sync::Arc;
use trailgate::domain::{OpenOrder, OrderId, OrderKind, OrderRequest, Side};
use trailgate::error::TrailgateError;
use trailgate::services::{EntryOutcome, ReconciliationResolver};
use trailgate::strategy::FlipPolicy;
use tokio_test::{assert_err, assert_ok};

fn resting(id: i64, price: rust_decimal::Decimal) -> OpenOrder {
    OpenOrder {
        order_id: OrderId::from(id),
        instrument: mnq(),
        kind: Some(OrderKind::Limit),
        side: Some(Side::Buy),
        size: 2,
        limit_price: Some(price),
        stop_price: None,
    }
}

#[tokio::test]
async fn timed_out_limit_matches_order_within_half_a_tick() {
    let broker = Arc::new(FakeBroker::new());
    broker.seed_open_order(resting(77, dec!(21000.00)));
    let resolver = ReconciliationResolver::new(broker.clone(), dec!(0.25));

    let request = OrderRequest::limit(mnq(), Side::Buy, 2, dec!(21000.10));
    let found = resolver.find_match(&request).await.expect("should match");
    assert_eq!(found.order_id, OrderId::from(77));

    let far = OrderRequest::limit(mnq(), Side::Buy, 2, dec!(21000.50));
    assert!(resolver.find_match(&far).await.is_none());

    let other_side = OrderRequest::limit(mnq(), Side::Sell, 2, dec!(21000.00));
    assert!(resolver.find_match(&other_side).await.is_none());
}

#[tokio::test]
async fn entry_survives_a_timeout_when_the_order_landed() {
    let broker = Arc::new(FakeBroker::new());
    let hub = Arc::new(FakeHub::new());
    let orch = orchestrator(broker.clone(), hub, FlipPolicy::disabled());

    broker.time_out_next_placements(1);
    let outcome = assert_ok!(orch.handle_entry_signal(entry(Side::Buy, 2, None)).await);

    let EntryOutcome::Placed(placed) = outcome else {
        panic!("entry should be placed");
    };
    let limits = broker.placements_of(OrderKind::Limit);
    assert_eq!(limits.len(), 1, "no resubmission after a timeout");
    assert_eq!(placed.entry_order_id, limits[0].0);
    assert_eq!(orch.watchers().active_count(&mnq()), 1);
}

#[tokio::test]
async fn lost_submission_is_reported_unconfirmed() {
    let broker = Arc::new(FakeBroker::new());
    let hub = Arc::new(FakeHub::new());
    let orch = orchestrator(broker.clone(), hub, FlipPolicy::disabled());

    broker.lose_next_placements(1);
    let err = assert_err!(orch.handle_entry_signal(entry(Side::Buy, 2, None)).await);

    assert!(matches!(err, TrailgateError::SubmissionUnconfirmed(_)));
    assert!(broker.placements().is_empty());
    assert_eq!(orch.watchers().active_count(&mnq()), 0);
}
