mod common;

use common::{close, entry, mnq, orchestrator, settle, FakeBroker, FakeHub};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trailgate::coordination::{GateRejection, SignalGate};
use trailgate::domain::{InstrumentKey, OrderKind, Side, TradingSession};
use trailgate::services::{CloseOutcome, EntryOutcome};
use trailgate::strategy::FlipPolicy;

#[tokio::test(start_paused = true)]
async fn signals_for_one_instrument_never_overlap() {
    let gate = Arc::new(SignalGate::new(
        Duration::from_millis(1500),
        TradingSession::always_open(),
    ));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let gate = gate.clone();
        let inside = inside.clone();
        let max_seen = max_seen.clone();
        tasks.push(tokio::spawn(async move {
            let _guard = gate.acquire(&mnq()).await;
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn other_instruments_are_not_blocked() {
    let gate = SignalGate::new(Duration::from_millis(1500), TradingSession::always_open());
    let _held = gate.acquire(&mnq()).await;

    let other = InstrumentKey::from("CON.F.US.ES.Z25");
    tokio::time::timeout(Duration::from_secs(1), gate.acquire(&other))
        .await
        .expect("a different instrument must not wait");
}

#[tokio::test]
async fn queued_entry_behind_a_close_sees_its_holdoff() {
    let broker = Arc::new(FakeBroker::new());
    let hub = Arc::new(FakeHub::new());
    let orch = Arc::new(orchestrator(broker.clone(), hub, FlipPolicy::disabled()));

    // park both signals behind a held lock so the close is first in line
    let held = orch.gate().acquire(&mnq()).await;

    let closer = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.handle_close_signal(close(Some(2_000))).await })
    };
    settle().await;
    let stale = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.handle_entry_signal(entry(Side::Buy, 1, Some(2_000))).await })
    };
    settle().await;
    let fresh = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.handle_entry_signal(entry(Side::Buy, 1, Some(2_001))).await })
    };
    settle().await;
    drop(held);

    match closer.await.unwrap().unwrap() {
        CloseOutcome::Closed(report) => assert!(report.flat),
        CloseOutcome::Skipped(r) => panic!("close skipped: {}", r),
    }
    match stale.await.unwrap().unwrap() {
        EntryOutcome::Skipped(GateRejection::StaleVsClose {
            entry_ts_ms,
            last_close_ts_ms,
        }) => {
            assert_eq!(entry_ts_ms, 2_000);
            assert_eq!(last_close_ts_ms, 2_000);
        }
        other => panic!("expected stale rejection, got {:?}", other),
    }
    assert!(matches!(
        fresh.await.unwrap().unwrap(),
        EntryOutcome::Skipped(GateRejection::InCloseHoldoff { .. })
    ));

    assert!(broker.placements_of(OrderKind::Limit).is_empty());
}

#[tokio::test(start_paused = true)]
async fn entry_after_holdoff_with_newer_ts_is_placed() {
    let broker = Arc::new(FakeBroker::new());
    let hub = Arc::new(FakeHub::new());
    let orch = orchestrator(broker.clone(), hub, FlipPolicy::disabled());

    orch.handle_close_signal(close(Some(5_000))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_600)).await;

    let older = orch
        .handle_entry_signal(entry(Side::Buy, 1, Some(4_999)))
        .await
        .unwrap();
    assert!(matches!(
        older,
        EntryOutcome::Skipped(GateRejection::StaleVsClose { .. })
    ));

    let newer = orch
        .handle_entry_signal(entry(Side::Buy, 1, Some(5_001)))
        .await
        .unwrap();
    assert!(matches!(newer, EntryOutcome::Placed(_)));
    assert_eq!(broker.placements_of(OrderKind::Limit).len(), 1);
}
