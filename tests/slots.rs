//! Slot state machine tests against a real (in-memory) database: claim,
//! promote, demote, failure reset, stale-warming recovery and rotation.

use scaffale::infra::db;
use scaffale::state::{SlotId, SlotState, SlotStore};
use time::{Duration, OffsetDateTime};

async fn store() -> SlotStore {
    let pool = db::connect("sqlite::memory:", 1).await.expect("pool");
    let store = SlotStore::new(pool, Duration::hours(1));
    store.install().await.expect("install");
    store
}

#[tokio::test]
async fn uninstalled_store_is_inert() {
    let pool = db::connect("sqlite::memory:", 1).await.expect("pool");
    let store = SlotStore::new(pool, Duration::hours(1));

    assert_eq!(store.begin_warming().await.expect("begin"), None);
    assert_eq!(store.serving_slot().await.expect("serving"), None);
    assert!(store.slot_overview().await.expect("overview").is_empty());
}

#[tokio::test]
async fn install_is_idempotent() {
    let store = store().await;
    store.install().await.expect("second install");

    let overview = store.slot_overview().await.expect("overview");
    assert_eq!(overview.len(), 2);
    assert!(overview.iter().all(|s| s.state == SlotState::Empty));
    assert_eq!(store.serving_slot().await.expect("serving"), None);
}

#[tokio::test]
async fn warming_claim_blocks_concurrent_claims() {
    let store = store().await;

    assert_eq!(
        store.begin_warming().await.expect("first claim"),
        Some(SlotId::One)
    );
    // A build is in flight: nothing else may claim a slot.
    assert_eq!(store.begin_warming().await.expect("second claim"), None);
}

#[tokio::test]
async fn promotion_demotes_the_previous_serving_slot() {
    let store = store().await;

    let slot = store.begin_warming().await.expect("claim").expect("slot");
    store.mark_ready(slot).await.expect("promote");
    assert_eq!(store.serving_slot().await.expect("serving"), Some(SlotId::One));

    let slot = store.begin_warming().await.expect("claim").expect("slot");
    assert_eq!(slot, SlotId::Two);
    store.mark_ready(slot).await.expect("promote");

    assert_eq!(store.serving_slot().await.expect("serving"), Some(SlotId::Two));
    let overview = store.slot_overview().await.expect("overview");
    let ready: Vec<SlotId> = overview
        .iter()
        .filter(|s| s.state == SlotState::Ready)
        .map(|s| s.slot)
        .collect();
    assert_eq!(ready, vec![SlotId::Two]);
}

#[tokio::test]
async fn failed_build_resets_only_the_target_slot() {
    let store = store().await;

    let first = store.begin_warming().await.expect("claim").expect("slot");
    store.mark_ready(first).await.expect("promote");

    let second = store.begin_warming().await.expect("claim").expect("slot");
    assert_eq!(second, SlotId::Two);
    store.mark_failed(second).await.expect("reset");

    // The serving slot is untouched and the failed slot is claimable again.
    assert_eq!(store.serving_slot().await.expect("serving"), Some(SlotId::One));
    assert_eq!(
        store.begin_warming().await.expect("claim"),
        Some(SlotId::Two)
    );
}

#[tokio::test]
async fn stale_warming_slot_is_reclaimed() {
    let store = store().await;

    assert_eq!(
        store.begin_warming().await.expect("claim"),
        Some(SlotId::One)
    );

    // Backdate the warm-up start past the timeout, as if the build crashed.
    let stale = OffsetDateTime::now_utc() - Duration::hours(2);
    sqlx::query("UPDATE cache_slots SET last_warm_up_started_at = ? WHERE slot_id = 1")
        .bind(stale)
        .execute(store.pool())
        .await
        .expect("backdate");

    assert_eq!(
        store.begin_warming().await.expect("reclaim"),
        Some(SlotId::One)
    );
}

#[tokio::test]
async fn both_ready_rotates_the_stalest_slot() {
    let store = store().await;

    let now = OffsetDateTime::now_utc();
    sqlx::query("UPDATE cache_slots SET state = 'ready', last_ready_at = ? WHERE slot_id = 1")
        .bind(now)
        .execute(store.pool())
        .await
        .expect("seed slot 1");
    sqlx::query("UPDATE cache_slots SET state = 'ready', last_ready_at = ? WHERE slot_id = 2")
        .bind(now - Duration::hours(6))
        .execute(store.pool())
        .await
        .expect("seed slot 2");

    assert_eq!(
        store.begin_warming().await.expect("claim"),
        Some(SlotId::Two)
    );
}
