mod common;

use chrono::{Duration, Utc};
use coin_ledger::engine::{CoinEngine, EngineConfig};
use coin_ledger::error::LedgerError;
use coin_ledger::models::{EntryStatus, Mutation, Reason};
use coin_ledger::reconciler::{
    EventState, ReconcileOutcome, SignatureError, WebhookError, WebhookVerifier,
};
use coin_ledger::store::LedgerStore;

use common::{paid_checkout, reconciler, session_event, sign, FaultSwitch, FaultyJournal, SECRET};

#[tokio::test]
async fn test_paid_checkout_credits_purchase() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let body = paid_checkout("evt_1", "user_1", 100);
    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();

    let ReconcileOutcome::Applied { entry, replayed } = outcome else {
        panic!("expected Applied, got {:?}", outcome);
    };
    assert!(!replayed);
    assert_eq!(entry.amount, 100);
    assert_eq!(entry.reason, Reason::Purchase);
    assert_eq!(entry.external_ref.as_deref(), Some("evt_1"));
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_redelivered_event_credits_once() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());
    let body = paid_checkout("evt_1", "user_1", 100);

    let first = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();
    let second = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();

    match (first, second) {
        (
            ReconcileOutcome::Applied { entry: a, replayed: false },
            ReconcileOutcome::Applied { entry: b, replayed: true },
        ) => assert_eq!(a, b),
        other => panic!("unexpected outcomes {:?}", other),
    }
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);
    assert_eq!(engine.store().count_by_user("user_1"), 1);
}

#[tokio::test]
async fn test_invalid_signature_changes_nothing() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());
    let body = paid_checkout("evt_1", "user_1", 100);

    let forged = WebhookVerifier::new("not_the_secret", 300).sign(Utc::now().timestamp(), &body);
    let err = reconciler.handle(Some(&forged), &body).await.unwrap_err();
    assert!(matches!(
        err,
        WebhookError::SignatureInvalid(SignatureError::Mismatch)
    ));
    assert!(!err.is_retryable());

    let err = reconciler.handle(None, &body).await.unwrap_err();
    assert!(matches!(
        err,
        WebhookError::SignatureInvalid(SignatureError::Missing)
    ));

    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);
    assert_eq!(engine.store().count_by_user("user_1"), 0);
    assert!(reconciler.operator_queue().lock().await.is_empty());
}

#[tokio::test]
async fn test_tampered_body_rejected() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let signed = paid_checkout("evt_1", "user_1", 100);
    let tampered = paid_checkout("evt_1", "user_1", 100_000);
    let err = reconciler
        .handle(Some(&sign(&signed)), &tampered)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WebhookError::SignatureInvalid(SignatureError::Mismatch)
    ));
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);
}

#[tokio::test]
async fn test_stale_signature_rejected() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());
    let body = paid_checkout("evt_1", "user_1", 100);

    let signed_at = Utc::now() - Duration::minutes(10);
    let header = WebhookVerifier::new(SECRET, 300).sign(signed_at.timestamp(), &body);

    let err = reconciler
        .handle_at(Some(&header), &body, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WebhookError::SignatureInvalid(SignatureError::Expired { .. })
    ));

    // The same header is fine when checked at signing time
    let outcome = reconciler
        .handle_at(Some(&header), &body, signed_at)
        .await
        .unwrap();
    assert_eq!(outcome.state(), EventState::Applied);
}

#[test]
fn test_verifier_accepts_any_listed_digest() {
    let verifier = WebhookVerifier::new(SECRET, 300);
    let body = b"{}";
    let now = Utc::now();

    let valid = verifier.sign(now.timestamp(), body);
    let digest = valid.split_once("v1=").unwrap().1;
    let header = format!("t={},v1={},v1={}", now.timestamp(), "00ff", digest);
    assert_eq!(verifier.verify(Some(&header), body, now), Ok(()));

    assert_eq!(
        verifier.verify(Some("v1=abcd"), body, now),
        Err(SignatureError::Malformed)
    );
    assert_eq!(
        verifier.verify(Some("t=notanumber,v1=abcd"), body, now),
        Err(SignatureError::Malformed)
    );
}

#[tokio::test]
async fn test_unknown_user_goes_to_operator_queue() {
    let engine = CoinEngine::in_memory();
    let reconciler = reconciler(engine.clone());
    let body = paid_checkout("evt_9", "ghost", 100);

    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();
    assert_eq!(outcome.state(), EventState::FailedApply);
    assert!(engine.store().read("ghost").is_none());

    // Redelivery updates the same queue record
    reconciler.handle(Some(&sign(&body)), &body).await.unwrap();

    let queue = reconciler.operator_queue();
    let queue = queue.lock().await;
    let failed = queue.get("evt_9").expect("queued failure");
    assert_eq!(failed.user_id.as_deref(), Some("ghost"));
    assert_eq!(failed.coins, Some(100));
    assert_eq!(failed.session_id.as_deref(), Some("cs_evt_9"));
    assert_eq!(failed.deliveries, 2);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_archived_account_goes_to_operator_queue() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    engine.archive("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let body = paid_checkout("evt_1", "user_1", 100);
    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();

    assert_eq!(outcome.state(), EventState::FailedApply);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);
}

#[tokio::test]
async fn test_missing_metadata_goes_to_operator_queue() {
    let engine = CoinEngine::in_memory();
    let reconciler = reconciler(engine.clone());
    let body = serde_json::json!({
        "id": "evt_2",
        "type": "checkout.session.completed",
        "data": { "object": { "id": "cs_2", "payment_status": "paid", "metadata": {} } }
    })
    .to_string()
    .into_bytes();

    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();
    assert_eq!(outcome.state(), EventState::FailedApply);
    assert!(reconciler.operator_queue().lock().await.get("evt_2").is_some());
}

#[tokio::test]
async fn test_unhandled_event_type_ignored() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());
    let body = session_event("invoice.paid", "evt_3", "in_3", "user_1", 100, "paid");

    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();

    assert_eq!(outcome.state(), EventState::Ignored);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);
    assert!(reconciler.operator_queue().lock().await.is_empty());
}

#[tokio::test]
async fn test_unparseable_body_ignored() {
    let reconciler = reconciler(CoinEngine::in_memory());
    let body = b"not json".to_vec();

    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();
    assert_eq!(outcome.state(), EventState::Ignored);
}

#[tokio::test]
async fn test_async_payment_success_completes_pending() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let completed = session_event(
        "checkout.session.completed",
        "evt_1",
        "cs_1",
        "user_1",
        100,
        "unpaid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&completed)), &completed)
        .await
        .unwrap();
    let ReconcileOutcome::Recorded { entry } = outcome else {
        panic!("expected Recorded, got {:?}", outcome);
    };
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);

    let succeeded = session_event(
        "checkout.session.async_payment_succeeded",
        "evt_2",
        "cs_1",
        "user_1",
        100,
        "paid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&succeeded)), &succeeded)
        .await
        .unwrap();
    let ReconcileOutcome::Applied { entry: settled, .. } = outcome else {
        panic!("expected Applied, got {:?}", outcome);
    };
    assert_eq!(settled.id, entry.id);
    assert_eq!(settled.status, EntryStatus::Completed);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);
    assert_eq!(engine.store().count_by_user("user_1"), 1);

    // Redelivery of the success is a replay
    let again = reconciler
        .handle(Some(&sign(&succeeded)), &succeeded)
        .await
        .unwrap();
    assert!(matches!(again, ReconcileOutcome::Applied { replayed: true, .. }));
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_async_payment_failure_marks_pending_failed() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let completed = session_event(
        "checkout.session.completed",
        "evt_1",
        "cs_1",
        "user_1",
        100,
        "unpaid",
    );
    reconciler
        .handle(Some(&sign(&completed)), &completed)
        .await
        .unwrap();

    let failed = session_event(
        "checkout.session.async_payment_failed",
        "evt_2",
        "cs_1",
        "user_1",
        100,
        "unpaid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&failed)), &failed)
        .await
        .unwrap();

    let ReconcileOutcome::Recorded { entry } = outcome else {
        panic!("expected Recorded, got {:?}", outcome);
    };
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);
}

#[tokio::test]
async fn test_async_success_before_completion_credits_once() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let succeeded = session_event(
        "checkout.session.async_payment_succeeded",
        "evt_2",
        "cs_1",
        "user_1",
        100,
        "paid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&succeeded)), &succeeded)
        .await
        .unwrap();
    assert_eq!(outcome.state(), EventState::Applied);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);

    // The late completion finds the session already credited
    let completed = session_event(
        "checkout.session.completed",
        "evt_1",
        "cs_1",
        "user_1",
        100,
        "unpaid",
    );
    reconciler
        .handle(Some(&sign(&completed)), &completed)
        .await
        .unwrap();

    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);
    assert_eq!(engine.store().count_by_user("user_1"), 1);
}

#[tokio::test]
async fn test_storage_fault_is_retryable_and_not_queued() {
    let switch = FaultSwitch::default();
    let store = LedgerStore::open(Box::new(FaultyJournal::new(switch.clone()))).unwrap();
    let engine = CoinEngine::new(store, EngineConfig::default());
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());
    let body = paid_checkout("evt_1", "user_1", 100);

    switch.trip();
    let err = reconciler.handle(Some(&sign(&body)), &body).await.unwrap_err();
    assert!(matches!(
        err,
        WebhookError::Ledger(LedgerError::StorageUnavailable(_))
    ));
    assert!(err.is_retryable());
    assert!(reconciler.operator_queue().lock().await.is_empty());
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);

    // The provider's redelivery succeeds once storage is back
    switch.reset();
    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { replayed: false, .. }));
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 100);
}

#[tokio::test]
async fn test_settlement_for_a_different_purchase_goes_to_operator_queue() {
    let engine = CoinEngine::in_memory();
    engine.balance("user_1").await.unwrap();
    let reconciler = reconciler(engine.clone());

    let completed = session_event(
        "checkout.session.completed",
        "evt_1",
        "cs_1",
        "user_1",
        100,
        "unpaid",
    );
    reconciler
        .handle(Some(&sign(&completed)), &completed)
        .await
        .unwrap();

    // Same session, but the success names a larger purchase
    let succeeded = session_event(
        "checkout.session.async_payment_succeeded",
        "evt_2",
        "cs_1",
        "user_1",
        500,
        "paid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&succeeded)), &succeeded)
        .await
        .unwrap();
    assert_eq!(outcome.state(), EventState::FailedApply);
    assert_eq!(engine.balance("user_1").await.unwrap().balance, 0);
    assert_eq!(
        engine.store().find_by_external_ref("cs_1").unwrap().status,
        EntryStatus::Pending
    );

    let queue = reconciler.operator_queue();
    let queue = queue.lock().await;
    let failed = queue.get("evt_2").expect("queued failure");
    assert_eq!(failed.coins, Some(500));
}

#[tokio::test]
async fn test_session_ref_held_by_another_users_debit_is_not_settled() {
    let engine = CoinEngine::in_memory();
    engine.balance("alice").await.unwrap();
    engine
        .credit(Mutation::new("bob", 20, Reason::Purchase))
        .await
        .unwrap();
    engine
        .debit(Mutation::new("bob", 1, Reason::Spend).with_external_ref("cs_42"))
        .await
        .unwrap();
    let reconciler = reconciler(engine.clone());

    let completed = session_event(
        "checkout.session.completed",
        "evt_1",
        "cs_42",
        "alice",
        500,
        "unpaid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&completed)), &completed)
        .await
        .unwrap();
    assert_eq!(outcome.state(), EventState::FailedApply);

    let succeeded = session_event(
        "checkout.session.async_payment_succeeded",
        "evt_2",
        "cs_42",
        "alice",
        500,
        "paid",
    );
    let outcome = reconciler
        .handle(Some(&sign(&succeeded)), &succeeded)
        .await
        .unwrap();
    assert_eq!(outcome.state(), EventState::FailedApply);

    assert_eq!(engine.balance("alice").await.unwrap().balance, 0);
    assert_eq!(engine.balance("bob").await.unwrap().balance, 19);
    let recorded = engine.store().find_by_external_ref("cs_42").unwrap();
    assert_eq!(recorded.user_id, "bob");
    assert_eq!(recorded.status, EntryStatus::Completed);

    let queue = reconciler.operator_queue();
    assert_eq!(queue.lock().await.len(), 2);
}

#[tokio::test]
async fn test_paid_checkout_colliding_with_another_users_ref_is_queued() {
    let engine = CoinEngine::in_memory();
    engine.balance("alice").await.unwrap();
    engine
        .credit(Mutation::new("bob", 5, Reason::HomeworkReward).with_external_ref("evt_7"))
        .await
        .unwrap();
    let reconciler = reconciler(engine.clone());

    let body = paid_checkout("evt_7", "alice", 100);
    let outcome = reconciler.handle(Some(&sign(&body)), &body).await.unwrap();

    assert_eq!(outcome.state(), EventState::FailedApply);
    assert_eq!(engine.balance("alice").await.unwrap().balance, 0);
    assert_eq!(engine.balance("bob").await.unwrap().balance, 5);
    let queue = reconciler.operator_queue();
    assert!(queue.lock().await.get("evt_7").is_some());
}
