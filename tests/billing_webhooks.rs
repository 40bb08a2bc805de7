mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use once_cell::sync::OnceCell;
use serde_json::json;
use subscription_engine::billing::{
    sign_payload, start_reconciliation_worker, BillingCycleScheduler, BillingService,
    ChargeOutcome, ChargeRequest, EventDisposition, NewSubscription, PaymentProvider,
    PaymentStatus, ProviderEvent, ProviderEventKind, RefundOutcome, SubscriptionStatus,
};
use subscription_engine::clock::{Clock, ManualClock};
use subscription_engine::config::EngineConfig;
use subscription_engine::db::MemoryStore;
use subscription_engine::error::{EngineError, EngineResult};
use uuid::Uuid;

use common::{epoch, plan, Harness, Scripted};

const SECRET: &str = "whsec_test";

fn event(id: &str, kind: &str, data: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "id": id, "type": kind, "data": data })).unwrap()
}

async fn processing_subscription(harness: &Harness, reference: &str) -> Uuid {
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Respond(ChargeOutcome::Processing {
            reference: reference.to_string(),
        }));
    harness.scheduler.tick(harness.now()).await.unwrap();
    id
}

// key: billing-webhook-tests -> exactly-once application
#[tokio::test]
async fn succeeded_event_settles_pending_payment_once() {
    let harness = Harness::new(plan(2_500, 0));
    let id = processing_subscription(&harness, "pi_async").await;

    let payload = event(
        "evt_1",
        "payment.succeeded",
        json!({ "payment_reference": "pi_async" }),
    );
    let first = harness
        .service
        .handle_provider_payload(&payload, None)
        .await
        .unwrap();
    assert_eq!(first, EventDisposition::Applied);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
    let next = aggregate.subscription.next_billing_date;
    assert!(next.unwrap() > harness.now());

    let again = harness
        .service
        .handle_provider_payload(&payload, None)
        .await
        .unwrap();
    assert_eq!(again, EventDisposition::Duplicate);
    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.next_billing_date, next);
    assert_eq!(aggregate.payments.len(), 1);
}

#[tokio::test]
async fn failure_after_settlement_is_ignored() {
    let harness = Harness::new(plan(2_500, 0));
    let id = processing_subscription(&harness, "pi_mixed").await;

    let succeeded = event(
        "evt_ok",
        "payment_intent.succeeded",
        json!({ "payment_reference": "pi_mixed" }),
    );
    let failed = event(
        "evt_late_failure",
        "payment.failed",
        json!({ "payment_reference": "pi_mixed", "reason": "card declined" }),
    );
    assert_eq!(
        harness
            .service
            .handle_provider_payload(&succeeded, None)
            .await
            .unwrap(),
        EventDisposition::Applied
    );
    assert_eq!(
        harness
            .service
            .handle_provider_payload(&failed, None)
            .await
            .unwrap(),
        EventDisposition::Ignored
    );

    let status = harness.service.get_status(id).await.unwrap();
    assert_eq!(status.status, SubscriptionStatus::Active);
    assert_eq!(status.failed_payment_attempts, 0);
}

#[tokio::test]
async fn failed_event_moves_subscription_past_due() {
    let harness = Harness::new(plan(2_500, 0));
    let id = processing_subscription(&harness, "pi_pending").await;

    let payload = event(
        "evt_fail",
        "payment.failed",
        json!({ "payment_reference": "pi_pending", "reason": "expired card" }),
    );
    let disposition = harness
        .service
        .handle_provider_payload(&payload, None)
        .await
        .unwrap();
    assert_eq!(disposition, EventDisposition::Applied);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::PastDue);
    assert_eq!(
        aggregate.payments[0].failure_reason.as_deref(),
        Some("expired card")
    );
    assert!(aggregate.payments[0].next_retry_at.is_some());
}

#[tokio::test]
async fn late_success_recovers_declined_payment() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Respond(ChargeOutcome::Declined {
            reason: "authentication required".into(),
            reference: Some("pi_3ds".into()),
        }));
    harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(
        harness.service.get_status(id).await.unwrap().status,
        SubscriptionStatus::PastDue
    );

    let payload = event(
        "evt_3ds",
        "invoice.paid",
        json!({ "payment_reference": "pi_3ds" }),
    );
    let disposition = harness
        .service
        .handle_provider_payload(&payload, None)
        .await
        .unwrap();
    assert_eq!(disposition, EventDisposition::Applied);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Active);
    assert_eq!(aggregate.subscription.failed_payment_attempts, 0);
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
    assert!(aggregate.payments[0].next_retry_at.is_none());
}

// key: billing-webhook-tests -> cancellation and unknown events
#[tokio::test]
async fn provider_cancellation_is_recorded_with_provider_actor() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;

    let payload = event(
        "evt_cancel",
        "customer.subscription.deleted",
        json!({ "subscription_id": id.to_string(), "reason": "chargeback" }),
    );
    let disposition = harness
        .service
        .handle_provider_payload(&payload, None)
        .await
        .unwrap();
    assert_eq!(disposition, EventDisposition::Applied);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Cancelled);
    let last = aggregate.history.last().unwrap();
    assert_eq!(last.reason.as_deref(), Some("chargeback"));
    assert_eq!(last.actor, subscription_engine::billing::Actor::Provider);

    let second = event(
        "evt_cancel_again",
        "subscription.cancelled",
        json!({ "subscription_id": id.to_string() }),
    );
    assert_eq!(
        harness
            .service
            .handle_provider_payload(&second, None)
            .await
            .unwrap(),
        EventDisposition::Ignored
    );
    assert_eq!(
        harness.service.get_subscription(id).await.unwrap().history.len(),
        aggregate.history.len()
    );
}

#[tokio::test]
async fn unknown_kinds_and_references_are_ignored() {
    let harness = Harness::new(plan(2_500, 0));
    harness.subscribe().await;

    let unknown = event("evt_x", "customer.updated", json!({}));
    assert_eq!(
        harness
            .service
            .handle_provider_payload(&unknown, None)
            .await
            .unwrap(),
        EventDisposition::Ignored
    );

    let stray = event(
        "evt_stray",
        "payment.succeeded",
        json!({ "payment_reference": "pi_nobody" }),
    );
    assert_eq!(
        harness
            .service
            .handle_provider_payload(&stray, None)
            .await
            .unwrap(),
        EventDisposition::Ignored
    );

    let malformed = event("evt_bad", "payment.succeeded", json!({}));
    let err = harness
        .service
        .handle_provider_payload(&malformed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

// key: billing-webhook-tests -> signatures
#[tokio::test]
async fn signed_payloads_are_verified_when_secret_is_configured() {
    let config = EngineConfig {
        webhook_secret: Some(SECRET.to_string()),
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(plan(2_500, 0), config);
    let id = processing_subscription(&harness, "pi_signed").await;

    let payload = event(
        "evt_signed",
        "payment.succeeded",
        json!({ "payment_reference": "pi_signed" }),
    );

    let missing = harness
        .service
        .handle_provider_payload(&payload, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, EngineError::InvalidSignature));

    let forged = sign_payload(&payload, "whsec_other", harness.now().timestamp()).unwrap();
    let invalid = harness
        .service
        .handle_provider_payload(&payload, Some(&forged))
        .await
        .unwrap_err();
    assert!(matches!(invalid, EngineError::InvalidSignature));

    let stale = sign_payload(&payload, SECRET, harness.now().timestamp() - 3_600).unwrap();
    let replayed = harness
        .service
        .handle_provider_payload(&payload, Some(&stale))
        .await
        .unwrap_err();
    assert!(matches!(replayed, EngineError::InvalidSignature));

    assert_eq!(
        harness.service.get_subscription(id).await.unwrap().payments[0].status,
        PaymentStatus::Pending
    );

    let header = sign_payload(&payload, SECRET, harness.now().timestamp()).unwrap();
    let disposition = harness
        .service
        .handle_provider_payload(&payload, Some(&header))
        .await
        .unwrap();
    assert_eq!(disposition, EventDisposition::Applied);
}

// key: billing-webhook-tests -> reconciliation worker
#[tokio::test]
async fn reconciliation_worker_applies_queued_events() {
    let harness = Harness::new(plan(2_500, 0));
    let id = processing_subscription(&harness, "pi_queued").await;
    let handle = start_reconciliation_worker(harness.service.clone());

    let queued = ProviderEvent {
        id: "evt_queued".to_string(),
        kind: ProviderEventKind::PaymentSucceeded {
            payment_reference: "pi_queued".to_string(),
            payment_id: None,
        },
        occurred_at: harness.now(),
    };
    let first = handle.submit_event(queued.clone()).await.unwrap();
    let second = handle.submit_event(queued).await.unwrap();
    assert_eq!(first, EventDisposition::Applied);
    assert_eq!(second, EventDisposition::Duplicate);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
}

#[tokio::test]
async fn reconciliation_worker_reports_rejected_events() {
    let harness = Harness::new(plan(2_500, 0));
    let handle = start_reconciliation_worker(harness.service.clone());
    let missing = Uuid::new_v4();

    let err = handle
        .submit_event(ProviderEvent {
            id: "evt_orphan_cancel".to_string(),
            kind: ProviderEventKind::SubscriptionCancelled {
                subscription_id: missing,
                reason: None,
            },
            occurred_at: harness.now(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::SubscriptionNotFound(id)) if *id == missing
    ));
}

/// Provider whose success webhook arrives before `charge` returns.
#[derive(Default)]
struct EagerWebhookProvider {
    service: OnceCell<BillingService>,
    charges: Mutex<usize>,
    dispositions: Mutex<Vec<EventDisposition>>,
}

#[async_trait]
impl PaymentProvider for EagerWebhookProvider {
    async fn charge(&self, request: &ChargeRequest) -> EngineResult<ChargeOutcome> {
        *self.charges.lock().unwrap() += 1;
        let reference = format!("pi_{}", request.payment_id.simple());
        if let Some(service) = self.service.get() {
            let disposition = service
                .handle_provider_event(ProviderEvent {
                    id: format!("evt_{}", request.idempotency_key),
                    kind: ProviderEventKind::PaymentSucceeded {
                        payment_reference: reference.clone(),
                        payment_id: Some(request.payment_id),
                    },
                    occurred_at: epoch(),
                })
                .await?;
            self.dispositions.lock().unwrap().push(disposition);
        }
        Ok(ChargeOutcome::Processing { reference })
    }

    async fn refund(&self, _payment_reference: &str, _amount_cents: i64) -> EngineResult<RefundOutcome> {
        Ok(RefundOutcome::Rejected {
            reason: "refunds unsupported".into(),
        })
    }
}

// key: billing-webhook-tests -> events that beat the charge response
#[tokio::test]
async fn success_event_during_charge_settles_payment_once() {
    let snapshot = plan(2_500, 0);
    let store = Arc::new(MemoryStore::new().with_plan(snapshot.clone()));
    let provider = Arc::new(EagerWebhookProvider::default());
    let clock = ManualClock::new(epoch());
    let service = BillingService::new(
        store,
        provider.clone(),
        Arc::new(clock.clone()),
        EngineConfig::default(),
    );
    assert!(provider.service.set(service.clone()).is_ok());
    let scheduler = BillingCycleScheduler::new(service.clone());

    let id = service
        .create_subscription(NewSubscription {
            user_id: Uuid::new_v4(),
            plan_id: snapshot.plan.id,
            provider_customer_id: Some("cus_eager".into()),
            skip_trial: false,
        })
        .await
        .unwrap()
        .id();
    scheduler.tick(clock.now()).await.unwrap();

    assert_eq!(
        *provider.dispositions.lock().unwrap(),
        vec![EventDisposition::Applied]
    );
    let aggregate = service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Active);
    assert_eq!(aggregate.payments.len(), 1);
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
    assert!(aggregate.payments[0].provider_payment_intent_id.is_some());

    clock.advance(Duration::minutes(31));
    scheduler.tick(clock.now()).await.unwrap();
    assert_eq!(*provider.charges.lock().unwrap(), 1);
    let aggregate = service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments.len(), 1);
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
}

#[tokio::test]
async fn concurrent_redeliveries_apply_once() {
    let harness = Harness::new(plan(2_500, 0));
    let id = processing_subscription(&harness, "pi_race").await;
    let payload = event(
        "evt_race",
        "payment.succeeded",
        json!({ "payment_reference": "pi_race" }),
    );

    let mut handles = Vec::new();
    for _ in 0..5 {
        let service = harness.service.clone();
        let payload = payload.clone();
        handles.push(tokio::spawn(async move {
            service.handle_provider_payload(&payload, None).await.unwrap()
        }));
    }
    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap() == EventDisposition::Applied {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
    assert_eq!(aggregate.history.len(), 1);
}
