mod common;

use chrono::{Duration, TimeZone, Utc};
use subscription_engine::billing::{
    ChargeOutcome, NewSubscription, PaymentStatus, SubscriptionStatus,
};
use subscription_engine::config::EngineConfig;
use subscription_engine::db::SubscriptionStore;
use uuid::Uuid;

use common::{epoch, plan, Harness, Scripted, CONSULTATIONS};

// key: billing-scheduler-tests -> trial conversion
#[tokio::test]
async fn trial_end_converts_to_active_with_one_paid_payment() {
    let harness = Harness::new(plan(2_500, 7));
    let id = harness.subscribe().await;

    let early = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(early.examined, 0);

    harness.clock.advance(Duration::days(7));
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.charges_attempted, 1);
    assert_eq!(report.paid, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Active);
    assert_eq!(aggregate.payments.len(), 1);
    let payment = &aggregate.payments[0];
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.amount_cents, 2_500);
    assert_eq!(payment.billing_period_start, epoch() + Duration::days(7));
    assert_eq!(
        aggregate.subscription.next_billing_date,
        Some(Utc.with_ymd_and_hms(2024, 2, 8, 9, 0, 0).unwrap())
    );
    assert_eq!(
        aggregate.subscription.last_billing_date,
        Some(epoch() + Duration::days(7))
    );

    let charges = harness.provider.charges.lock().unwrap().clone();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].payment_id, payment.id);
    assert_eq!(charges[0].customer, "cus_test");

    let last = aggregate.history.last().unwrap();
    assert_eq!(last.from_status, Some(SubscriptionStatus::Trial));
    assert_eq!(last.to_status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn processing_charge_leaves_payment_pending() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Respond(ChargeOutcome::Processing {
            reference: "pi_processing".into(),
        }));

    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.processing, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    let payment = &aggregate.payments[0];
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(
        payment.provider_payment_intent_id.as_deref(),
        Some("pi_processing")
    );
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Active);
}

// key: billing-scheduler-tests -> dunning
#[tokio::test]
async fn three_failed_payments_suspend_the_subscription() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    for _ in 0..3 {
        harness.provider.decline("card declined");
    }

    harness.scheduler.tick(harness.now()).await.unwrap();
    let status = harness.service.get_status(id).await.unwrap();
    assert_eq!(status.status, SubscriptionStatus::PastDue);
    assert_eq!(status.failed_payment_attempts, 1);
    let payment = harness.service.get_subscription(id).await.unwrap().payments[0].clone();
    assert_eq!(payment.next_retry_at, Some(harness.now() + Duration::days(1)));

    harness.clock.advance(Duration::days(1));
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.failed, 1);
    let status = harness.service.get_status(id).await.unwrap();
    assert_eq!(status.status, SubscriptionStatus::PastDue);
    assert_eq!(status.failed_payment_attempts, 2);

    harness.clock.advance(Duration::days(3));
    harness.scheduler.tick(harness.now()).await.unwrap();

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Suspended);
    assert_eq!(aggregate.subscription.failed_payment_attempts, 3);
    assert_eq!(
        aggregate.subscription.last_payment_error.as_deref(),
        Some("card declined")
    );
    assert_eq!(aggregate.payments.len(), 1);
    assert_eq!(aggregate.payments[0].attempt_count, 3);
    assert!(aggregate.payments[0].next_retry_at.is_none());
    assert_eq!(harness.provider.charge_count(), 3);

    let keys: Vec<_> = harness
        .provider
        .charges
        .lock()
        .unwrap()
        .iter()
        .map(|request| request.idempotency_key.clone())
        .collect();
    assert_eq!(keys.len(), 3);
    assert!(keys[0] != keys[1] && keys[1] != keys[2]);

    let steps: Vec<_> = aggregate
        .history
        .iter()
        .map(|row| (row.from_status, row.to_status))
        .collect();
    assert_eq!(
        steps,
        vec![
            (None, SubscriptionStatus::Active),
            (Some(SubscriptionStatus::Active), SubscriptionStatus::PastDue),
            (
                Some(SubscriptionStatus::PastDue),
                SubscriptionStatus::Suspended
            ),
        ]
    );

    // Nothing further is attempted once suspended.
    harness.clock.advance(Duration::days(3));
    harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(harness.provider.charge_count(), 3);
}

#[tokio::test]
async fn successful_retry_recovers_past_due() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness.provider.decline("insufficient funds");

    harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(
        harness.service.get_status(id).await.unwrap().status,
        SubscriptionStatus::PastDue
    );

    harness.clock.advance(Duration::days(1));
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.paid, 1);

    let status = harness.service.get_status(id).await.unwrap();
    assert_eq!(status.status, SubscriptionStatus::Active);
    assert_eq!(status.failed_payment_attempts, 0);
    assert_eq!(
        status.next_billing_date,
        Some(Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap())
    );
    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments.len(), 1);
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
    assert!(aggregate.subscription.last_payment_error.is_none());
}

// key: billing-scheduler-tests -> idempotence
#[tokio::test]
async fn repeated_ticks_bill_a_period_once() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness.provider.decline("card declined");

    let first = harness.scheduler.tick(harness.now()).await.unwrap();
    let second = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(first.charges_attempted, 1);
    assert_eq!(second.charges_attempted, 0);
    assert_eq!(harness.provider.charge_count(), 1);
    assert_eq!(
        harness.service.get_subscription(id).await.unwrap().payments.len(),
        1
    );
}

#[tokio::test]
async fn renewal_rolls_usage_into_a_new_period() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness.scheduler.tick(harness.now()).await.unwrap();
    harness.service.consume(id, CONSULTATIONS, 3).await.unwrap();

    let next = harness
        .service
        .get_status(id)
        .await
        .unwrap()
        .next_billing_date
        .unwrap();
    harness.clock.set(next);
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.paid, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments.len(), 2);
    assert_eq!(aggregate.payments[1].billing_period_start, next);
    assert_eq!(harness.service.remaining(id, CONSULTATIONS).await.unwrap(), 3);
    assert_eq!(aggregate.usages.len(), 2);
    assert_eq!(aggregate.usages[0].used_value, 3);
    assert!(aggregate.usages[0].reset_at.is_some());
}

// key: billing-scheduler-tests -> stale attempts and timeouts
#[tokio::test]
async fn stale_pending_payment_is_reconciled_as_failed() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Respond(ChargeOutcome::Processing {
            reference: "pi_lost".into(),
        }));
    harness.scheduler.tick(harness.now()).await.unwrap();

    harness.clock.advance(Duration::minutes(10));
    let quiet = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(quiet.reconciled, 0);

    harness.clock.advance(Duration::minutes(21));
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.charges_attempted, 0);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    let payment = &aggregate.payments[0];
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.failure_reason.as_deref(),
        Some("payment attempt timed out")
    );
    assert_eq!(payment.next_retry_at, Some(harness.now() + Duration::days(1)));
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::PastDue);
    assert_eq!(harness.provider.charge_count(), 1);
}

#[tokio::test]
async fn slow_provider_is_recorded_as_failed_attempt() {
    let config = EngineConfig {
        charge_timeout: std::time::Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(plan(2_500, 0), config);
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Stall(std::time::Duration::from_millis(500)));

    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.failed, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Failed);
    assert_eq!(
        aggregate.payments[0].failure_reason.as_deref(),
        Some("payment provider timed out")
    );
    assert!(aggregate.payments[0].next_retry_at.is_some());
}

#[tokio::test]
async fn provider_error_counts_as_decline() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Fail("gateway unavailable".into()));

    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(
        harness.service.get_status(id).await.unwrap().status,
        SubscriptionStatus::PastDue
    );
}

// key: billing-scheduler-tests -> retries stop with the subscription
#[tokio::test]
async fn stale_attempt_on_cancelled_subscription_is_not_retried() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness
        .provider
        .push(Scripted::Respond(ChargeOutcome::Processing {
            reference: "pi_abandoned".into(),
        }));
    harness.scheduler.tick(harness.now()).await.unwrap();
    harness
        .service
        .cancel(
            id,
            None,
            subscription_engine::billing::Actor::User(Uuid::new_v4()),
        )
        .await
        .unwrap();

    harness.clock.advance(Duration::minutes(31));
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.reconciled, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Cancelled);
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Failed);
    assert!(aggregate.payments[0].next_retry_at.is_none());

    harness.clock.advance(Duration::days(2));
    harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(harness.provider.charge_count(), 1);
}

#[tokio::test]
async fn cancel_clears_scheduled_retry() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness.provider.decline("insufficient funds");
    harness.scheduler.tick(harness.now()).await.unwrap();
    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert!(aggregate.payments[0].next_retry_at.is_some());

    harness
        .service
        .cancel(
            id,
            Some("too expensive".into()),
            subscription_engine::billing::Actor::User(Uuid::new_v4()),
        )
        .await
        .unwrap();
    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert!(aggregate.payments[0].next_retry_at.is_none());

    harness.clock.advance(Duration::days(1));
    harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(harness.provider.charge_count(), 1);
}

// key: billing-scheduler-tests -> expiry
#[tokio::test]
async fn cancelled_subscription_expires_after_grace() {
    let harness = Harness::new(plan(2_500, 0));
    let id = harness.subscribe().await;
    harness
        .service
        .cancel(
            id,
            Some("moving abroad".into()),
            subscription_engine::billing::Actor::User(Uuid::new_v4()),
        )
        .await
        .unwrap();

    harness.clock.advance(Duration::days(6));
    let early = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(early.expired, 0);
    assert_eq!(harness.provider.charge_count(), 0);

    harness.clock.advance(Duration::days(1));
    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.expired, 1);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.subscription.status, SubscriptionStatus::Expired);
    assert_eq!(aggregate.subscription.expired_at, Some(harness.now()));
    assert_eq!(
        aggregate.history.last().unwrap().from_status,
        Some(SubscriptionStatus::Cancelled)
    );
}

// key: billing-scheduler-tests -> zero price and isolation
#[tokio::test]
async fn free_period_settles_without_provider() {
    let harness = Harness::new(plan(0, 0));
    let id = harness.subscribe().await;

    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.paid, 1);
    assert_eq!(report.charges_attempted, 0);
    assert_eq!(harness.provider.charge_count(), 0);

    let aggregate = harness.service.get_subscription(id).await.unwrap();
    assert_eq!(aggregate.payments[0].status, PaymentStatus::Paid);
    assert_eq!(aggregate.payments[0].amount_cents, 0);
    assert!(aggregate.subscription.next_billing_date.unwrap() > harness.now());
}

#[tokio::test]
async fn one_broken_subscription_does_not_stop_the_tick() {
    let harness = Harness::new(plan(2_500, 0));
    let healthy = harness.subscribe().await;

    let mut broken_plan = plan(900, 0);
    broken_plan.privileges.clear();
    broken_plan.billing_cycle.duration_months = 0;
    broken_plan.billing_cycle.duration_days = 0;
    harness.store.save_plan(&broken_plan).await.unwrap();
    let broken = harness
        .service
        .create_subscription(NewSubscription {
            user_id: Uuid::new_v4(),
            plan_id: broken_plan.plan.id,
            provider_customer_id: None,
            skip_trial: false,
        })
        .await
        .unwrap()
        .id();

    let report = harness.scheduler.tick(harness.now()).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.paid, 1);

    let healthy = harness.service.get_subscription(healthy).await.unwrap();
    assert_eq!(healthy.payments[0].status, PaymentStatus::Paid);
    let broken = harness.service.get_subscription(broken).await.unwrap();
    assert!(broken.payments.is_empty());
}
