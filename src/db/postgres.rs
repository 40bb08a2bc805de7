use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::billing::aggregate::SubscriptionAggregate;
use crate::billing::models::{
    Actor, MasterBillingCycle, PaymentRefund, PaymentStatus, PlanPrivilegeDefinition,
    PlanSnapshot, Privilege, PrivilegeType, RefundStatus, Subscription, SubscriptionPayment,
    SubscriptionPlan, SubscriptionPlanPrivilege, SubscriptionStatus, SubscriptionStatusHistory,
    UserSubscriptionPrivilegeUsage,
};
use crate::error::{EngineError, EngineResult};

use super::{CandidateQuery, PaymentLocation, PaymentLookup, SubscriptionStore};

/// key: postgres-store -> sqlx-backed aggregate store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn load(&self, subscription_id: Uuid) -> EngineResult<SubscriptionAggregate> {
        let row = sqlx::query(
            r#"SELECT * FROM "Subscriptions" WHERE "Id" = $1 AND "DeletedAt" IS NULL"#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::SubscriptionNotFound(subscription_id));
        };
        let subscription = map_subscription(&row)?;
        let version: i64 = row.try_get("Version")?;

        let usages = sqlx::query(
            r#"
            SELECT * FROM "UserSubscriptionPrivilegeUsages"
            WHERE "SubscriptionId" = $1
            ORDER BY "UsagePeriodStart", "CreatedAt"
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(map_usage)
        .collect::<EngineResult<Vec<_>>>()?;

        let payments = sqlx::query(
            r#"
            SELECT * FROM "SubscriptionPayments"
            WHERE "SubscriptionId" = $1
            ORDER BY "BillingPeriodStart", "CreatedAt"
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(map_payment)
        .collect::<EngineResult<Vec<_>>>()?;

        let refunds = sqlx::query(
            r#"
            SELECT r.* FROM "PaymentRefunds" r
            JOIN "SubscriptionPayments" p ON p."Id" = r."PaymentId"
            WHERE p."SubscriptionId" = $1
            ORDER BY r."CreatedAt"
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(map_refund)
        .collect::<EngineResult<Vec<_>>>()?;

        let history = sqlx::query(
            r#"
            SELECT * FROM "SubscriptionStatusHistories"
            WHERE "SubscriptionId" = $1
            ORDER BY "ChangedAt", "Id"
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(map_history)
        .collect::<EngineResult<Vec<_>>>()?;

        Ok(SubscriptionAggregate {
            subscription,
            usages,
            payments,
            refunds,
            history,
            version,
        })
    }

    async fn insert(&self, aggregate: &SubscriptionAggregate) -> EngineResult<i64> {
        let s = &aggregate.subscription;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO "Subscriptions" (
                "Id", "UserId", "PlanId", "BillingCycleId", "Status", "StatusReason",
                "CurrentPriceCents", "Currency", "StartDate", "NextBillingDate",
                "LastBillingDate", "TrialStartDate", "TrialEndDate", "FailedPaymentAttempts",
                "LastPaymentDate", "LastPaymentError", "PausedAt", "ResumedDate",
                "CancelledAt", "SuspendedAt", "ExpiredAt", "DeletedAt", "ProviderCustomerId",
                "Version", "CreatedAt", "UpdatedAt"
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, 1, $24, $25
            )
            "#,
        )
        .bind(s.id)
        .bind(s.user_id)
        .bind(s.plan_id)
        .bind(s.billing_cycle_id)
        .bind(s.status.as_str())
        .bind(&s.status_reason)
        .bind(s.current_price_cents)
        .bind(&s.currency)
        .bind(s.start_date)
        .bind(s.next_billing_date)
        .bind(s.last_billing_date)
        .bind(s.trial_start_date)
        .bind(s.trial_end_date)
        .bind(s.failed_payment_attempts)
        .bind(s.last_payment_date)
        .bind(&s.last_payment_error)
        .bind(s.paused_at)
        .bind(s.resumed_date)
        .bind(s.cancelled_at)
        .bind(s.suspended_at)
        .bind(s.expired_at)
        .bind(s.deleted_at)
        .bind(&s.provider_customer_id)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&mut tx)
        .await?;

        write_children(&mut tx, aggregate).await?;
        tx.commit().await?;
        Ok(1)
    }

    async fn commit(
        &self,
        aggregate: &SubscriptionAggregate,
        event_id: Option<&str>,
    ) -> EngineResult<i64> {
        let s = &aggregate.subscription;
        let mut tx = self.pool.begin().await?;

        if let Some(event_id) = event_id {
            let inserted = sqlx::query(
                r#"
                INSERT INTO "ProcessedProviderEvents" ("EventId", "SubscriptionId", "ProcessedAt")
                VALUES ($1, $2, $3)
                ON CONFLICT ("EventId") DO NOTHING
                "#,
            )
            .bind(event_id)
            .bind(s.id)
            .bind(s.updated_at)
            .execute(&mut tx)
            .await?
            .rows_affected();
            if inserted == 0 {
                return Err(EngineError::DuplicateWebhookEvent(event_id.to_string()));
            }
        }

        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE "Subscriptions" SET
                "PlanId" = $3,
                "BillingCycleId" = $4,
                "Status" = $5,
                "StatusReason" = $6,
                "CurrentPriceCents" = $7,
                "Currency" = $8,
                "NextBillingDate" = $9,
                "LastBillingDate" = $10,
                "TrialStartDate" = $11,
                "TrialEndDate" = $12,
                "FailedPaymentAttempts" = $13,
                "LastPaymentDate" = $14,
                "LastPaymentError" = $15,
                "PausedAt" = $16,
                "ResumedDate" = $17,
                "CancelledAt" = $18,
                "SuspendedAt" = $19,
                "ExpiredAt" = $20,
                "DeletedAt" = $21,
                "ProviderCustomerId" = $22,
                "UpdatedAt" = $23,
                "Version" = "Version" + 1
            WHERE "Id" = $1 AND "Version" = $2
            RETURNING "Version"
            "#,
        )
        .bind(s.id)
        .bind(aggregate.version)
        .bind(s.plan_id)
        .bind(s.billing_cycle_id)
        .bind(s.status.as_str())
        .bind(&s.status_reason)
        .bind(s.current_price_cents)
        .bind(&s.currency)
        .bind(s.next_billing_date)
        .bind(s.last_billing_date)
        .bind(s.trial_start_date)
        .bind(s.trial_end_date)
        .bind(s.failed_payment_attempts)
        .bind(s.last_payment_date)
        .bind(&s.last_payment_error)
        .bind(s.paused_at)
        .bind(s.resumed_date)
        .bind(s.cancelled_at)
        .bind(s.suspended_at)
        .bind(s.expired_at)
        .bind(s.deleted_at)
        .bind(&s.provider_customer_id)
        .bind(s.updated_at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(version) = version else {
            return Err(EngineError::ConcurrencyConflict {
                subscription_id: s.id,
            });
        };

        write_children(&mut tx, aggregate).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn load_plan(&self, plan_id: Uuid) -> EngineResult<PlanSnapshot> {
        let row = sqlx::query(r#"SELECT * FROM "SubscriptionPlans" WHERE "Id" = $1"#)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(EngineError::PlanNotFound(plan_id));
        };
        let plan = map_plan(&row)?;

        let cycle = sqlx::query(r#"SELECT * FROM "MasterBillingCycles" WHERE "Id" = $1"#)
            .bind(plan.billing_cycle_id)
            .fetch_one(&self.pool)
            .await?;
        let billing_cycle = map_cycle(&cycle, "")?;

        let privileges = sqlx::query(
            r#"
            SELECT
                pp."Id", pp."PlanId", pp."PrivilegeId", pp."Value", pp."UsagePeriodId",
                pp."EffectiveDate", pp."ExpirationDate",
                p."Name" AS "PrivilegeName",
                p."Description" AS "PrivilegeDescription",
                p."PrivilegeType",
                c."Id" AS "CycleId",
                c."Name" AS "CycleName",
                c."DurationDays" AS "CycleDurationDays",
                c."DurationMonths" AS "CycleDurationMonths",
                c."ProviderInterval" AS "CycleProviderInterval",
                c."ProviderIntervalCount" AS "CycleProviderIntervalCount"
            FROM "SubscriptionPlanPrivileges" pp
            JOIN "Privileges" p ON p."Id" = pp."PrivilegeId"
            JOIN "MasterBillingCycles" c ON c."Id" = pp."UsagePeriodId"
            WHERE pp."PlanId" = $1
            ORDER BY pp."EffectiveDate"
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(map_plan_privilege)
        .collect::<EngineResult<Vec<_>>>()?;

        Ok(PlanSnapshot {
            plan,
            billing_cycle,
            privileges,
        })
    }

    async fn save_plan(&self, snapshot: &PlanSnapshot) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        upsert_cycle(&mut tx, &snapshot.billing_cycle).await?;

        let plan = &snapshot.plan;
        sqlx::query(
            r#"
            INSERT INTO "SubscriptionPlans" (
                "Id", "Name", "Description", "PriceCents", "Currency", "TrialDurationInDays",
                "BillingCycleId", "Features", "IsActive", "IsMarketingVisible", "Version",
                "CreatedAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT ("Id") DO UPDATE SET
                "Name" = EXCLUDED."Name",
                "Description" = EXCLUDED."Description",
                "PriceCents" = EXCLUDED."PriceCents",
                "Currency" = EXCLUDED."Currency",
                "TrialDurationInDays" = EXCLUDED."TrialDurationInDays",
                "BillingCycleId" = EXCLUDED."BillingCycleId",
                "Features" = EXCLUDED."Features",
                "IsActive" = EXCLUDED."IsActive",
                "IsMarketingVisible" = EXCLUDED."IsMarketingVisible",
                "Version" = EXCLUDED."Version"
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.trial_duration_in_days)
        .bind(plan.billing_cycle_id)
        .bind(&plan.features)
        .bind(plan.is_active)
        .bind(plan.is_marketing_visible)
        .bind(plan.version)
        .bind(plan.created_at)
        .execute(&mut tx)
        .await?;

        for definition in &snapshot.privileges {
            upsert_cycle(&mut tx, &definition.usage_cycle).await?;
            let privilege = &definition.privilege;
            sqlx::query(
                r#"
                INSERT INTO "Privileges" ("Id", "Name", "Description", "PrivilegeType")
                VALUES ($1, $2, $3, $4)
                ON CONFLICT ("Id") DO UPDATE SET
                    "Name" = EXCLUDED."Name",
                    "Description" = EXCLUDED."Description",
                    "PrivilegeType" = EXCLUDED."PrivilegeType"
                "#,
            )
            .bind(privilege.id)
            .bind(&privilege.name)
            .bind(&privilege.description)
            .bind(privilege.privilege_type.as_str())
            .execute(&mut tx)
            .await?;

            let binding = &definition.binding;
            sqlx::query(
                r#"
                INSERT INTO "SubscriptionPlanPrivileges" (
                    "Id", "PlanId", "PrivilegeId", "Value", "UsagePeriodId", "EffectiveDate",
                    "ExpirationDate"
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT ("Id") DO UPDATE SET
                    "Value" = EXCLUDED."Value",
                    "UsagePeriodId" = EXCLUDED."UsagePeriodId",
                    "EffectiveDate" = EXCLUDED."EffectiveDate",
                    "ExpirationDate" = EXCLUDED."ExpirationDate"
                "#,
            )
            .bind(binding.id)
            .bind(binding.plan_id)
            .bind(binding.privilege_id)
            .bind(binding.value)
            .bind(binding.usage_period_id)
            .bind(binding.effective_date)
            .bind(binding.expiration_date)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn billing_candidates(&self, query: CandidateQuery) -> EngineResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT s."Id" FROM "Subscriptions" s
            WHERE s."DeletedAt" IS NULL
              AND (
                (s."Status" IN ('trial', 'active', 'past_due') AND s."NextBillingDate" <= $1)
                OR EXISTS (
                    SELECT 1 FROM "SubscriptionPayments" p
                    WHERE p."SubscriptionId" = s."Id"
                      AND p."Status" = 'pending'
                      AND p."LastAttemptAt" <= $2
                )
                OR (
                    s."Status" IN ('trial', 'active', 'past_due') AND EXISTS (
                        SELECT 1 FROM "SubscriptionPayments" p
                        WHERE p."SubscriptionId" = s."Id"
                          AND p."Status" = 'failed'
                          AND p."NextRetryAt" <= $1
                    )
                )
                OR (s."Status" = 'cancelled' AND s."CancelledAt" <= $3)
                OR (s."Status" = 'suspended' AND s."SuspendedAt" <= $3)
              )
            ORDER BY s."CreatedAt"
            "#,
        )
        .bind(query.now)
        .bind(query.pending_before)
        .bind(query.expire_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn locate_payment(
        &self,
        lookup: &PaymentLookup,
    ) -> EngineResult<Option<PaymentLocation>> {
        let row = match lookup {
            PaymentLookup::Id(id) => {
                sqlx::query(
                    r#"SELECT "Id", "SubscriptionId" FROM "SubscriptionPayments" WHERE "Id" = $1"#,
                )
                .bind(*id)
                .fetch_optional(&self.pool)
                .await?
            }
            PaymentLookup::Reference(reference) => {
                sqlx::query(
                    r#"
                    SELECT "Id", "SubscriptionId" FROM "SubscriptionPayments"
                    WHERE "ProviderPaymentIntentId" = $1
                    ORDER BY "CreatedAt" DESC
                    LIMIT 1
                    "#,
                )
                .bind(reference)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|row| {
            Ok(PaymentLocation {
                subscription_id: row.try_get("SubscriptionId")?,
                payment_id: row.try_get("Id")?,
            })
        })
        .transpose()
    }

    async fn is_event_processed(&self, event_id: &str) -> EngineResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "ProcessedProviderEvents" WHERE "EventId" = $1)"#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

/// Usage rows, payments and refund status are upserted; history is append-only.
async fn write_children(
    tx: &mut Transaction<'_, Postgres>,
    aggregate: &SubscriptionAggregate,
) -> EngineResult<()> {
    for usage in &aggregate.usages {
        sqlx::query(
            r#"
            INSERT INTO "UserSubscriptionPrivilegeUsages" (
                "Id", "SubscriptionId", "PlanPrivilegeId", "PrivilegeId", "UsedValue",
                "AllowedValue", "UsagePeriodStart", "UsagePeriodEnd", "LastUsedAt", "ResetAt",
                "CreatedAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT ("Id") DO UPDATE SET
                "UsedValue" = EXCLUDED."UsedValue",
                "AllowedValue" = EXCLUDED."AllowedValue",
                "UsagePeriodEnd" = EXCLUDED."UsagePeriodEnd",
                "LastUsedAt" = EXCLUDED."LastUsedAt",
                "ResetAt" = EXCLUDED."ResetAt"
            "#,
        )
        .bind(usage.id)
        .bind(usage.subscription_id)
        .bind(usage.plan_privilege_id)
        .bind(usage.privilege_id)
        .bind(usage.used_value)
        .bind(usage.allowed_value)
        .bind(usage.usage_period_start)
        .bind(usage.usage_period_end)
        .bind(usage.last_used_at)
        .bind(usage.reset_at)
        .bind(usage.created_at)
        .execute(&mut *tx)
        .await?;
    }

    for payment in &aggregate.payments {
        sqlx::query(
            r#"
            INSERT INTO "SubscriptionPayments" (
                "Id", "SubscriptionId", "AmountCents", "Currency", "Status", "AttemptCount",
                "NextRetryAt", "LastAttemptAt", "BillingPeriodStart", "BillingPeriodEnd",
                "ProviderPaymentIntentId", "FailureReason", "PaidAt", "CreatedAt", "UpdatedAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT ("Id") DO UPDATE SET
                "Status" = EXCLUDED."Status",
                "AttemptCount" = EXCLUDED."AttemptCount",
                "NextRetryAt" = EXCLUDED."NextRetryAt",
                "LastAttemptAt" = EXCLUDED."LastAttemptAt",
                "ProviderPaymentIntentId" = EXCLUDED."ProviderPaymentIntentId",
                "FailureReason" = EXCLUDED."FailureReason",
                "PaidAt" = EXCLUDED."PaidAt",
                "UpdatedAt" = EXCLUDED."UpdatedAt"
            "#,
        )
        .bind(payment.id)
        .bind(payment.subscription_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.attempt_count)
        .bind(payment.next_retry_at)
        .bind(payment.last_attempt_at)
        .bind(payment.billing_period_start)
        .bind(payment.billing_period_end)
        .bind(&payment.provider_payment_intent_id)
        .bind(&payment.failure_reason)
        .bind(payment.paid_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?;
    }

    for refund in &aggregate.refunds {
        sqlx::query(
            r#"
            INSERT INTO "PaymentRefunds" (
                "Id", "PaymentId", "AmountCents", "Reason", "Status", "ProviderRefundId",
                "CreatedAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ("Id") DO UPDATE SET
                "Status" = EXCLUDED."Status",
                "ProviderRefundId" = EXCLUDED."ProviderRefundId"
            "#,
        )
        .bind(refund.id)
        .bind(refund.payment_id)
        .bind(refund.amount_cents)
        .bind(&refund.reason)
        .bind(refund.status.as_str())
        .bind(&refund.provider_refund_id)
        .bind(refund.created_at)
        .execute(&mut *tx)
        .await?;
    }

    for entry in &aggregate.history {
        sqlx::query(
            r#"
            INSERT INTO "SubscriptionStatusHistories" (
                "Id", "SubscriptionId", "FromStatus", "ToStatus", "Reason", "Actor", "ChangedAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ("Id") DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.subscription_id)
        .bind(entry.from_status.map(|status| status.as_str()))
        .bind(entry.to_status.as_str())
        .bind(&entry.reason)
        .bind(entry.actor.to_string())
        .bind(entry.changed_at)
        .execute(&mut *tx)
        .await?;
    }

    Ok(())
}

async fn upsert_cycle(
    tx: &mut Transaction<'_, Postgres>,
    cycle: &MasterBillingCycle,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO "MasterBillingCycles" (
            "Id", "Name", "DurationDays", "DurationMonths", "ProviderInterval",
            "ProviderIntervalCount"
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT ("Id") DO UPDATE SET
            "Name" = EXCLUDED."Name",
            "DurationDays" = EXCLUDED."DurationDays",
            "DurationMonths" = EXCLUDED."DurationMonths",
            "ProviderInterval" = EXCLUDED."ProviderInterval",
            "ProviderIntervalCount" = EXCLUDED."ProviderIntervalCount"
        "#,
    )
    .bind(cycle.id)
    .bind(&cycle.name)
    .bind(cycle.duration_days)
    .bind(cycle.duration_months)
    .bind(&cycle.provider_interval)
    .bind(cycle.provider_interval_count)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

fn map_subscription(row: &PgRow) -> EngineResult<Subscription> {
    let status: String = row.try_get("Status")?;
    Ok(Subscription {
        id: row.try_get("Id")?,
        user_id: row.try_get("UserId")?,
        plan_id: row.try_get("PlanId")?,
        billing_cycle_id: row.try_get("BillingCycleId")?,
        status: SubscriptionStatus::parse(&status)?,
        status_reason: row.try_get("StatusReason")?,
        current_price_cents: row.try_get("CurrentPriceCents")?,
        currency: row.try_get("Currency")?,
        start_date: row.try_get("StartDate")?,
        next_billing_date: row.try_get("NextBillingDate")?,
        last_billing_date: row.try_get("LastBillingDate")?,
        trial_start_date: row.try_get("TrialStartDate")?,
        trial_end_date: row.try_get("TrialEndDate")?,
        failed_payment_attempts: row.try_get("FailedPaymentAttempts")?,
        last_payment_date: row.try_get("LastPaymentDate")?,
        last_payment_error: row.try_get("LastPaymentError")?,
        paused_at: row.try_get("PausedAt")?,
        resumed_date: row.try_get("ResumedDate")?,
        cancelled_at: row.try_get("CancelledAt")?,
        suspended_at: row.try_get("SuspendedAt")?,
        expired_at: row.try_get("ExpiredAt")?,
        deleted_at: row.try_get("DeletedAt")?,
        provider_customer_id: row.try_get("ProviderCustomerId")?,
        created_at: row.try_get("CreatedAt")?,
        updated_at: row.try_get("UpdatedAt")?,
    })
}

fn map_usage(row: &PgRow) -> EngineResult<UserSubscriptionPrivilegeUsage> {
    Ok(UserSubscriptionPrivilegeUsage {
        id: row.try_get("Id")?,
        subscription_id: row.try_get("SubscriptionId")?,
        plan_privilege_id: row.try_get("PlanPrivilegeId")?,
        privilege_id: row.try_get("PrivilegeId")?,
        used_value: row.try_get("UsedValue")?,
        allowed_value: row.try_get("AllowedValue")?,
        usage_period_start: row.try_get("UsagePeriodStart")?,
        usage_period_end: row.try_get("UsagePeriodEnd")?,
        last_used_at: row.try_get("LastUsedAt")?,
        reset_at: row.try_get("ResetAt")?,
        created_at: row.try_get("CreatedAt")?,
    })
}

fn map_payment(row: &PgRow) -> EngineResult<SubscriptionPayment> {
    let status: String = row.try_get("Status")?;
    Ok(SubscriptionPayment {
        id: row.try_get("Id")?,
        subscription_id: row.try_get("SubscriptionId")?,
        amount_cents: row.try_get("AmountCents")?,
        currency: row.try_get("Currency")?,
        status: PaymentStatus::parse(&status)?,
        attempt_count: row.try_get("AttemptCount")?,
        next_retry_at: row.try_get("NextRetryAt")?,
        last_attempt_at: row.try_get("LastAttemptAt")?,
        billing_period_start: row.try_get("BillingPeriodStart")?,
        billing_period_end: row.try_get("BillingPeriodEnd")?,
        provider_payment_intent_id: row.try_get("ProviderPaymentIntentId")?,
        failure_reason: row.try_get("FailureReason")?,
        paid_at: row.try_get("PaidAt")?,
        created_at: row.try_get("CreatedAt")?,
        updated_at: row.try_get("UpdatedAt")?,
    })
}

fn map_refund(row: &PgRow) -> EngineResult<PaymentRefund> {
    let status: String = row.try_get("Status")?;
    Ok(PaymentRefund {
        id: row.try_get("Id")?,
        payment_id: row.try_get("PaymentId")?,
        amount_cents: row.try_get("AmountCents")?,
        reason: row.try_get("Reason")?,
        status: RefundStatus::parse(&status)?,
        provider_refund_id: row.try_get("ProviderRefundId")?,
        created_at: row.try_get("CreatedAt")?,
    })
}

fn map_history(row: &PgRow) -> EngineResult<SubscriptionStatusHistory> {
    let from_status: Option<String> = row.try_get("FromStatus")?;
    let to_status: String = row.try_get("ToStatus")?;
    let actor: String = row.try_get("Actor")?;
    Ok(SubscriptionStatusHistory {
        id: row.try_get("Id")?,
        subscription_id: row.try_get("SubscriptionId")?,
        from_status: from_status
            .as_deref()
            .map(SubscriptionStatus::parse)
            .transpose()?,
        to_status: SubscriptionStatus::parse(&to_status)?,
        reason: row.try_get("Reason")?,
        actor: Actor::parse(&actor),
        changed_at: row.try_get("ChangedAt")?,
    })
}

fn map_plan(row: &PgRow) -> EngineResult<SubscriptionPlan> {
    Ok(SubscriptionPlan {
        id: row.try_get("Id")?,
        name: row.try_get("Name")?,
        description: row.try_get("Description")?,
        price_cents: row.try_get("PriceCents")?,
        currency: row.try_get("Currency")?,
        trial_duration_in_days: row.try_get("TrialDurationInDays")?,
        billing_cycle_id: row.try_get("BillingCycleId")?,
        features: row.try_get("Features")?,
        is_active: row.try_get("IsActive")?,
        is_marketing_visible: row.try_get("IsMarketingVisible")?,
        version: row.try_get("Version")?,
        created_at: row.try_get("CreatedAt")?,
    })
}

/// Reads a billing cycle whose columns may carry a `prefix` (for joined rows).
fn map_cycle(row: &PgRow, prefix: &str) -> EngineResult<MasterBillingCycle> {
    let column = |name: &str| format!("{prefix}{name}");
    Ok(MasterBillingCycle {
        id: row.try_get(column("Id").as_str())?,
        name: row.try_get(column("Name").as_str())?,
        duration_days: row.try_get(column("DurationDays").as_str())?,
        duration_months: row.try_get(column("DurationMonths").as_str())?,
        provider_interval: row.try_get(column("ProviderInterval").as_str())?,
        provider_interval_count: row.try_get(column("ProviderIntervalCount").as_str())?,
    })
}

fn map_plan_privilege(row: &PgRow) -> EngineResult<PlanPrivilegeDefinition> {
    let binding = SubscriptionPlanPrivilege {
        id: row.try_get("Id")?,
        plan_id: row.try_get("PlanId")?,
        privilege_id: row.try_get("PrivilegeId")?,
        value: row.try_get("Value")?,
        usage_period_id: row.try_get("UsagePeriodId")?,
        effective_date: row.try_get("EffectiveDate")?,
        expiration_date: row.try_get("ExpirationDate")?,
    };
    let privilege_type: String = row.try_get("PrivilegeType")?;
    let privilege = Privilege {
        id: binding.privilege_id,
        name: row.try_get("PrivilegeName")?,
        description: row.try_get("PrivilegeDescription")?,
        privilege_type: PrivilegeType::parse(&privilege_type)?,
    };
    Ok(PlanPrivilegeDefinition {
        usage_cycle: map_cycle(row, "Cycle")?,
        binding,
        privilege,
    })
}
