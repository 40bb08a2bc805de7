use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::aggregate::SubscriptionAggregate;
use super::models::{
    PlanPrivilegeDefinition, PlanSnapshot, PrivilegeType, UserSubscriptionPrivilegeUsage,
};

/// key: entitlement-tracker -> allowed vs used per usage period
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivilegeEntitlementTracker;

impl PrivilegeEntitlementTracker {
    /// Remaining allowance for the period containing `now`. When no row covers `now` yet,
    /// reports what a fresh period would grant.
    pub fn remaining(
        aggregate: &SubscriptionAggregate,
        plan: &PlanSnapshot,
        privilege: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let definition = quota_definition(plan, privilege, now)?;
        let remaining = match aggregate.current_usage_index(definition.binding.id, now) {
            Some(index) => aggregate.usages[index].remaining(),
            None => definition.binding.value.max(0),
        };
        Ok(remaining)
    }

    pub fn has_feature(plan: &PlanSnapshot, privilege: &str, now: DateTime<Utc>) -> bool {
        plan.privilege(privilege, now)
            .map(|definition| definition.binding.value > 0)
            .unwrap_or(false)
    }

    /// Compare-and-increment against the current period. The counter is untouched when
    /// the allowance is insufficient.
    pub fn consume(
        aggregate: &mut SubscriptionAggregate,
        plan: &PlanSnapshot,
        privilege: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        if amount <= 0 {
            return Err(EngineError::Validation(format!(
                "consumption amount must be positive, got {amount}"
            )));
        }
        let status = aggregate.subscription.status;
        if !status.grants_entitlements() {
            return Err(EngineError::SubscriptionInactive { status });
        }

        let definition = quota_definition(plan, privilege, now)?;
        let index = match aggregate.current_usage_index(definition.binding.id, now) {
            Some(index) => index,
            None => materialize(aggregate, definition, now)?,
        };

        let usage = &mut aggregate.usages[index];
        let remaining = usage.remaining();
        if amount > remaining {
            return Err(EngineError::QuotaExceeded {
                privilege: privilege.to_string(),
                requested: amount,
                remaining,
            });
        }
        usage.used_value += amount;
        usage.last_used_at = Some(now);
        let remaining = usage.remaining();
        aggregate.touch(now);

        tracing::debug!(
            subscription = %aggregate.id(),
            privilege,
            amount,
            remaining,
            "privilege consumed"
        );
        Ok(remaining)
    }

    /// Closes the current period of one privilege and opens a fresh one at `now` with the
    /// allowance from the current plan definition.
    pub fn reset(
        aggregate: &mut SubscriptionAggregate,
        plan: &PlanSnapshot,
        privilege: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        let definition = quota_definition(plan, privilege, now)?;
        reset_definition(aggregate, definition, now)
    }

    /// Rolls over every tracked privilege whose latest period ended at or before `now`.
    /// Privileges no longer effective on the plan keep their closed last row.
    pub fn rollover_expired(
        aggregate: &mut SubscriptionAggregate,
        plan: &PlanSnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Uuid>> {
        let mut opened = Vec::new();
        for definition in tracked(plan, now) {
            let ended = aggregate
                .latest_usage(definition.binding.id)
                .map(|usage| usage.usage_period_end <= now)
                .unwrap_or(false);
            if ended {
                opened.push(reset_definition(aggregate, definition, now)?);
            }
        }
        Ok(opened)
    }

    /// Opens the first period of every quota privilege. Used when a subscription starts.
    pub fn materialize_all(
        aggregate: &mut SubscriptionAggregate,
        plan: &PlanSnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        for definition in tracked(plan, now) {
            if aggregate
                .current_usage_index(definition.binding.id, now)
                .is_none()
            {
                materialize(aggregate, definition, now)?;
            }
        }
        Ok(())
    }
}

fn tracked(plan: &PlanSnapshot, now: DateTime<Utc>) -> impl Iterator<Item = &PlanPrivilegeDefinition> {
    plan.privileges.iter().filter(move |definition| {
        definition.privilege.privilege_type == PrivilegeType::Quota
            && definition.binding.is_effective(now)
    })
}

fn quota_definition<'a>(
    plan: &'a PlanSnapshot,
    privilege: &str,
    now: DateTime<Utc>,
) -> EngineResult<&'a PlanPrivilegeDefinition> {
    let definition = plan.privilege(privilege, now)?;
    if definition.privilege.privilege_type != PrivilegeType::Quota {
        return Err(EngineError::PrivilegeNotFound(privilege.to_string()));
    }
    if definition.usage_cycle.id != definition.binding.usage_period_id {
        return Err(EngineError::PeriodNotFound {
            privilege: privilege.to_string(),
        });
    }
    Ok(definition)
}

fn reset_definition(
    aggregate: &mut SubscriptionAggregate,
    definition: &PlanPrivilegeDefinition,
    now: DateTime<Utc>,
) -> EngineResult<Uuid> {
    let end = definition.usage_cycle.advance(now)?;
    for usage in aggregate
        .usages
        .iter_mut()
        .filter(|usage| usage.plan_privilege_id == definition.binding.id && usage.reset_at.is_none())
    {
        if usage.usage_period_end > now {
            usage.usage_period_end = now;
        }
        usage.reset_at = Some(now);
    }
    let id = open_period(aggregate, definition, now, end, now);
    tracing::info!(
        subscription = %aggregate.id(),
        privilege = %definition.privilege.name,
        allowed = definition.binding.value,
        "usage period reset"
    );
    Ok(id)
}

/// Opens the period containing `now`, aligned to the end of the previous period or, for
/// the first period, to the subscription start.
fn materialize(
    aggregate: &mut SubscriptionAggregate,
    definition: &PlanPrivilegeDefinition,
    now: DateTime<Utc>,
) -> EngineResult<usize> {
    let mut start = aggregate
        .latest_usage(definition.binding.id)
        .map(|usage| usage.usage_period_end)
        .unwrap_or(aggregate.subscription.start_date);
    if start > now {
        start = now;
    }
    let mut end = definition.usage_cycle.advance(start)?;
    while end <= now {
        start = end;
        end = definition.usage_cycle.advance(start)?;
    }
    for usage in aggregate
        .usages
        .iter_mut()
        .filter(|usage| usage.plan_privilege_id == definition.binding.id && usage.reset_at.is_none())
    {
        usage.reset_at = Some(start);
    }
    open_period(aggregate, definition, start, end, now);
    Ok(aggregate.usages.len() - 1)
}

fn open_period(
    aggregate: &mut SubscriptionAggregate,
    definition: &PlanPrivilegeDefinition,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Uuid {
    let usage = UserSubscriptionPrivilegeUsage {
        id: Uuid::new_v4(),
        subscription_id: aggregate.id(),
        plan_privilege_id: definition.binding.id,
        privilege_id: definition.privilege.id,
        used_value: 0,
        allowed_value: definition.binding.value.max(0),
        usage_period_start: start,
        usage_period_end: end,
        last_used_at: None,
        reset_at: None,
        created_at: now,
    };
    let id = usage.id;
    aggregate.usages.push(usage);
    id
}
