use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::billing::aggregate::SubscriptionAggregate;
use crate::billing::models::{Actor, SubscriptionStatus, SubscriptionStatusHistory};

/// key: audit-status-history-filter
/// Filter envelope applied to subscription status history queries.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusHistoryFilter {
    pub to_status: Option<SubscriptionStatus>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// key: audit-trail -> append-only status log
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditTrail;

impl AuditTrail {
    /// Appends one history row. Rows are never edited afterwards.
    pub fn record(
        aggregate: &mut SubscriptionAggregate,
        from_status: Option<SubscriptionStatus>,
        to_status: SubscriptionStatus,
        reason: Option<String>,
        actor: Actor,
        changed_at: DateTime<Utc>,
    ) -> Uuid {
        let entry = SubscriptionStatusHistory {
            id: Uuid::new_v4(),
            subscription_id: aggregate.id(),
            from_status,
            to_status,
            reason,
            actor,
            changed_at,
        };
        let id = entry.id;
        tracing::info!(
            subscription = %entry.subscription_id,
            from = from_status.map(|status| status.as_str()).unwrap_or("none"),
            to = %to_status,
            actor = %entry.actor,
            "subscription status recorded"
        );
        aggregate.history.push(entry);
        id
    }

    /// Newest first, mirroring how the history is displayed to operators.
    pub fn query<'a>(
        history: &'a [SubscriptionStatusHistory],
        filter: &StatusHistoryFilter,
    ) -> Vec<&'a SubscriptionStatusHistory> {
        let mut rows: Vec<&SubscriptionStatusHistory> = history
            .iter()
            .filter(|row| filter.to_status.map_or(true, |status| row.to_status == status))
            .filter(|row| filter.start.map_or(true, |start| row.changed_at >= start))
            .filter(|row| filter.end.map_or(true, |end| row.changed_at <= end))
            .collect();
        rows.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(to: SubscriptionStatus, at: DateTime<Utc>) -> SubscriptionStatusHistory {
        SubscriptionStatusHistory {
            id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            from_status: None,
            to_status: to,
            reason: None,
            actor: Actor::Scheduler,
            changed_at: at,
        }
    }

    #[test]
    fn query_filters_and_orders_newest_first() {
        let now = Utc::now();
        let history = vec![
            row(SubscriptionStatus::Trial, now - Duration::days(10)),
            row(SubscriptionStatus::Active, now - Duration::days(3)),
            row(SubscriptionStatus::Paused, now - Duration::days(2)),
            row(SubscriptionStatus::Active, now - Duration::days(1)),
        ];

        let active = AuditTrail::query(
            &history,
            &StatusHistoryFilter {
                to_status: Some(SubscriptionStatus::Active),
                ..Default::default()
            },
        );
        assert_eq!(active.len(), 2);
        assert!(active[0].changed_at > active[1].changed_at);

        let recent = AuditTrail::query(
            &history,
            &StatusHistoryFilter {
                start: Some(now - Duration::days(5)),
                limit: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].to_status, SubscriptionStatus::Active);
    }
}
