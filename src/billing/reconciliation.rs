use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::EngineResult;

use super::ledger::PaymentOutcome;
use super::models::Actor;
use super::service::{BillingService, EventDisposition};
use super::webhooks::ProviderEvent;

/// key: billing-reconciliation -> background worker for provider callbacks
#[derive(Debug)]
pub enum ReconciliationJob {
    ProviderEvent {
        event: ProviderEvent,
        reply: Option<oneshot::Sender<EngineResult<EventDisposition>>>,
    },
    /// Outcome reported out of band, e.g. by an operator after checking the provider.
    PaymentOutcome {
        payment_id: Uuid,
        outcome: PaymentOutcome,
    },
}

/// key: billing-reconciliation-handle -> enqueue interface
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue billing reconciliation job: {err}"))
    }

    /// Enqueues a provider event and waits for the worker to handle it. A rejected event
    /// surfaces its `EngineError`, reachable with `downcast_ref`.
    pub async fn submit_event(&self, event: ProviderEvent) -> Result<EventDisposition> {
        let (reply, response) = oneshot::channel();
        self.dispatch(ReconciliationJob::ProviderEvent {
            event,
            reply: Some(reply),
        })
        .await?;
        let outcome = response
            .await
            .map_err(|_| anyhow!("billing reconciliation worker dropped the event"))?;
        Ok(outcome?)
    }
}

pub fn start_reconciliation_worker(service: BillingService) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::ProviderEvent { event, reply } => {
                    let event_id = event.id.clone();
                    let outcome = service.handle_provider_event(event).await;
                    match &outcome {
                        Ok(disposition) => {
                            debug!(event = %event_id, ?disposition, "provider event reconciled")
                        }
                        Err(err) => error!(
                            ?err,
                            event = %event_id,
                            "failed to reconcile provider event",
                        ),
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                ReconciliationJob::PaymentOutcome {
                    payment_id,
                    outcome,
                } => match service
                    .apply_payment_outcome(payment_id, outcome, Actor::Provider)
                    .await
                {
                    Ok(disposition) => info!(
                        payment = %payment_id,
                        ?disposition,
                        "payment outcome reconciled"
                    ),
                    Err(err) => error!(
                        ?err,
                        payment = %payment_id,
                        "failed to reconcile payment outcome",
                    ),
                },
            }
        }
    });

    ReconciliationHandle { sender: tx }
}
