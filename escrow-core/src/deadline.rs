//! Deadline evaluator: durable time-based transitions
//!
//! Deadlines are derived purely from persisted state (the escrow row's
//! payment deadline, the status log's delivery timestamp), never from
//! in-process timers, so they survive restarts and fire correctly no matter
//! which instance runs the sweep. Sweeps are at-least-once triggers routed
//! through the same orchestrator guards as user actions; a lost race shows
//! up as a Conflict and is skipped, not retried.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    error::ErrorKind,
    lifecycle::EscrowManager,
    models::EscrowStatus,
    token::TokenService,
    EscrowResult,
};

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Unpaid escrows closed for missing their payment deadline
    pub expired: usize,
    /// Delivered escrows auto-completed after the confirmation window
    pub auto_confirmed: usize,
    /// One-time tokens purged
    pub tokens_purged: usize,
}

/// Periodically scans for escrows whose deadlines have passed
pub struct DeadlineEvaluator {
    config: EngineConfig,
    manager: Arc<EscrowManager>,
    tokens: Arc<TokenService>,
}

impl DeadlineEvaluator {
    pub fn new(
        config: EngineConfig,
        manager: Arc<EscrowManager>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            config,
            manager,
            tokens,
        }
    }

    /// Run sweeps forever on the configured interval
    pub async fn run(&self) {
        let mut ticker = interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.sweep_interval_secs,
            "deadline evaluator started"
        );
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        expired = report.expired,
                        auto_confirmed = report.auto_confirmed,
                        tokens_purged = report.tokens_purged,
                        "sweep pass finished"
                    );
                }
                Ok(_) => debug!("sweep pass found nothing due"),
                Err(err) => warn!(error = %err, "sweep pass failed"),
            }
        }
    }

    /// One full pass: expiries, auto-confirms, token purge
    pub async fn sweep(&self) -> EscrowResult<SweepReport> {
        let expired = self.sweep_expired().await?;
        let auto_confirmed = self.sweep_auto_confirm().await?;
        let tokens_purged = self.tokens.purge_expired().await?;
        Ok(SweepReport {
            expired,
            auto_confirmed,
            tokens_purged,
        })
    }

    /// Close unpaid escrows whose payment deadline plus grace has passed
    pub async fn sweep_expired(&self) -> EscrowResult<usize> {
        let candidates = self
            .manager
            .store()
            .escrows_in_status(EscrowStatus::WaitingPayment)
            .await?;
        let cutoff = Utc::now() - Duration::seconds(self.config.deadline_grace_secs);

        let mut closed = 0;
        for escrow in candidates {
            let Some(deadline) = escrow.expires_at else {
                warn!(escrow_id = %escrow.id, "unpaid escrow has no deadline, skipping");
                continue;
            };
            if deadline > cutoff {
                continue;
            }
            match self.manager.expire(escrow.id).await {
                Ok(_) => {
                    info!(escrow_id = %escrow.id, code = %escrow.code, "escrow expired");
                    closed += 1;
                }
                // Someone paid or cancelled between the scan and the CAS.
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    debug!(escrow_id = %escrow.id, "expiry lost the race, skipping");
                }
                // Transient storage failure on one escrow; the next sweep
                // picks it up again.
                Err(err) if err.is_retryable() => {
                    warn!(escrow_id = %escrow.id, error = %err, "expiry failed, deferring to next sweep");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(closed)
    }

    /// Complete delivered escrows the buyer never confirmed within the
    /// auto-confirm window, measured from the `in_progress` log entry
    pub async fn sweep_auto_confirm(&self) -> EscrowResult<usize> {
        let candidates = self
            .manager
            .store()
            .escrows_in_status(EscrowStatus::InProgress)
            .await?;
        let cutoff = Utc::now() - Duration::minutes(self.config.auto_confirm_mins);

        let mut completed = 0;
        for escrow in candidates {
            let history = self.manager.store().status_history(escrow.id).await?;
            let delivered_at = history
                .iter()
                .rev()
                .find(|entry| entry.status == EscrowStatus::InProgress)
                .map(|entry| entry.created_at);

            let Some(delivered_at) = delivered_at else {
                warn!(escrow_id = %escrow.id, "in-progress escrow has no delivery log entry");
                continue;
            };
            if delivered_at > cutoff {
                continue;
            }
            match self.manager.confirm_received(None, escrow.id).await {
                Ok(_) => {
                    info!(escrow_id = %escrow.id, code = %escrow.code, "receipt auto-confirmed");
                    completed += 1;
                }
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    debug!(escrow_id = %escrow.id, "auto-confirm lost the race, skipping");
                }
                Err(err) if err.is_retryable() => {
                    warn!(escrow_id = %escrow.id, error = %err, "auto-confirm failed, deferring to next sweep");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(completed)
    }
}
