//! Notification dispatch seam
//!
//! Message formatting and delivery (Telegram, email, realtime pushes) live
//! outside the core; the orchestrator only emits an intent per committed
//! transition. Dispatch is best-effort: a failure here is logged by the
//! caller and never rolls back the transition.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::{models::EscrowStatus, EscrowResult};

/// External notification dispatcher
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a committed status change. `from == to` marks the initial
    /// creation announcement.
    async fn notify(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
    ) -> EscrowResult<()>;
}

/// Dispatcher that only logs; the default when no delivery channel is wired
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
    ) -> EscrowResult<()> {
        info!(%escrow_id, %from, %to, "escrow status notification");
        Ok(())
    }
}
