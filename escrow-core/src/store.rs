//! Store layer: escrow rows, status logs, receipts, profiles, settings
//!
//! The orchestrator only talks to the [`EscrowStore`] trait. The one
//! non-negotiable contract is [`EscrowStore::transition_status`]: a
//! conditional update on the expected current status that writes the new
//! status and appends the audit entry as one logical unit, so two racing
//! transition attempts produce exactly one success and one Conflict.
//!
//! [`MemoryStore`] is the bundled single-process implementation; a
//! production deployment puts a relational database behind the same trait
//! (an `UPDATE ... WHERE status = $expected` plus the log insert in one
//! transaction).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Escrow, EscrowStatus, PlatformSettings, Profile, Receipt, Role, StatusLogEntry},
    EscrowResult,
};

/// Row fields a transition may set alongside the status change
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    /// Assign the buyer (join); legal only while no buyer is set
    pub set_buyer_id: Option<Uuid>,
    /// Set or refresh the payment deadline
    pub set_expires_at: Option<DateTime<Utc>>,
    /// Attach the seller's delivery proof reference
    pub set_delivery_proof_path: Option<String>,
}

impl TransitionUpdate {
    /// A transition that only changes the status
    pub fn none() -> Self {
        Self::default()
    }
}

/// Persistence contract for the escrow lifecycle
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert a new escrow and its initial `created` log entry
    /// (changed_by = None) atomically
    async fn insert_escrow(&self, escrow: Escrow) -> EscrowResult<Escrow>;

    /// Load an escrow by id
    async fn get_escrow(&self, id: Uuid) -> EscrowResult<Escrow>;

    /// Load an escrow by its shareable code, case-insensitively
    async fn find_escrow_by_code(&self, code: &str) -> EscrowResult<Escrow>;

    /// The seller's current non-terminal escrow, if any
    async fn active_escrow_for_seller(&self, seller_id: Uuid) -> EscrowResult<Option<Escrow>>;

    /// All escrows currently in the given status (deadline sweeps)
    async fn escrows_in_status(&self, status: EscrowStatus) -> EscrowResult<Vec<Escrow>>;

    /// Compare-and-set status change: succeeds only if the current status
    /// still equals `from`, otherwise fails with Conflict. Appends exactly
    /// one [`StatusLogEntry`] on success.
    async fn transition_status(
        &self,
        id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        changed_by: Option<Uuid>,
        update: TransitionUpdate,
    ) -> EscrowResult<Escrow>;

    /// Full status history for an escrow, oldest first
    async fn status_history(&self, escrow_id: Uuid) -> EscrowResult<Vec<StatusLogEntry>>;

    /// Record a payment receipt
    async fn insert_receipt(&self, receipt: Receipt) -> EscrowResult<Receipt>;

    /// Whether at least one receipt exists for the escrow
    async fn has_receipts(&self, escrow_id: Uuid) -> EscrowResult<bool>;

    /// Load an actor profile
    async fn get_profile(&self, id: Uuid) -> EscrowResult<Profile>;

    /// Insert or replace a profile
    async fn upsert_profile(&self, profile: Profile) -> EscrowResult<Profile>;

    /// Change a profile's role
    async fn set_role(&self, id: Uuid, role: Role) -> EscrowResult<Profile>;

    /// Current platform settings
    async fn get_settings(&self) -> EscrowResult<PlatformSettings>;

    /// Replace platform settings
    async fn update_settings(&self, settings: PlatformSettings) -> EscrowResult<PlatformSettings>;
}

#[derive(Default)]
struct Inner {
    escrows: HashMap<Uuid, Escrow>,
    by_code: HashMap<String, Uuid>,
    logs: Vec<StatusLogEntry>,
    receipts: Vec<Receipt>,
    profiles: HashMap<Uuid, Profile>,
    settings: PlatformSettings,
}

/// In-memory store for single-instance deployments and tests
///
/// A single write lock spans the status check, the row update and the log
/// append, which is what gives `transition_status` its CAS semantics here.
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn insert_escrow(&self, escrow: Escrow) -> EscrowResult<Escrow> {
        let mut inner = self.inner.write().await;
        if inner.by_code.contains_key(&escrow.code) {
            return Err(EscrowError::internal(format!(
                "escrow code collision: {}",
                escrow.code
            )));
        }
        inner.by_code.insert(escrow.code.clone(), escrow.id);
        inner
            .logs
            .push(StatusLogEntry::new(escrow.id, escrow.status, None));
        inner.escrows.insert(escrow.id, escrow.clone());
        Ok(escrow)
    }

    async fn get_escrow(&self, id: Uuid) -> EscrowResult<Escrow> {
        self.inner
            .read()
            .await
            .escrows
            .get(&id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Escrow {id}")))
    }

    async fn find_escrow_by_code(&self, code: &str) -> EscrowResult<Escrow> {
        let inner = self.inner.read().await;
        let id = inner
            .by_code
            .get(&code.to_uppercase())
            .ok_or_else(|| EscrowError::not_found(format!("Escrow with code {code}")))?;
        Ok(inner.escrows[id].clone())
    }

    async fn active_escrow_for_seller(&self, seller_id: Uuid) -> EscrowResult<Option<Escrow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .escrows
            .values()
            .find(|e| e.seller_id == seller_id && !e.status.is_terminal())
            .cloned())
    }

    async fn escrows_in_status(&self, status: EscrowStatus) -> EscrowResult<Vec<Escrow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .escrows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        changed_by: Option<Uuid>,
        update: TransitionUpdate,
    ) -> EscrowResult<Escrow> {
        let mut inner = self.inner.write().await;
        let escrow = inner
            .escrows
            .get_mut(&id)
            .ok_or_else(|| EscrowError::not_found(format!("Escrow {id}")))?;

        if escrow.status != from {
            // Lost race: another transition committed first.
            return Err(EscrowError::conflict(
                escrow.status,
                to,
                format!("expected status {from}"),
            ));
        }
        if let Some(buyer_id) = update.set_buyer_id {
            if escrow.buyer_id.is_some() {
                return Err(EscrowError::precondition("buyer already assigned"));
            }
            escrow.buyer_id = Some(buyer_id);
        }
        if let Some(expires_at) = update.set_expires_at {
            escrow.expires_at = Some(expires_at);
        }
        if let Some(path) = update.set_delivery_proof_path {
            escrow.delivery_proof_path = Some(path);
        }
        escrow.status = to;
        escrow.updated_at = Utc::now();
        let updated = escrow.clone();

        inner.logs.push(StatusLogEntry::new(id, to, changed_by));
        Ok(updated)
    }

    async fn status_history(&self, escrow_id: Uuid) -> EscrowResult<Vec<StatusLogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .logs
            .iter()
            .filter(|entry| entry.escrow_id == escrow_id)
            .cloned()
            .collect())
    }

    async fn insert_receipt(&self, receipt: Receipt) -> EscrowResult<Receipt> {
        let mut inner = self.inner.write().await;
        inner.receipts.push(receipt.clone());
        Ok(receipt)
    }

    async fn has_receipts(&self, escrow_id: Uuid) -> EscrowResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner.receipts.iter().any(|r| r.escrow_id == escrow_id))
    }

    async fn get_profile(&self, id: Uuid) -> EscrowResult<Profile> {
        self.inner
            .read()
            .await
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Profile {id}")))
    }

    async fn upsert_profile(&self, profile: Profile) -> EscrowResult<Profile> {
        let mut inner = self.inner.write().await;
        inner.profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn set_role(&self, id: Uuid, role: Role) -> EscrowResult<Profile> {
        let mut inner = self.inner.write().await;
        let profile = inner
            .profiles
            .get_mut(&id)
            .ok_or_else(|| EscrowError::not_found(format!("Profile {id}")))?;
        profile.role = role;
        Ok(profile.clone())
    }

    async fn get_settings(&self) -> EscrowResult<PlatformSettings> {
        Ok(self.inner.read().await.settings.clone())
    }

    async fn update_settings(&self, settings: PlatformSettings) -> EscrowResult<PlatformSettings> {
        let mut inner = self.inner.write().await;
        inner.settings = settings.clone();
        Ok(settings)
    }
}
