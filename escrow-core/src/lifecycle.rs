//! Lifecycle orchestrator: the one gate every status change goes through
//!
//! One operation per externally-triggerable transition. Each operation
//! resolves the caller, loads the escrow, checks the role/ownership guard
//! and domain preconditions, consults the transition table, then persists
//! the new status plus its audit entry through the store's compare-and-set
//! primitive. Concurrent attempts on the same escrow therefore converge to
//! exactly one success; the loser observes a Conflict.
//!
//! Deadline-triggered transitions (`expire`, system `confirm_received`) run
//! through the same guards with actor = None, which is what makes duplicate
//! at-least-once triggers harmless.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::EscrowError,
    models::{can_transition, Escrow, EscrowStatus, PlatformSettings, Profile, Receipt, Role},
    notify::Notifier,
    store::{EscrowStore, TransitionUpdate},
    token::TokenService,
    EscrowResult,
};

/// Resume target when the status log yields no usable prior state.
///
/// Kept for compatibility with historical data whose hold entries predate
/// full logging; `take_off_hold` still fails closed if this edge is illegal.
const FALLBACK_RESUME: EscrowStatus = EscrowStatus::WaitingAdmin;

/// Attempts to allocate a unique short code before giving up
const CODE_RETRY_ATTEMPTS: usize = 3;

/// How a caller proves who they are
#[derive(Debug, Clone)]
pub enum Credential {
    /// An established session for this user id
    Session(Uuid),
    /// A signed one-time token; consumed on use
    OneTimeToken(String),
}

/// Escrow creation request
#[derive(Debug, Clone)]
pub struct CreateEscrowRequest {
    pub description: String,
    /// Price in minor currency units
    pub price: i64,
    pub product_image_path: Option<String>,
}

/// Main orchestrator coordinating the escrow lifecycle
pub struct EscrowManager {
    config: EngineConfig,
    store: Arc<dyn EscrowStore>,
    tokens: Arc<TokenService>,
    notifier: Arc<dyn Notifier>,
}

impl EscrowManager {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EscrowStore>,
        tokens: Arc<TokenService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            tokens,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn EscrowStore> {
        &self.store
    }

    /// Resolve a caller to their profile, consuming a one-time token if that
    /// is what was presented
    pub async fn authenticate(&self, credential: Credential) -> EscrowResult<Profile> {
        let user_id = match credential {
            Credential::Session(user_id) => user_id,
            Credential::OneTimeToken(token) => self.tokens.verify_and_consume(&token).await?,
        };
        self.store
            .get_profile(user_id)
            .await
            .map_err(|_| EscrowError::unauthenticated("no profile for authenticated user"))
    }

    /// Create a new escrow listing as a seller
    pub async fn create(
        &self,
        seller: &Profile,
        request: CreateEscrowRequest,
    ) -> EscrowResult<Escrow> {
        self.validate_create_request(&request)?;

        if let Some(active) = self.store.active_escrow_for_seller(seller.id).await? {
            return Err(EscrowError::precondition(format!(
                "seller already has an active escrow ({})",
                active.code
            )));
        }

        let fee = self
            .store
            .get_settings()
            .await
            .map(|s| s.service_fee)
            .unwrap_or(self.config.default_service_fee);

        let mut last_err = EscrowError::internal("could not allocate an escrow code");
        for _ in 0..CODE_RETRY_ATTEMPTS {
            let mut escrow = Escrow::new(
                seller.id,
                request.description.clone(),
                request.price,
                fee,
            );
            escrow.product_image_path = request.product_image_path.clone();
            match self.store.insert_escrow(escrow).await {
                Ok(escrow) => {
                    info!(escrow_id = %escrow.id, code = %escrow.code, "escrow created");
                    self.dispatch(escrow.id, EscrowStatus::Created, EscrowStatus::Created)
                        .await;
                    return Ok(escrow);
                }
                // Code collision or transient storage failure; a fresh code
                // gets a fresh chance.
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "escrow insert failed, retrying with a new code");
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Join an escrow as a buyer using its shareable code; starts the
    /// payment deadline
    pub async fn join(&self, buyer: &Profile, code: &str) -> EscrowResult<Escrow> {
        let escrow = self.store.find_escrow_by_code(code).await?;

        if escrow.seller_id == buyer.id {
            return Err(EscrowError::forbidden(
                "cannot join your own transaction as a buyer",
            ));
        }
        if let Some(buyer_id) = escrow.buyer_id {
            // Retried join from the same buyer is a no-op.
            if buyer_id == buyer.id && escrow.status == EscrowStatus::WaitingPayment {
                return Ok(escrow);
            }
            return Err(EscrowError::precondition(
                "transaction already has a buyer",
            ));
        }
        // Joining is only legal from the freshly listed state; the table has
        // wider edges into WaitingPayment (hold resume) that must not open
        // this operation up.
        if escrow.status != EscrowStatus::Created {
            return Err(EscrowError::conflict(
                escrow.status,
                EscrowStatus::WaitingPayment,
                "can only join a newly listed escrow",
            ));
        }

        let update = TransitionUpdate {
            set_buyer_id: Some(buyer.id),
            set_expires_at: Some(Utc::now() + Duration::minutes(self.config.payment_window_mins)),
            ..Default::default()
        };
        self.apply(&escrow, EscrowStatus::WaitingPayment, Some(buyer.id), update)
            .await
    }

    /// Record the buyer's uploaded payment receipt; no status change
    pub async fn upload_receipt(
        &self,
        buyer: &Profile,
        escrow_id: Uuid,
        storage_path: String,
    ) -> EscrowResult<Receipt> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        self.require_buyer(&escrow, buyer)?;

        if !matches!(
            escrow.status,
            EscrowStatus::WaitingPayment | EscrowStatus::WaitingAdmin
        ) {
            return Err(EscrowError::precondition(format!(
                "cannot upload a receipt while the escrow is {}",
                escrow.status
            )));
        }

        let receipt = Receipt::new(escrow_id, buyer.id, storage_path);
        self.store.insert_receipt(receipt.clone()).await?;
        info!(%escrow_id, receipt_id = %receipt.id, "receipt recorded");
        Ok(receipt)
    }

    /// Buyer marks the escrow paid after uploading a receipt
    ///
    /// Idempotent: a retry that finds the escrow already in WaitingAdmin
    /// returns success without a duplicate log entry.
    pub async fn mark_paid(&self, buyer: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        self.require_buyer(&escrow, buyer)?;

        if escrow.status == EscrowStatus::WaitingAdmin {
            return Ok(escrow);
        }
        if escrow.status != EscrowStatus::WaitingPayment {
            return Err(EscrowError::conflict(
                escrow.status,
                EscrowStatus::WaitingAdmin,
                "can only mark paid while waiting for payment",
            ));
        }
        if !self.store.has_receipts(escrow_id).await? {
            return Err(EscrowError::precondition(
                "no payment receipt uploaded",
            ));
        }

        self.apply(
            &escrow,
            EscrowStatus::WaitingAdmin,
            Some(buyer.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Admin confirms the out-of-band payment arrived
    ///
    /// Not idempotent: once the status has moved on, a repeat is a Conflict.
    pub async fn confirm_payment(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;

        if escrow.status != EscrowStatus::WaitingAdmin {
            return Err(EscrowError::conflict(
                escrow.status,
                EscrowStatus::PaymentConfirmed,
                "payment can only be confirmed while waiting for admin",
            ));
        }
        self.apply(
            &escrow,
            EscrowStatus::PaymentConfirmed,
            Some(admin.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Seller marks the item delivered; starts the auto-confirm window
    pub async fn mark_delivered(
        &self,
        seller: &Profile,
        escrow_id: Uuid,
        proof_path: Option<String>,
    ) -> EscrowResult<Escrow> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        if escrow.seller_id != seller.id {
            return Err(EscrowError::forbidden(
                "only the seller can mark the item delivered",
            ));
        }
        if escrow.status != EscrowStatus::PaymentConfirmed {
            return Err(EscrowError::conflict(
                escrow.status,
                EscrowStatus::InProgress,
                "delivery requires a confirmed payment",
            ));
        }

        let update = TransitionUpdate {
            set_delivery_proof_path: proof_path,
            ..Default::default()
        };
        self.apply(&escrow, EscrowStatus::InProgress, Some(seller.id), update)
            .await
    }

    /// Buyer (or the deadline evaluator, with `caller = None`) confirms
    /// receipt, completing the escrow
    pub async fn confirm_received(
        &self,
        caller: Option<&Profile>,
        escrow_id: Uuid,
    ) -> EscrowResult<Escrow> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        if let Some(profile) = caller {
            self.require_buyer(&escrow, profile)?;
        }

        // Retries and racing auto-confirm triggers land here.
        if escrow.status == EscrowStatus::Completed {
            return Ok(escrow);
        }
        // The table allows Completed from every non-terminal status for
        // force-complete; receipt confirmation itself is only legal after
        // delivery.
        if escrow.status != EscrowStatus::InProgress {
            return Err(EscrowError::conflict(
                escrow.status,
                EscrowStatus::Completed,
                "receipt can only be confirmed after delivery",
            ));
        }
        self.apply(
            &escrow,
            EscrowStatus::Completed,
            caller.map(|p| p.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Admin freezes a non-terminal escrow
    pub async fn put_on_hold(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;

        if escrow.status == EscrowStatus::OnHold {
            return Err(EscrowError::precondition("transaction is already on hold"));
        }
        self.apply(
            &escrow,
            EscrowStatus::OnHold,
            Some(admin.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Admin releases a hold; the escrow resumes the status it held before
    /// the freeze, reconstructed from the status log
    pub async fn take_off_hold(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;

        if escrow.status != EscrowStatus::OnHold {
            return Err(EscrowError::precondition("transaction is not on hold"));
        }

        let history = self.store.status_history(escrow_id).await?;
        let prior = history
            .iter()
            .rev()
            .map(|entry| entry.status)
            .find(|status| *status != EscrowStatus::OnHold);

        let resume = match prior {
            Some(status) if can_transition(EscrowStatus::OnHold, status) => status,
            _ => {
                warn!(%escrow_id, "no resumable prior status in log, using fallback");
                FALLBACK_RESUME
            }
        };
        if !can_transition(EscrowStatus::OnHold, resume) {
            return Err(EscrowError::conflict(
                EscrowStatus::OnHold,
                resume,
                "no legal status to resume to",
            ));
        }

        self.apply(&escrow, resume, Some(admin.id), TransitionUpdate::none())
            .await
    }

    /// Admin releases the funds to the seller after a confirmed payment or
    /// delivery
    pub async fn release_funds(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;
        self.require_settleable(&escrow, EscrowStatus::Completed)?;
        self.apply(
            &escrow,
            EscrowStatus::Completed,
            Some(admin.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Admin returns the funds to the buyer
    pub async fn refund(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;
        self.require_settleable(&escrow, EscrowStatus::Refunded)?;
        self.apply(
            &escrow,
            EscrowStatus::Refunded,
            Some(admin.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Admin force-completes a stuck transaction
    pub async fn force_complete(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;
        self.apply(
            &escrow,
            EscrowStatus::Completed,
            Some(admin.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Admin closes a non-terminal transaction outright
    pub async fn close(&self, admin: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.require_admin(admin)?;
        let escrow = self.store.get_escrow(escrow_id).await?;
        self.apply(
            &escrow,
            EscrowStatus::Closed,
            Some(admin.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// Cancel a transaction: admins at any non-terminal point, the seller
    /// only before payment is underway
    pub async fn cancel(&self, caller: &Profile, escrow_id: Uuid) -> EscrowResult<Escrow> {
        let escrow = self.store.get_escrow(escrow_id).await?;

        if !caller.role.is_admin() {
            if escrow.seller_id != caller.id {
                return Err(EscrowError::forbidden(
                    "only the seller or an admin can cancel",
                ));
            }
            if !matches!(
                escrow.status,
                EscrowStatus::Created | EscrowStatus::WaitingPayment
            ) {
                return Err(EscrowError::precondition(
                    "sellers can only cancel before payment is confirmed",
                ));
            }
        }

        self.apply(
            &escrow,
            EscrowStatus::Closed,
            Some(caller.id),
            TransitionUpdate::none(),
        )
        .await
    }

    /// System-triggered expiry of an unpaid escrow past its deadline
    ///
    /// Idempotent: an escrow already closed reports success, so at-least-once
    /// triggers (sweeps, client polls) never double-log.
    pub async fn expire(&self, escrow_id: Uuid) -> EscrowResult<Escrow> {
        let escrow = self.store.get_escrow(escrow_id).await?;

        if escrow.status == EscrowStatus::Closed {
            return Ok(escrow);
        }
        if escrow.status != EscrowStatus::WaitingPayment {
            return Err(EscrowError::conflict(
                escrow.status,
                EscrowStatus::Closed,
                "only unpaid escrows expire",
            ));
        }
        let deadline = escrow
            .expires_at
            .ok_or_else(|| EscrowError::precondition("no payment deadline set"))?;
        if Utc::now() < deadline + Duration::seconds(self.config.deadline_grace_secs) {
            return Err(EscrowError::precondition("payment deadline not reached"));
        }

        self.apply(&escrow, EscrowStatus::Closed, None, TransitionUpdate::none())
            .await
    }

    /// Super admin reassigns another user's role
    pub async fn assign_role(
        &self,
        caller: &Profile,
        target_id: Uuid,
        role: Role,
    ) -> EscrowResult<Profile> {
        self.require_super_admin(caller)?;
        if caller.id == target_id {
            return Err(EscrowError::precondition(
                "super admin cannot reassign their own role",
            ));
        }
        let updated = self.store.set_role(target_id, role).await?;
        info!(target = %target_id, ?role, "role reassigned");
        Ok(updated)
    }

    /// Super admin updates platform-wide settings
    pub async fn update_settings(
        &self,
        caller: &Profile,
        settings: PlatformSettings,
    ) -> EscrowResult<PlatformSettings> {
        self.require_super_admin(caller)?;
        if settings.service_fee < 0 {
            return Err(EscrowError::precondition("service fee cannot be negative"));
        }
        self.store.update_settings(settings).await
    }

    /// Validate the transition against the table, persist it atomically and
    /// emit the best-effort notification
    async fn apply(
        &self,
        escrow: &Escrow,
        to: EscrowStatus,
        actor: Option<Uuid>,
        update: TransitionUpdate,
    ) -> EscrowResult<Escrow> {
        if !can_transition(escrow.status, to) {
            return Err(EscrowError::conflict(
                escrow.status,
                to,
                "transition not allowed",
            ));
        }

        let updated = self
            .store
            .transition_status(escrow.id, escrow.status, to, actor, update)
            .await?;

        info!(
            escrow_id = %escrow.id,
            from = %escrow.status,
            to = %to,
            actor = ?actor,
            "escrow transitioned"
        );
        self.dispatch(escrow.id, escrow.status, to).await;
        Ok(updated)
    }

    /// Fire-and-forget notification; failure never rolls back the committed
    /// transition
    async fn dispatch(&self, escrow_id: Uuid, from: EscrowStatus, to: EscrowStatus) {
        if let Err(err) = self.notifier.notify(escrow_id, from, to).await {
            warn!(%escrow_id, error = %err, "notification dispatch failed");
        }
    }

    fn validate_create_request(&self, request: &CreateEscrowRequest) -> EscrowResult<()> {
        if request.description.trim().is_empty() {
            return Err(EscrowError::precondition("description cannot be empty"));
        }
        if request.description.len() > 1000 {
            return Err(EscrowError::precondition("description too long"));
        }
        if request.price <= 0 {
            return Err(EscrowError::precondition("price must be greater than 0"));
        }
        if request.price > self.config.max_price {
            return Err(EscrowError::precondition(format!(
                "price {} exceeds maximum {}",
                request.price, self.config.max_price
            )));
        }
        Ok(())
    }

    fn require_admin(&self, profile: &Profile) -> EscrowResult<()> {
        if profile.role.is_admin() {
            Ok(())
        } else {
            Err(EscrowError::forbidden("admin role required"))
        }
    }

    fn require_super_admin(&self, profile: &Profile) -> EscrowResult<()> {
        if profile.role == Role::SuperAdmin {
            Ok(())
        } else {
            Err(EscrowError::forbidden("super admin role required"))
        }
    }

    fn require_buyer(&self, escrow: &Escrow, profile: &Profile) -> EscrowResult<()> {
        if escrow.buyer_id == Some(profile.id) {
            Ok(())
        } else {
            Err(EscrowError::forbidden(
                "only the buyer can perform this action",
            ))
        }
    }

    fn require_settleable(&self, escrow: &Escrow, to: EscrowStatus) -> EscrowResult<()> {
        if matches!(
            escrow.status,
            EscrowStatus::PaymentConfirmed | EscrowStatus::InProgress
        ) {
            Ok(())
        } else {
            Err(EscrowError::conflict(
                escrow.status,
                to,
                "settlement requires a confirmed payment or delivery",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::notify::LogNotifier;
    use crate::store::MemoryStore;
    use crate::token::{MemoryTokenStore, TokenServiceConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Notifier that always fails, to prove dispatch is best-effort
    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(
            &self,
            _escrow_id: Uuid,
            _from: EscrowStatus,
            _to: EscrowStatus,
        ) -> EscrowResult<()> {
            Err(EscrowError::internal("dispatcher offline"))
        }
    }

    struct Fixture {
        manager: EscrowManager,
        seller: Profile,
        buyer: Profile,
        admin: Profile,
        super_admin: Profile,
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineConfig::default(), Arc::new(LogNotifier)).await
    }

    async fn fixture_with(config: EngineConfig, notifier: Arc<dyn Notifier>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tokens = Arc::new(TokenService::new(
            TokenServiceConfig::from(&config),
            Arc::new(MemoryTokenStore::new()),
        ));

        let seller = Profile::new("seller@example.com".into(), "Sade".into(), Role::Seller);
        let buyer = Profile::new("buyer@example.com".into(), "Bayo".into(), Role::Buyer);
        let admin = Profile::new("admin@example.com".into(), "Ada".into(), Role::Admin);
        let super_admin = Profile::new("root@example.com".into(), "Sola".into(), Role::SuperAdmin);
        for profile in [&seller, &buyer, &admin, &super_admin] {
            store.upsert_profile(profile.clone()).await.unwrap();
        }

        Fixture {
            manager: EscrowManager::new(config, store, tokens, notifier),
            seller,
            buyer,
            admin,
            super_admin,
        }
    }

    fn listing(price: i64) -> CreateEscrowRequest {
        CreateEscrowRequest {
            description: "vintage camera".into(),
            price,
            product_image_path: None,
        }
    }

    /// Drive a fresh escrow to the given status on the happy path
    async fn advance(fx: &Fixture, upto: EscrowStatus) -> Escrow {
        let mut escrow = fx.manager.create(&fx.seller, listing(35000)).await.unwrap();
        if upto == EscrowStatus::Created {
            return escrow;
        }
        escrow = fx.manager.join(&fx.buyer, &escrow.code).await.unwrap();
        if upto == EscrowStatus::WaitingPayment {
            return escrow;
        }
        fx.manager
            .upload_receipt(&fx.buyer, escrow.id, "receipts/r1.jpg".into())
            .await
            .unwrap();
        escrow = fx.manager.mark_paid(&fx.buyer, escrow.id).await.unwrap();
        if upto == EscrowStatus::WaitingAdmin {
            return escrow;
        }
        escrow = fx
            .manager
            .confirm_payment(&fx.admin, escrow.id)
            .await
            .unwrap();
        if upto == EscrowStatus::PaymentConfirmed {
            return escrow;
        }
        fx.manager
            .mark_delivered(&fx.seller, escrow.id, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_happy_path_logs_every_transition() {
        let fx = fixture().await;

        let escrow = fx.manager.create(&fx.seller, listing(35000)).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Created);

        let escrow = fx.manager.join(&fx.buyer, &escrow.code).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::WaitingPayment);
        let deadline = escrow.expires_at.expect("join sets the payment deadline");
        let window = deadline - Utc::now();
        assert!(window > Duration::minutes(29) && window <= Duration::minutes(30));

        fx.manager
            .upload_receipt(&fx.buyer, escrow.id, "receipts/r1.jpg".into())
            .await
            .unwrap();
        let escrow = fx.manager.mark_paid(&fx.buyer, escrow.id).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::WaitingAdmin);

        let escrow = fx
            .manager
            .confirm_payment(&fx.admin, escrow.id)
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::PaymentConfirmed);

        let escrow = fx
            .manager
            .mark_delivered(&fx.seller, escrow.id, Some("proof/d1.jpg".into()))
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::InProgress);

        let escrow = fx
            .manager
            .confirm_received(Some(&fx.buyer), escrow.id)
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Completed);

        let history = fx.manager.store().status_history(escrow.id).await.unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(history[0].status, EscrowStatus::Created);
        assert!(history[0].changed_by.is_none());
        let actor_entries = history.iter().filter(|e| e.changed_by.is_some()).count();
        assert_eq!(actor_entries, 5);
    }

    #[tokio::test]
    async fn mark_paid_is_idempotent_without_duplicate_log() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingPayment).await;
        fx.manager
            .upload_receipt(&fx.buyer, escrow.id, "receipts/r1.jpg".into())
            .await
            .unwrap();

        let first = fx.manager.mark_paid(&fx.buyer, escrow.id).await.unwrap();
        let second = fx.manager.mark_paid(&fx.buyer, escrow.id).await.unwrap();
        assert_eq!(first.status, EscrowStatus::WaitingAdmin);
        assert_eq!(second.status, EscrowStatus::WaitingAdmin);

        let history = fx.manager.store().status_history(escrow.id).await.unwrap();
        let waiting_admin = history
            .iter()
            .filter(|e| e.status == EscrowStatus::WaitingAdmin)
            .count();
        assert_eq!(waiting_admin, 1);
    }

    #[tokio::test]
    async fn mark_paid_requires_a_receipt() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingPayment).await;

        let err = fx
            .manager
            .mark_paid(&fx.buyer, escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn racing_confirm_payment_yields_one_success_one_conflict() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingAdmin).await;

        let (a, b) = tokio::join!(
            fx.manager.confirm_payment(&fx.admin, escrow.id),
            fx.manager.confirm_payment(&fx.admin, escrow.id)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        let history = fx.manager.store().status_history(escrow.id).await.unwrap();
        let confirmed = history
            .iter()
            .filter(|e| e.status == EscrowStatus::PaymentConfirmed)
            .count();
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn confirm_payment_repeat_is_a_conflict() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::PaymentConfirmed).await;

        let err = fx
            .manager
            .confirm_payment(&fx.admin, escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn role_and_ownership_guards_are_enforced() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingAdmin).await;

        let err = fx
            .manager
            .confirm_payment(&fx.buyer, escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = fx
            .manager
            .mark_paid(&fx.seller, escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn seller_cannot_join_own_escrow_and_buyer_is_set_once() {
        let fx = fixture().await;
        let escrow = fx.manager.create(&fx.seller, listing(5000)).await.unwrap();

        let err = fx
            .manager
            .join(&fx.seller, &escrow.code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        fx.manager.join(&fx.buyer, &escrow.code).await.unwrap();

        // Same buyer retrying is fine.
        fx.manager.join(&fx.buyer, &escrow.code).await.unwrap();

        // A second buyer is not.
        let other = Profile::new("other@example.com".into(), "Obi".into(), Role::Buyer);
        fx.manager.store().upsert_profile(other.clone()).await.unwrap();
        let err = fx.manager.join(&other, &escrow.code).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn seller_is_limited_to_one_active_escrow() {
        let fx = fixture().await;
        fx.manager.create(&fx.seller, listing(5000)).await.unwrap();

        let err = fx
            .manager
            .create(&fx.seller, listing(7000))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn terminal_escrows_reject_every_further_transition() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingAdmin).await;
        fx.manager
            .force_complete(&fx.admin, escrow.id)
            .await
            .unwrap();

        let hold = fx
            .manager
            .put_on_hold(&fx.admin, escrow.id)
            .await
            .unwrap_err();
        assert_eq!(hold.kind(), ErrorKind::Conflict);

        let close = fx.manager.close(&fx.admin, escrow.id).await.unwrap_err();
        assert_eq!(close.kind(), ErrorKind::Conflict);

        let refund = fx.manager.refund(&fx.admin, escrow.id).await.unwrap_err();
        assert_eq!(refund.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn hold_round_trip_resumes_the_prior_status() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::PaymentConfirmed).await;

        let held = fx.manager.put_on_hold(&fx.admin, escrow.id).await.unwrap();
        assert_eq!(held.status, EscrowStatus::OnHold);

        let resumed = fx
            .manager
            .take_off_hold(&fx.admin, escrow.id)
            .await
            .unwrap();
        assert_eq!(resumed.status, EscrowStatus::PaymentConfirmed);
    }

    #[tokio::test]
    async fn take_off_hold_requires_a_held_escrow() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::PaymentConfirmed).await;

        let err = fx
            .manager
            .take_off_hold(&fx.admin, escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn refund_requires_confirmed_payment_or_delivery() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingAdmin).await;

        let err = fx.manager.refund(&fx.admin, escrow.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let escrow = advance_further(&fx, escrow.id).await;
        let refunded = fx.manager.refund(&fx.admin, escrow.id).await.unwrap();
        assert_eq!(refunded.status, EscrowStatus::Refunded);
    }

    async fn advance_further(fx: &Fixture, escrow_id: Uuid) -> Escrow {
        fx.manager.confirm_payment(&fx.admin, escrow_id).await.unwrap()
    }

    #[tokio::test]
    async fn seller_can_cancel_only_before_payment() {
        let fx = fixture().await;

        let escrow = advance(&fx, EscrowStatus::WaitingPayment).await;
        let closed = fx.manager.cancel(&fx.seller, escrow.id).await.unwrap();
        assert_eq!(closed.status, EscrowStatus::Closed);

        let escrow = advance(&fx, EscrowStatus::PaymentConfirmed).await;
        let err = fx.manager.cancel(&fx.seller, escrow.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        // An admin still can.
        let closed = fx.manager.cancel(&fx.admin, escrow.id).await.unwrap();
        assert_eq!(closed.status, EscrowStatus::Closed);
    }

    #[tokio::test]
    async fn buyer_cannot_cancel() {
        let fx = fixture().await;
        let escrow = advance(&fx, EscrowStatus::WaitingPayment).await;

        let err = fx.manager.cancel(&fx.buyer, escrow.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn confirm_received_requires_delivery() {
        let fx = fixture().await;

        // Before admin confirmation the buyer must not be able to complete.
        let escrow = advance(&fx, EscrowStatus::WaitingAdmin).await;
        let err = fx
            .manager
            .confirm_received(Some(&fx.buyer), escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let current = fx.manager.store().get_escrow(escrow.id).await.unwrap();
        assert_eq!(current.status, EscrowStatus::WaitingAdmin);

        // Nor after confirmation but before delivery.
        let escrow = fx
            .manager
            .confirm_payment(&fx.admin, escrow.id)
            .await
            .unwrap();
        let err = fx
            .manager
            .confirm_received(Some(&fx.buyer), escrow.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(escrow.status, EscrowStatus::PaymentConfirmed);
    }

    #[tokio::test]
    async fn joining_a_held_escrow_is_rejected() {
        let fx = fixture().await;
        let escrow = fx.manager.create(&fx.seller, listing(5000)).await.unwrap();
        fx.manager.put_on_hold(&fx.admin, escrow.id).await.unwrap();

        let err = fx.manager.join(&fx.buyer, &escrow.code).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let current = fx.manager.store().get_escrow(escrow.id).await.unwrap();
        assert_eq!(current.status, EscrowStatus::OnHold);
        assert!(current.buyer_id.is_none());
        assert!(current.expires_at.is_none());
    }

    #[tokio::test]
    async fn notification_failure_never_blocks_a_transition() {
        let fx = fixture_with(EngineConfig::default(), Arc::new(FailingNotifier)).await;

        let escrow = fx.manager.create(&fx.seller, listing(5000)).await.unwrap();
        let joined = fx.manager.join(&fx.buyer, &escrow.code).await.unwrap();
        assert_eq!(joined.status, EscrowStatus::WaitingPayment);
    }

    #[tokio::test]
    async fn one_time_token_authenticates_and_is_consumed() {
        let fx = fixture().await;
        let token = fx
            .manager
            .tokens
            .mint(fx.buyer.id, None)
            .await
            .unwrap();

        let profile = fx
            .manager
            .authenticate(Credential::OneTimeToken(token.clone()))
            .await
            .unwrap();
        assert_eq!(profile.id, fx.buyer.id);

        let err = fx
            .manager
            .authenticate(Credential::OneTimeToken(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn session_for_unknown_user_is_unauthenticated() {
        let fx = fixture().await;
        let err = fx
            .manager
            .authenticate(Credential::Session(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn only_super_admin_manages_roles_and_settings() {
        let fx = fixture().await;

        let err = fx
            .manager
            .assign_role(&fx.admin, fx.buyer.id, Role::Admin)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let promoted = fx
            .manager
            .assign_role(&fx.super_admin, fx.buyer.id, Role::Admin)
            .await
            .unwrap();
        assert_eq!(promoted.role, Role::Admin);

        let err = fx
            .manager
            .assign_role(&fx.super_admin, fx.super_admin.id, Role::Buyer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        let settings = PlatformSettings {
            service_fee: 500,
            super_admin_id: Some(fx.super_admin.id),
        };
        fx.manager
            .update_settings(&fx.super_admin, settings)
            .await
            .unwrap();

        // New escrows pick up the updated fee.
        let escrow = fx.manager.create(&fx.seller, listing(5000)).await.unwrap();
        assert_eq!(escrow.admin_fee, 500);
    }

    #[tokio::test]
    async fn create_validates_description_and_price() {
        let fx = fixture().await;

        let err = fx
            .manager
            .create(
                &fx.seller,
                CreateEscrowRequest {
                    description: "  ".into(),
                    price: 5000,
                    product_image_path: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        let err = fx
            .manager
            .create(&fx.seller, listing(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        let err = fx
            .manager
            .create(&fx.seller, listing(2_000_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    /// Store whose first `fail_inserts` escrow inserts fail as if the
    /// generated code collided
    struct CollidingStore {
        inner: MemoryStore,
        fail_inserts: AtomicUsize,
    }

    #[async_trait]
    impl EscrowStore for CollidingStore {
        async fn insert_escrow(&self, escrow: Escrow) -> EscrowResult<Escrow> {
            if self.fail_inserts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err(EscrowError::internal(format!(
                    "escrow code collision: {}",
                    escrow.code
                )));
            }
            self.inner.insert_escrow(escrow).await
        }

        async fn get_escrow(&self, id: Uuid) -> EscrowResult<Escrow> {
            self.inner.get_escrow(id).await
        }

        async fn find_escrow_by_code(&self, code: &str) -> EscrowResult<Escrow> {
            self.inner.find_escrow_by_code(code).await
        }

        async fn active_escrow_for_seller(
            &self,
            seller_id: Uuid,
        ) -> EscrowResult<Option<Escrow>> {
            self.inner.active_escrow_for_seller(seller_id).await
        }

        async fn escrows_in_status(&self, status: EscrowStatus) -> EscrowResult<Vec<Escrow>> {
            self.inner.escrows_in_status(status).await
        }

        async fn transition_status(
            &self,
            id: Uuid,
            from: EscrowStatus,
            to: EscrowStatus,
            changed_by: Option<Uuid>,
            update: TransitionUpdate,
        ) -> EscrowResult<Escrow> {
            self.inner
                .transition_status(id, from, to, changed_by, update)
                .await
        }

        async fn status_history(
            &self,
            escrow_id: Uuid,
        ) -> EscrowResult<Vec<crate::models::StatusLogEntry>> {
            self.inner.status_history(escrow_id).await
        }

        async fn insert_receipt(&self, receipt: Receipt) -> EscrowResult<Receipt> {
            self.inner.insert_receipt(receipt).await
        }

        async fn has_receipts(&self, escrow_id: Uuid) -> EscrowResult<bool> {
            self.inner.has_receipts(escrow_id).await
        }

        async fn get_profile(&self, id: Uuid) -> EscrowResult<Profile> {
            self.inner.get_profile(id).await
        }

        async fn upsert_profile(&self, profile: Profile) -> EscrowResult<Profile> {
            self.inner.upsert_profile(profile).await
        }

        async fn set_role(&self, id: Uuid, role: Role) -> EscrowResult<Profile> {
            self.inner.set_role(id, role).await
        }

        async fn get_settings(&self) -> EscrowResult<PlatformSettings> {
            self.inner.get_settings().await
        }

        async fn update_settings(
            &self,
            settings: PlatformSettings,
        ) -> EscrowResult<PlatformSettings> {
            self.inner.update_settings(settings).await
        }
    }

    async fn colliding_manager(fail_inserts: usize) -> (EscrowManager, Profile) {
        let store = Arc::new(CollidingStore {
            inner: MemoryStore::new(),
            fail_inserts: AtomicUsize::new(fail_inserts),
        });
        let seller = Profile::new("seller@example.com".into(), "Sade".into(), Role::Seller);
        store.upsert_profile(seller.clone()).await.unwrap();

        let config = EngineConfig::default();
        let tokens = Arc::new(TokenService::new(
            TokenServiceConfig::from(&config),
            Arc::new(MemoryTokenStore::new()),
        ));
        (
            EscrowManager::new(config, store, tokens, Arc::new(LogNotifier)),
            seller,
        )
    }

    #[tokio::test]
    async fn create_retries_past_a_code_collision() {
        let (manager, seller) = colliding_manager(1).await;

        let escrow = manager.create(&seller, listing(5000)).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Created);
        manager.store().get_escrow(escrow.id).await.unwrap();
    }

    #[tokio::test]
    async fn create_gives_up_after_persistent_collisions() {
        let (manager, seller) = colliding_manager(CODE_RETRY_ATTEMPTS).await;

        let err = manager.create(&seller, listing(5000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
