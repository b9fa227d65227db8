//! Core data models for the escrow engine
//!
//! This module contains the escrow status state machine, the transition
//! table, and the record types persisted by the store layer.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Escrow status state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Listed by the seller, no buyer yet
    Created,
    /// Buyer joined, payment deadline running
    WaitingPayment,
    /// Buyer uploaded a receipt and marked paid, awaiting admin confirmation
    WaitingAdmin,
    /// Admin confirmed the out-of-band payment
    PaymentConfirmed,
    /// Seller marked the item delivered, awaiting buyer confirmation
    InProgress,
    /// Trade completed, funds released to the seller
    Completed,
    /// Frozen by an admin; resumes to the prior status
    OnHold,
    /// Funds returned to the buyer
    Refunded,
    /// Cancelled or expired without completing
    Closed,
}

impl EscrowStatus {
    /// Check if this is a terminal status (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded | Self::Closed)
    }

    /// Human-readable label for UIs and notifications
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::WaitingPayment => "Waiting for Payment",
            Self::WaitingAdmin => "Waiting for Admin Confirmation",
            Self::PaymentConfirmed => "Payment Confirmed",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::OnHold => "On Hold",
            Self::Refunded => "Refunded",
            Self::Closed => "Closed",
        }
    }

    /// All statuses, for exhaustive iteration
    pub const ALL: [EscrowStatus; 9] = [
        Self::Created,
        Self::WaitingPayment,
        Self::WaitingAdmin,
        Self::PaymentConfirmed,
        Self::InProgress,
        Self::Completed,
        Self::OnHold,
        Self::Refunded,
        Self::Closed,
    ];
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::WaitingPayment => "waiting_payment",
            Self::WaitingAdmin => "waiting_admin",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::OnHold => "on_hold",
            Self::Refunded => "refunded",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Pure transition table: is `from -> to` a legal status change?
///
/// Role authorization is a separate, per-operation concern layered on top in
/// the lifecycle orchestrator; this function knows nothing about callers.
pub fn can_transition(from: EscrowStatus, to: EscrowStatus) -> bool {
    use EscrowStatus::*;
    match (from, to) {
        (Created, WaitingPayment) => true,
        (Created, OnHold) => true,
        (Created, Closed) => true,
        (Created, Completed) => true,
        (WaitingPayment, WaitingAdmin) => true,
        (WaitingPayment, OnHold) => true,
        (WaitingPayment, Closed) => true,
        (WaitingPayment, Completed) => true,
        (WaitingAdmin, PaymentConfirmed) => true,
        (WaitingAdmin, OnHold) => true,
        (WaitingAdmin, Closed) => true,
        (WaitingAdmin, Completed) => true,
        (PaymentConfirmed, InProgress) => true,
        (PaymentConfirmed, Refunded) => true,
        (PaymentConfirmed, OnHold) => true,
        (PaymentConfirmed, Closed) => true,
        (PaymentConfirmed, Completed) => true,
        (InProgress, Completed) => true,
        (InProgress, Refunded) => true,
        (InProgress, OnHold) => true,
        (InProgress, Closed) => true,
        // Hold resumes to whichever non-terminal status preceded it; the
        // admin can also close or force-complete a held escrow.
        (OnHold, Created) => true,
        (OnHold, WaitingPayment) => true,
        (OnHold, WaitingAdmin) => true,
        (OnHold, PaymentConfirmed) => true,
        (OnHold, InProgress) => true,
        (OnHold, Closed) => true,
        (OnHold, Completed) => true,
        // Completed, Refunded and Closed are terminal: no outgoing edges.
        _ => false,
    }
}

/// Actor role enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
    /// Distinguished elevated identity; manages other admins and platform
    /// settings. Persisted as a role value, never matched against a
    /// hard-coded credential.
    SuperAdmin,
}

impl Role {
    /// Admins and the super admin share the admin-level transition rights
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }
}

/// Actor identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(email: String, full_name: String, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            full_name,
            role,
            created_at: Utc::now(),
        }
    }
}

/// Escrow model: one seller, at most one buyer, one lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,
    /// Human-shareable code; stored uppercase, matched case-insensitively
    pub code: String,
    pub seller_id: Uuid,
    /// Set at most once when a buyer joins, never cleared
    pub buyer_id: Option<Uuid>,
    pub description: String,
    /// Price in minor currency units, always positive
    pub price: i64,
    /// Platform fee captured from settings at creation time
    pub admin_fee: i64,
    pub product_image_path: Option<String>,
    pub delivery_proof_path: Option<String>,
    pub status: EscrowStatus,
    /// Payment deadline; meaningful only while status is WaitingPayment
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    /// Create a new escrow listing in the Created status
    pub fn new(seller_id: Uuid, description: String, price: i64, admin_fee: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: short_code(),
            seller_id,
            buyer_id: None,
            description,
            price,
            admin_fee,
            product_image_path: None,
            delivery_proof_path: None,
            status: EscrowStatus::Created,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Append-only audit record of one status transition
///
/// Also the source of truth for reconstructing deadlines (auto-confirm runs
/// off the InProgress entry timestamp) and the on-hold resume target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub id: Uuid,
    pub escrow_id: Uuid,
    /// Status the escrow entered
    pub status: EscrowStatus,
    /// Actor who triggered the change; None means system/automatic
    pub changed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl StatusLogEntry {
    pub fn new(escrow_id: Uuid, status: EscrowStatus, changed_by: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            status,
            changed_by,
            created_at: Utc::now(),
        }
    }
}

/// Buyer-uploaded proof of out-of-band payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub uploaded_by: Uuid,
    /// Blob path in the external storage service; the engine never reads it
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

impl Receipt {
    pub fn new(escrow_id: Uuid, uploaded_by: Uuid, storage_path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            uploaded_by,
            storage_path,
            created_at: Utc::now(),
        }
    }
}

/// Platform-wide settings, mutable only by the super admin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Fee applied as admin_fee to newly created escrows
    pub service_fee: i64,
    /// Persisted record of the distinguished super admin identity
    pub super_admin_id: Option<Uuid>,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            service_fee: 300,
            super_admin_id: None,
        }
    }
}

const CODE_LEN: usize = 8;
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Generate a short human-shareable escrow code (uppercase, no ambiguous
/// characters)
pub fn short_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use EscrowStatus::*;

    /// Expected adjacency of the transition table, used to enumerate every
    /// (from, to) pair exhaustively.
    fn allowed(from: EscrowStatus) -> &'static [EscrowStatus] {
        match from {
            Created => &[WaitingPayment, OnHold, Closed, Completed],
            WaitingPayment => &[WaitingAdmin, OnHold, Closed, Completed],
            WaitingAdmin => &[PaymentConfirmed, OnHold, Closed, Completed],
            PaymentConfirmed => &[InProgress, Refunded, OnHold, Closed, Completed],
            InProgress => &[Completed, Refunded, OnHold, Closed],
            OnHold => &[
                Created,
                WaitingPayment,
                WaitingAdmin,
                PaymentConfirmed,
                InProgress,
                Closed,
                Completed,
            ],
            Completed | Refunded | Closed => &[],
        }
    }

    #[test]
    fn transition_table_is_exhaustive() {
        for from in EscrowStatus::ALL {
            for to in EscrowStatus::ALL {
                let expected = allowed(from).contains(&to);
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "can_transition({from}, {to}) should be {expected}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in EscrowStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in EscrowStatus::ALL {
                assert!(!can_transition(from, to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn self_transitions_are_illegal() {
        for status in EscrowStatus::ALL {
            assert!(!can_transition(status, status));
        }
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&WaitingPayment).unwrap();
        assert_eq!(json, "\"waiting_payment\"");
        let back: EscrowStatus = serde_json::from_str("\"payment_confirmed\"").unwrap();
        assert_eq!(back, PaymentConfirmed);
    }

    #[test]
    fn short_codes_are_uppercase_and_fixed_length() {
        for _ in 0..32 {
            let code = short_code();
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn new_escrow_starts_created_without_buyer() {
        let escrow = Escrow::new(Uuid::new_v4(), "vintage camera".to_string(), 35000, 300);
        assert_eq!(escrow.status, Created);
        assert!(escrow.buyer_id.is_none());
        assert!(escrow.expires_at.is_none());
        assert!(escrow.price > 0);
    }
}
