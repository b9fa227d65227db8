//! Escrow mediation core for peer-to-peer trades
//!
//! This crate implements the lifecycle engine behind a mediated escrow
//! platform:
//! - A pure status transition table guarding every state change
//! - A lifecycle orchestrator with per-operation role and precondition checks
//! - A deadline evaluator that expires unpaid escrows and auto-confirms
//!   delivered ones from persisted timestamps alone
//! - A single-use signed token service bridging authentication where
//!   session cookies are unavailable
//!
//! Settlement itself is manual (bank transfer confirmed by an admin); the
//! engine only tracks and guards the state of each transaction.

pub mod config;
pub mod deadline;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod store;
pub mod token;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
