//! Engine configuration
//!
//! Policy knobs for deadlines, fees and token lifetimes. Values come from an
//! optional `escrow.toml` next to the binary plus `ESCROW_`-prefixed
//! environment variables; every field has a default so the engine also runs
//! unconfigured.

use serde::Deserialize;

use crate::{error::EscrowError, EscrowResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minutes a buyer has to pay after joining
    pub payment_window_mins: i64,
    /// Tolerance added to the payment deadline to absorb clock and
    /// round-trip skew
    pub deadline_grace_secs: i64,
    /// Minutes after delivery before receipt is auto-confirmed
    pub auto_confirm_mins: i64,
    /// Fallback service fee when platform settings are unset
    pub default_service_fee: i64,
    /// Upper bound on listing price, in minor units
    pub max_price: i64,
    /// How often the deadline evaluator sweeps
    pub sweep_interval_secs: u64,
    /// One-time token lifetime
    pub token_ttl_secs: u64,
    /// One-time token signing secret
    pub token_secret: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payment_window_mins: 30,
            deadline_grace_secs: 30,
            auto_confirm_mins: 5,
            default_service_fee: 300,
            max_price: 1_000_000,
            sweep_interval_secs: 60,
            token_ttl_secs: 300,
            token_secret: "dev-secret-change-me".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `escrow.toml` (optional) and the environment
    pub fn load() -> EscrowResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("escrow").required(false))
            .add_source(config::Environment::with_prefix("ESCROW"))
            .build()
            .map_err(|e| EscrowError::config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| EscrowError::config(e.to_string()))
    }
}
