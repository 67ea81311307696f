//! Fault injection for DKG testing.
//!
//! Each kind has a probability in `[0, 1]`; the session rolls against it at
//! the matching decision point and misbehaves on purpose.

use llmq_core::{LlmqError, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Decision points where a session can misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedErrorKind {
    /// Do not send a contribution
    ContributionOmit,
    /// Send a wrong share to one member
    ContributionLie,
    /// Complain about a random member
    ComplainLie,
    /// Justify with a wrong share
    JustifyLie,
    /// Do not justify
    JustifyOmit,
    /// Do not send a premature commitment
    CommitOmit,
}

impl SimulatedErrorKind {
    /// All kinds.
    pub const ALL: [SimulatedErrorKind; 6] = [
        Self::ContributionOmit,
        Self::ContributionLie,
        Self::ComplainLie,
        Self::JustifyLie,
        Self::JustifyOmit,
        Self::CommitOmit,
    ];

    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContributionOmit => "contribution-omit",
            Self::ContributionLie => "contribution-lie",
            Self::ComplainLie => "complain-lie",
            Self::JustifyLie => "justify-lie",
            Self::JustifyOmit => "justify-omit",
            Self::CommitOmit => "commit-omit",
        }
    }
}

impl fmt::Display for SimulatedErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimulatedErrorKind {
    type Err = LlmqError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LlmqError::invalid(format!("unknown simulated error kind: {s}")))
    }
}

/// Shared table of injection rates.
#[derive(Debug, Default)]
pub struct SimulatedErrors {
    rates: Mutex<HashMap<SimulatedErrorKind, f64>>,
}

impl SimulatedErrors {
    /// No faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the probability of `kind`, clamped to `[0, 1]`.
    pub fn set_simulated_error_rate(&self, kind: SimulatedErrorKind, rate: f64) {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self.rates.lock().insert(kind, rate);
    }

    /// Current probability of `kind`.
    pub fn get_simulated_error_rate(&self, kind: SimulatedErrorKind) -> f64 {
        self.rates.lock().get(&kind).copied().unwrap_or(0.0)
    }

    /// Roll for `kind`.
    pub fn should_simulate(&self, kind: SimulatedErrorKind) -> bool {
        let rate = self.get_simulated_error_rate(kind);
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }
}
