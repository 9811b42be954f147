//! Configuration for procedure construction.

use serde::{Deserialize, Serialize};

/// Behaviour when an operation is traced while another expression holds the
/// construction lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockMode {
    /// Reject the nested operation with a reservation error.
    Strict,
    /// Evaluate the nested operation without recording it.
    #[default]
    Lenient,
}

/// Procedure factory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Reservation behaviour for nested operations.
    pub lock_mode: LockMode,

    /// Seed for stochastic expressions (dropout, random pooling). Each
    /// expression derives its own stream from this seed and its id. `None`
    /// seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Lenient,
            seed: None,
        }
    }
}

impl FactoryConfig {
    /// Strict reservations and a fixed seed.
    pub fn strict(seed: u64) -> Self {
        Self {
            lock_mode: LockMode::Strict,
            seed: Some(seed),
        }
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
