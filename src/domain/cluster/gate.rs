use std::sync::{Condvar, Mutex, PoisonError};

use crate::domain::utils::sync::lock;

/// Cooperative pause point checked by component workers before each step.
#[derive(Debug, Default)]
pub struct HaltGate {
    halted: Mutex<bool>,
    resumed: Condvar,
}

impl HaltGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        *lock(&self.halted) = true;
    }

    pub fn release(&self) {
        *lock(&self.halted) = false;
        self.resumed.notify_all();
    }

    pub fn is_engaged(&self) -> bool {
        *lock(&self.halted)
    }

    /// Blocks while the gate is engaged.
    pub fn pass(&self) {
        let halted = lock(&self.halted);
        let _open = self.resumed.wait_while(halted, |halted| *halted).unwrap_or_else(PoisonError::into_inner);
    }
}
