//! Fault injection for the simulated instrument.
//!
//! Faults are shared by every handle to the same instrument, so a test can
//! take the controller offline while a procedure holds a lease.

use parking_lot::Mutex;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Scripted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultScenario {
    /// Every call fails as if the TCP link dropped
    CommunicationLoss,
    /// `operation` succeeds `count` times, then keeps failing
    FailAfterN {
        /// Gateway operation name, e.g. `"tip_shaper_start"`
        operation: &'static str,
        /// Successful calls before the first failure
        count: u32,
    },
    /// Waiting calls of `operation` never report completion
    Stall {
        /// Gateway operation name, e.g. `"motor_start_move"`
        operation: &'static str,
    },
}

#[derive(Debug, Default)]
struct FaultState {
    offline: bool,
    fail_after: HashMap<&'static str, u32>,
    counts: HashMap<&'static str, u32>,
    stalled: HashSet<&'static str>,
}

/// Shared fault configuration.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    state: Arc<Mutex<FaultState>>,
}

impl FaultConfig {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Faults from `scenarios`.
    pub fn scenarios(scenarios: impl IntoIterator<Item = FaultScenario>) -> Self {
        let config = Self::default();
        for scenario in scenarios {
            config.inject(scenario);
        }
        config
    }

    /// Add a scenario at runtime.
    pub fn inject(&self, scenario: FaultScenario) {
        let mut state = self.state.lock();
        match scenario {
            FaultScenario::CommunicationLoss => state.offline = true,
            FaultScenario::FailAfterN { operation, count } => {
                state.fail_after.insert(operation, count);
            }
            FaultScenario::Stall { operation } => {
                state.stalled.insert(operation);
            }
        }
    }

    /// Clear every scenario and counter.
    pub fn reset(&self) {
        *self.state.lock() = FaultState::default();
    }

    /// Whether waiting calls of `operation` hang.
    pub fn stalls(&self, operation: &'static str) -> bool {
        self.state.lock().stalled.contains(operation)
    }

    /// Fail `operation` if a scenario says so.
    pub fn check(&self, operation: &'static str) -> ScanbotResult<()> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(ScanbotError::InstrumentUnavailable(format!(
                "simulated communication loss during {operation}"
            )));
        }
        let count = state.counts.entry(operation).or_insert(0);
        *count += 1;
        let seen = *count;
        if let Some(limit) = state.fail_after.get(operation) {
            if seen > *limit {
                return Err(ScanbotError::Instrument(format!(
                    "{operation} failed (injected after {limit} calls)"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_after_n() {
        let faults = FaultConfig::scenarios([FaultScenario::FailAfterN {
            operation: "bias_set",
            count: 2,
        }]);
        assert!(faults.check("bias_set").is_ok());
        assert!(faults.check("bias_set").is_ok());
        assert!(faults.check("bias_set").is_err());
        assert!(faults.check("bias_get").is_ok());
    }

    #[test]
    fn test_communication_loss_is_connectivity() {
        let faults = FaultConfig::none();
        faults.inject(FaultScenario::CommunicationLoss);
        assert!(faults.check("current_get").unwrap_err().is_connectivity());
        faults.reset();
        assert!(faults.check("current_get").is_ok());
    }

    #[test]
    fn test_stall_is_per_operation() {
        let faults = FaultConfig::scenarios([FaultScenario::Stall {
            operation: "motor_start_move",
        }]);
        assert!(faults.stalls("motor_start_move"));
        assert!(!faults.stalls("folme_xy_set"));
        assert!(faults.check("motor_start_move").is_ok());
        faults.reset();
        assert!(!faults.stalls("motor_start_move"));
    }
}
