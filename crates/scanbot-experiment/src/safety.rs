//! Crash detection and recovery.
//!
//! After every coarse motor batch the tunnelling current is compared against
//! the configured threshold. A trip withdraws the tip, requests cancellation
//! of the whole run and backs the tip off in Z+ batches until the current is
//! safe again, then reports [`ScanbotError::SafetyTripped`] so the caller
//! unwinds.

use crate::context::bounded;
use crate::supervisor::TaskControl;
use scanbot_core::capabilities::{CurrentSensor, Instrument, MotorControl, MotorDirection, ZController};
use scanbot_core::config::SafetyThresholds;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::limits::{CALL_TIMEOUT, RETRACT_BATCH_STEPS, RETRACT_WARN_EVERY, WITHDRAW_TIMEOUT};
use scanbot_core::notify::{Notifier, Reaction};
use std::time::Duration;
use tracing::{error, info, warn};

/// Current threshold check plus retract recovery.
pub struct SafetyMonitor<'a> {
    thresholds: SafetyThresholds,
    notifier: &'a dyn Notifier,
    control: &'a TaskControl,
    call_timeout: Duration,
}

impl<'a> SafetyMonitor<'a> {
    /// Monitor reporting to `notifier` and cancelling through `control`.
    pub fn new(thresholds: SafetyThresholds, notifier: &'a dyn Notifier, control: &'a TaskControl) -> Self {
        Self {
            thresholds,
            notifier,
            control,
            call_timeout: CALL_TIMEOUT,
        }
    }

    /// Bound each retract batch by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Whether `current` is below the crash threshold.
    pub fn is_safe(&self, current: f64) -> bool {
        current.abs() < self.thresholds.max_current
    }

    /// Read the current and recover if it is over the threshold.
    ///
    /// Returns `Ok(())` when safe. After a trip the tip has been withdrawn and
    /// retracted, cancellation has been requested, and
    /// [`ScanbotError::SafetyTripped`] is returned.
    pub async fn guard(&self, gw: &dyn Instrument) -> ScanbotResult<()> {
        let initial = gw.current_get().await?;
        if self.is_safe(initial) {
            return Ok(());
        }

        let threshold = self.thresholds.max_current;
        warn!(current = initial, threshold, "Safety tripped");
        self.notifier.react(Reaction::Warning);
        self.notifier.send_text(&format!(
            "Safety tripped: current {:.3} nA exceeds {:.3} nA. Withdrawing and retracting tip.",
            initial.abs() * 1e9,
            threshold * 1e9
        ));

        if let Err(e) = gw.withdraw(false, WITHDRAW_TIMEOUT).await {
            error!(error = %e, "Withdraw during safety recovery failed");
        }
        self.control.request_cancel();

        self.retract(gw, initial).await?;

        self.notifier
            .send_text("Safety retract complete. Inspect the tip before continuing.");
        Err(ScanbotError::SafetyTripped {
            current: initial.abs(),
            threshold,
        })
    }

    async fn retract(&self, gw: &dyn Instrument, mut current: f64) -> ScanbotResult<()> {
        gw.motor_freq_amp_set(self.thresholds.retract_frequency, self.thresholds.retract_voltage)
            .await?;

        let mut batches = 0usize;
        while !self.is_safe(current) {
            if batches >= self.thresholds.max_retract_batches {
                error!(batches, current, "Safety retract exhausted");
                self.notifier.send_text(&format!(
                    "Safety retract gave up after {batches} batches; current still {:.3} nA",
                    current.abs() * 1e9
                ));
                return Err(ScanbotError::SafetyRecoveryExhausted { batches, current });
            }
            bounded(
                "motor_start_move",
                self.call_timeout,
                gw.motor_start_move(MotorDirection::ZPlus, RETRACT_BATCH_STEPS, true),
            )
            .await?;
            batches += 1;
            current = gw.current_get().await?;

            if batches % RETRACT_WARN_EVERY == 0 {
                warn!(batches, current, "Still retracting");
                self.notifier.send_text(&format!(
                    "Still retracting after {} Z+ steps, current {:.3} nA",
                    batches as u32 * RETRACT_BATCH_STEPS,
                    current.abs() * 1e9
                ));
            }
        }
        info!(batches, current, "Current back below threshold");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanbot_driver_mock::{FaultScenario, RecordingNotifier, SimulatedInstrument};

    fn thresholds() -> SafetyThresholds {
        SafetyThresholds {
            max_current: 5e-9,
            ..SafetyThresholds::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_current_passes() {
        let instrument = SimulatedInstrument::new();
        let notifier = RecordingNotifier::new();
        let control = TaskControl::new();
        let monitor = SafetyMonitor::new(thresholds(), &notifier, &control);
        monitor.guard(&instrument).await.unwrap();
        assert!(instrument.motor_moves().is_empty());
        assert!(notifier.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_retracts_until_safe() {
        let instrument = SimulatedInstrument::builder()
            .crash_current(10e-9)
            .retract_relief(2e-9)
            .build();
        let notifier = RecordingNotifier::new();
        let control = TaskControl::new();
        control.admit().unwrap();
        let monitor = SafetyMonitor::new(thresholds(), &notifier, &control);

        let err = monitor.guard(&instrument).await.unwrap_err();
        match err {
            ScanbotError::SafetyTripped { current, threshold } => {
                assert_eq!(current, 10e-9);
                assert_eq!(threshold, 5e-9);
            }
            other => panic!("unexpected {other:?}"),
        }

        // 10 nA -> 8 -> 6 -> 4
        let moves = instrument.motor_moves();
        assert_eq!(moves.len(), 3);
        assert!(moves
            .iter()
            .all(|m| m.direction == MotorDirection::ZPlus && m.steps == RETRACT_BATCH_STEPS));
        assert_eq!(moves[0].amplitude, 200.0);
        assert_eq!(moves[0].frequency, 1500.0);
        assert_eq!(instrument.withdrawals(), 1);
        assert!(control.is_cancel_requested());
        assert!(notifier.saw("Safety tripped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retract_gives_up() {
        let instrument = SimulatedInstrument::builder()
            .crash_current(100e-9)
            .retract_relief(1e-9)
            .build();
        let notifier = RecordingNotifier::new();
        let control = TaskControl::new();
        let limits = SafetyThresholds {
            max_retract_batches: 6,
            ..thresholds()
        };
        let monitor = SafetyMonitor::new(limits, &notifier, &control);

        let err = monitor.guard(&instrument).await.unwrap_err();
        assert!(matches!(err, ScanbotError::SafetyRecoveryExhausted { batches: 6, .. }));
        assert!(notifier.saw("Still retracting after 250 Z+ steps"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_retract_times_out() {
        let instrument = SimulatedInstrument::builder()
            .crash_current(10e-9)
            .retract_relief(2e-9)
            .build();
        instrument.faults().inject(FaultScenario::Stall {
            operation: "motor_start_move",
        });
        let notifier = RecordingNotifier::new();
        let control = TaskControl::new();
        control.admit().unwrap();
        let monitor = SafetyMonitor::new(thresholds(), &notifier, &control)
            .with_call_timeout(Duration::from_secs(2));

        let err = monitor.guard(&instrument).await.unwrap_err();
        assert!(matches!(
            err,
            ScanbotError::Timeout {
                operation: "motor_start_move",
                ..
            }
        ));
        assert_eq!(instrument.motor_moves().len(), 1);
        assert!(control.is_cancel_requested());
    }
}
