//! Coarse motion, bias ramps and reference heights.

use crate::context::ProcedureContext;
use scanbot_core::capabilities::{
    AutoApproach, BiasControl, Instrument, MotorControl, MotorDirection, ScanAction, ScanControl,
    ScanDirection, ZController,
};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::limits::{
    APPROACH_POLL, APPROACH_TIMEOUT, BIAS_RAMP_RATE, BIAS_RAMP_STEP, MIN_LIFT_STEPS,
    MOTOR_BATCH_STEPS, WITHDRAW_TIMEOUT, Z_REFERENCE_INTERVAL, Z_REFERENCE_SAMPLES,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest bias the ramp passes through (V).
const MAX_RAMP_BIAS: f64 = 10.0;

// =============================================================================
// Move Area
// =============================================================================

/// Coarse repositioning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveAreaParams {
    /// Z+ steps before moving across (at least 10)
    pub up: u32,
    /// Amplitude during the Z+ steps (V)
    pub up_voltage: f64,
    /// Frequency during the Z+ steps (Hz)
    pub up_frequency: f64,
    /// Lateral direction
    pub direction: MotorDirection,
    /// Lateral steps
    pub steps: u32,
    /// Amplitude during lateral steps (V)
    pub voltage: f64,
    /// Frequency during lateral steps (Hz)
    pub frequency: f64,
    /// Switch feedback on at the end
    pub z_on: bool,
    /// Auto approach after moving
    pub approach: bool,
}

impl Default for MoveAreaParams {
    fn default() -> Self {
        Self {
            up: 20,
            up_voltage: 270.0,
            up_frequency: 2100.0,
            direction: MotorDirection::YPlus,
            steps: 10,
            voltage: 130.0,
            frequency: 2100.0,
            z_on: true,
            approach: true,
        }
    }
}

impl MoveAreaParams {
    /// Reject moves that would drag the tip across the surface.
    pub fn validate(&self) -> ScanbotResult<()> {
        if self.up < MIN_LIFT_STEPS {
            return Err(ScanbotError::InvalidParameter(format!(
                "move area needs at least {MIN_LIFT_STEPS} Z+ steps before moving across (got {})",
                self.up
            )));
        }
        if !self.direction.is_lateral() {
            return Err(ScanbotError::InvalidParameter(format!(
                "move area direction must be X+, X-, Y+ or Y- (got {})",
                self.direction
            )));
        }
        Ok(())
    }
}

/// Lift, move across with a safety check after every batch, then approach.
pub async fn move_area(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    params: &MoveAreaParams,
) -> ScanbotResult<()> {
    params.validate()?;
    let piezo = ctx.settings().piezo;
    let up_voltage = piezo.z.clamp_voltage(params.up_voltage);
    let up_frequency = piezo.z.clamp_frequency(params.up_frequency);
    let voltage = piezo.xy.clamp_voltage(params.voltage);
    let frequency = piezo.xy.clamp_frequency(params.frequency);
    info!(
        up = params.up,
        direction = %params.direction,
        steps = params.steps,
        up_voltage,
        voltage,
        "Moving area"
    );

    gw.scan_action(ScanAction::Stop, ScanDirection::Up).await?;
    gw.withdraw(true, WITHDRAW_TIMEOUT).await?;

    gw.motor_freq_amp_set(up_frequency, up_voltage).await?;
    ctx.bounded(
        "motor_start_move",
        gw.motor_start_move(MotorDirection::ZPlus, params.up, true),
    )
    .await?;
    ctx.checkpoint(gw).await?;

    gw.motor_freq_amp_set(frequency, voltage).await?;
    if let Err(e) = move_across(ctx, gw, params.direction, params.steps).await {
        if matches!(
            e,
            ScanbotError::SafetyTripped { .. } | ScanbotError::SafetyRecoveryExhausted { .. }
        ) {
            ctx.notify("Could not complete move area");
        }
        return Err(e);
    }

    if params.approach {
        approach(ctx, gw).await?;
    }
    if params.z_on {
        gw.z_controller_set(true).await?;
    }
    Ok(())
}

async fn move_across(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    direction: MotorDirection,
    steps: u32,
) -> ScanbotResult<()> {
    let safety = ctx.safety();
    for _ in 0..steps / MOTOR_BATCH_STEPS {
        ctx.bounded(
            "motor_start_move",
            gw.motor_start_move(direction, MOTOR_BATCH_STEPS, true),
        )
        .await?;
        safety.guard(gw).await?;
        ctx.checkpoint(gw).await?;
    }
    let remainder = steps % MOTOR_BATCH_STEPS;
    if remainder > 0 {
        ctx.bounded("motor_start_move", gw.motor_start_move(direction, remainder, true))
            .await?;
    }
    safety.guard(gw).await
}

/// Run the auto approach to completion, polling with checkpoints.
pub async fn approach(ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<()> {
    gw.approach_open().await?;
    gw.approach_set(true).await?;
    info!("Auto approach started");

    let deadline = Instant::now() + APPROACH_TIMEOUT;
    loop {
        if let Err(e) = ctx.sleep(gw, APPROACH_POLL).await {
            stop_approach(gw).await;
            return Err(e);
        }
        if !gw.approach_get().await? {
            break;
        }
        if Instant::now() >= deadline {
            stop_approach(gw).await;
            return Err(ScanbotError::Timeout {
                operation: "auto approach",
                after: APPROACH_TIMEOUT,
            });
        }
    }
    ctx.notify("Approach complete");
    Ok(())
}

async fn stop_approach(gw: &dyn Instrument) {
    if let Err(e) = gw.approach_set(false).await {
        warn!(error = %e, "Failed to stop auto approach");
    }
}

// =============================================================================
// Bias & Z
// =============================================================================

/// Ramp the bias to `target` in 50 mV steps at 1 V/s.
///
/// With `z_hold` feedback is off during the ramp and switched on afterwards,
/// also when the ramp is interrupted. Ramping to exactly 0 V is refused with a
/// status message and leaves the bias untouched.
pub async fn ramp_bias(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    target: f64,
    z_hold: bool,
) -> ScanbotResult<()> {
    if target == 0.0 {
        warn!("Refusing to ramp bias to 0 V");
        ctx.notify("Cannot ramp the bias to 0 V, leaving it unchanged");
        return Ok(());
    }
    let start = gw.bias_get().await?;
    if z_hold {
        gw.z_controller_set(false).await?;
    }
    debug!(start, target, z_hold, "Ramping bias");

    let result = ramp_steps(ctx, gw, start, target).await;
    if z_hold {
        if let Err(e) = gw.z_controller_set(true).await {
            warn!(error = %e, "Failed to switch feedback back on after bias ramp");
            return result.and(Err(e));
        }
    }
    result
}

async fn ramp_steps(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    start: f64,
    target: f64,
) -> ScanbotResult<()> {
    let step = BIAS_RAMP_STEP.copysign(target - start);
    let pause = Duration::from_secs_f64(BIAS_RAMP_STEP / BIAS_RAMP_RATE);
    // intermediate values stop short of the target
    let count = ((target - start) / step - 1e-9).ceil().max(0.0) as usize;
    for i in 0..count {
        let b = start + step * i as f64;
        if b.abs() > 1e-12 && b.abs() <= MAX_RAMP_BIAS {
            gw.bias_set(b).await?;
        }
        ctx.sleep(gw, pause).await?;
    }
    gw.bias_set(target).await
}

/// Average tip height over 100 readings 10 ms apart (m).
pub async fn z_reference(gw: &dyn Instrument) -> ScanbotResult<f64> {
    let mut sum = 0.0;
    for _ in 0..Z_REFERENCE_SAMPLES {
        sum += gw.z_pos_get().await?;
        tokio::time::sleep(Z_REFERENCE_INTERVAL).await;
    }
    Ok(sum / Z_REFERENCE_SAMPLES as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::supervisor::TaskControl;
    use scanbot_core::config::Settings;
    use scanbot_driver_mock::{
        simulated_pool, FaultScenario, MockConnector, RecordingNotifier, SimulatedInstrument,
    };
    use std::sync::Arc;

    fn context(instrument: &SimulatedInstrument) -> (ProcedureContext, Arc<RecordingNotifier>, TaskControl) {
        context_with(instrument, Settings::default())
    }

    fn context_with(
        instrument: &SimulatedInstrument,
        settings: Settings,
    ) -> (ProcedureContext, Arc<RecordingNotifier>, TaskControl) {
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = simulated_pool(MockConnector::new(instrument.clone()), 2);
        let services = Arc::new(Services::new(pool, settings).with_notifier(notifier.clone()));
        let control = TaskControl::new();
        control.admit().unwrap();
        (ProcedureContext::new(services, control.clone(), "test"), notifier, control)
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_area_batches_and_clamps() {
        let instrument = SimulatedInstrument::new();
        let (ctx, notifier, _control) = context(&instrument);
        let params = MoveAreaParams {
            up: 20,
            up_voltage: 270.0,
            direction: MotorDirection::XMinus,
            steps: 25,
            ..MoveAreaParams::default()
        };
        move_area(&ctx, &instrument, &params).await.unwrap();

        let moves = instrument.motor_moves();
        let steps: Vec<(MotorDirection, u32)> = moves.iter().map(|m| (m.direction, m.steps)).collect();
        assert_eq!(
            steps,
            vec![
                (MotorDirection::ZPlus, 20),
                (MotorDirection::XMinus, 10),
                (MotorDirection::XMinus, 10),
                (MotorDirection::XMinus, 5),
            ]
        );
        // 270 V is outside the default 200 V envelope
        assert_eq!(moves[0].amplitude, 200.0);
        assert_eq!(instrument.withdrawals(), 1);
        assert_eq!(instrument.approaches(), 1);
        assert!(instrument.z_feedback());
        assert!(notifier.saw("Approach complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_area_stops_on_crash() {
        let instrument = SimulatedInstrument::builder()
            .crash_on_lateral_move(8e-9)
            .retract_relief(4e-9)
            .build();
        let (ctx, notifier, control) = context(&instrument);
        let params = MoveAreaParams {
            steps: 40,
            ..MoveAreaParams::default()
        };
        let err = move_area(&ctx, &instrument, &params).await.unwrap_err();
        assert!(matches!(err, ScanbotError::SafetyTripped { .. }));
        assert!(control.is_cancel_requested());
        assert!(notifier.saw("Could not complete move area"));

        let lateral = instrument
            .motor_moves()
            .iter()
            .filter(|m| m.direction.is_lateral())
            .count();
        assert_eq!(lateral, 1);
        assert_eq!(instrument.approaches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_motor_move_times_out() {
        let instrument = SimulatedInstrument::new();
        instrument.faults().inject(FaultScenario::Stall {
            operation: "motor_start_move",
        });
        let mut settings = Settings::default();
        settings.instrument.call_timeout = Duration::from_secs(5);
        let (ctx, _notifier, _control) = context_with(&instrument, settings);

        let err = move_area(&ctx, &instrument, &MoveAreaParams::default())
            .await
            .unwrap_err();
        match err {
            ScanbotError::Timeout { operation, after } => {
                assert_eq!(operation, "motor_start_move");
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        // the Z+ lift never finished, so nothing moved across
        let moves = instrument.motor_moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].direction, MotorDirection::ZPlus);
        assert_eq!(instrument.approaches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_area_rejects_small_lift() {
        let instrument = SimulatedInstrument::new();
        let (ctx, _notifier, _control) = context(&instrument);
        let params = MoveAreaParams {
            up: 5,
            ..MoveAreaParams::default()
        };
        assert!(move_area(&ctx, &instrument, &params).await.is_err());
        let vertical = MoveAreaParams {
            direction: MotorDirection::ZMinus,
            ..MoveAreaParams::default()
        };
        assert!(vertical.validate().is_err());
        assert!(instrument.motor_moves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_skips_zero_and_ends_on_target() {
        let instrument = SimulatedInstrument::builder().bias(0.1).build();
        let (ctx, _notifier, _control) = context(&instrument);
        ramp_bias(&ctx, &instrument, -0.1, true).await.unwrap();

        let history = instrument.bias_history();
        assert_eq!(history.len(), 4);
        assert!((history[0] - 0.1).abs() < 1e-12);
        assert!((history[1] - 0.05).abs() < 1e-12);
        assert!((history[2] + 0.05).abs() < 1e-12);
        assert_eq!(*history.last().unwrap(), -0.1);
        assert!(history.iter().all(|b| b.abs() > 1e-12));
        assert!(instrument.z_feedback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_to_zero_is_refused() {
        let instrument = SimulatedInstrument::new();
        let (ctx, notifier, _control) = context(&instrument);
        ramp_bias(&ctx, &instrument, 0.0, true).await.unwrap();
        assert!(instrument.bias_history().is_empty());
        assert!(notifier.saw("0 V"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_z_reference_averages() {
        let instrument = SimulatedInstrument::new();
        instrument.z_controller_set(false).await.unwrap();
        instrument.z_pos_set(3e-9).await.unwrap();
        let z = z_reference(&instrument).await.unwrap();
        assert!((z - 3e-9).abs() < 1e-18);
    }
}
