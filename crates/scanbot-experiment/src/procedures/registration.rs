//! Constant-height scan with a tip lift part-way through.
//!
//! The first `lift_line` lines are scanned at `z_set` from the reference
//! height; the scan is then paused, the tip is raised by `lift` and the rest
//! of the frame is scanned there. Features seen in both parts register the
//! two heights against each other.

use crate::acquire::halt;
use crate::context::{Procedure, ProcedureContext};
use crate::motion::ramp_bias;
use crate::procedures::{
    buffer_for, check_bias, check_setpoint, line_speed, reference_height, restore_feedback,
    tip_in_frame,
};
use async_trait::async_trait;
use ndarray::Array2;
use scanbot_core::capabilities::{
    BiasControl, DataDirection, FollowMe, Instrument, ScanAction, ScanControl, ScanDirection,
    ZController,
};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::Point;
use scanbot_core::limits::{CURRENT_CHANNEL, MAX_SCAN_DURATION, SCAN_POLL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Pause on either side of the lift.
const LIFT_SETTLE: Duration = Duration::from_secs(1);

/// Registration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Height of the first part relative to the reference (m)
    pub z_set: f64,
    /// Additional lift for the rest of the frame (m)
    pub lift: f64,
    /// Acquired lines after which the tip is lifted
    pub lift_line: u32,
    /// Setpoint of the reference height (A); the current setpoint otherwise
    pub setpoint: Option<f64>,
    /// Bias of the reference height (V); the current bias otherwise
    pub setpoint_bias: Option<f64>,
    /// Bias during the scan (V); the current bias otherwise
    pub bias: Option<f64>,
    /// Pixels per line
    pub pixels: Option<u32>,
    /// Lines
    pub lines: Option<u32>,
    /// Forward line time (s)
    pub line_time: Option<f64>,
    /// Backward line time (s)
    pub backward_line_time: Option<f64>,
    /// Slow-axis direction
    pub direction: ScanDirection,
    /// Appended to the basename of the saved file
    pub suffix: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            z_set: 0.0,
            lift: 200e-12,
            lift_line: 10,
            setpoint: None,
            setpoint_bias: None,
            bias: None,
            pixels: None,
            lines: None,
            line_time: None,
            backward_line_time: None,
            direction: ScanDirection::Down,
            suffix: "sb-reg".into(),
        }
    }
}

impl RegistrationConfig {
    /// Check parameters before any hardware is touched.
    pub fn validate(&self) -> ScanbotResult<()> {
        if !self.z_set.is_finite() || !self.lift.is_finite() {
            return Err(ScanbotError::InvalidParameter("heights must be finite".into()));
        }
        if self.lift_line == 0 {
            return Err(ScanbotError::InvalidParameter("lift_line must be at least 1".into()));
        }
        if let Some(setpoint) = self.setpoint {
            check_setpoint("setpoint", setpoint)?;
        }
        for bias in [self.setpoint_bias, self.bias].into_iter().flatten() {
            check_bias("bias", bias)?;
        }
        Ok(())
    }
}

fn complete_lines(raw: &Array2<f64>) -> usize {
    raw.rows()
        .into_iter()
        .filter(|row| row.iter().all(|v| v.is_finite()))
        .count()
}

/// Constant-height registration scan.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    config: RegistrationConfig,
}

impl Registration {
    /// Procedure with `config`.
    pub fn new(config: RegistrationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for Registration {
    fn name(&self) -> &'static str {
        "registration"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        let cfg = &self.config;
        cfg.validate()?;
        let (tip, frame) = tip_in_frame(gw).await?;
        let buffer = gw.scan_buffer_get().await?;
        let (pixels, lines) = buffer_for(cfg.pixels, cfg.lines, &buffer, &frame);
        if cfg.lift_line >= lines {
            return Err(ScanbotError::InvalidParameter(format!(
                "lift_line must be below the {lines} scan lines (got {})",
                cfg.lift_line
            )));
        }
        let setpoint = match cfg.setpoint {
            Some(amps) => amps.abs(),
            None => gw.setpoint_get().await?,
        };
        check_setpoint("setpoint", setpoint)?;

        gw.scan_buffer_set(pixels, lines).await?;
        let result = register(ctx, gw, cfg, tip, setpoint).await;
        restore_feedback(gw, setpoint).await;
        if let Some(path) = result? {
            ctx.send_image(&path);
        }
        Ok(format!("registration '{}' complete", cfg.suffix))
    }
}

async fn register(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    cfg: &RegistrationConfig,
    tip: Point,
    setpoint: f64,
) -> ScanbotResult<Option<PathBuf>> {
    let bias_now = gw.bias_get().await?;
    let setpoint_bias = cfg.setpoint_bias.unwrap_or(bias_now);
    let scan_bias = cfg.bias.unwrap_or(bias_now);
    check_bias("reference bias", setpoint_bias)?;
    check_bias("scan bias", scan_bias)?;
    let speed = line_speed(gw.scan_speed_get().await?, cfg.line_time, cfg.backward_line_time);
    gw.scan_speed_set(&speed).await?;

    ctx.bounded("folme_xy_set", gw.folme_xy_set(tip, true)).await?;
    let zref = reference_height(ctx, gw, setpoint, setpoint_bias).await?;
    gw.z_controller_set(false).await?;
    ramp_bias(ctx, gw, scan_bias, false).await?;
    gw.z_pos_set(zref + cfg.z_set).await?;
    ctx.set_series_name(gw, &ctx.temp_basename(&cfg.suffix)).await?;

    info!(zref, z_set = cfg.z_set, lift = cfg.lift, lift_line = cfg.lift_line, "Registration scan");
    let direction = cfg.direction;
    gw.scan_action(ScanAction::Start, direction).await?;
    let line_poll = Duration::from_secs_f64(speed.forward_line_time + speed.backward_line_time)
        .max(Duration::from_millis(1));

    let mut lifted = false;
    let mut scanning = Duration::ZERO;
    loop {
        let polled = Instant::now();
        let wait = gw
            .wait_end_of_scan(if lifted { SCAN_POLL_TIMEOUT } else { line_poll })
            .await?;
        scanning += polled.elapsed();
        if let Err(e) = ctx.checkpoint(gw).await {
            halt(gw, direction).await;
            return Err(e);
        }
        if wait.stopped() {
            warn!("Registration scan stopped before completion");
            ctx.notify("Registration scan was stopped");
            return Ok(None);
        }
        if wait.completed() {
            return Ok(wait.file_path);
        }
        if scanning >= MAX_SCAN_DURATION {
            halt(gw, direction).await;
            return Err(ScanbotError::Timeout {
                operation: "registration scan",
                after: MAX_SCAN_DURATION,
            });
        }

        if !lifted {
            let raw = gw.frame_data_grab(CURRENT_CHANNEL, DataDirection::Forward).await?;
            if complete_lines(&raw) > cfg.lift_line as usize {
                if let Err(e) = lift_tip(ctx, gw, direction, zref + cfg.z_set + cfg.lift).await {
                    halt(gw, direction).await;
                    return Err(e);
                }
                lifted = true;
                ctx.notify(&format!(
                    "Tip lifted by {:.0} pm after line {}",
                    cfg.lift * 1e12,
                    cfg.lift_line
                ));
            }
        }
    }
}

async fn lift_tip(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    direction: ScanDirection,
    z: f64,
) -> ScanbotResult<()> {
    gw.scan_action(ScanAction::Pause, direction).await?;
    ctx.sleep(gw, LIFT_SETTLE).await?;
    gw.z_pos_set(z).await?;
    ctx.sleep(gw, LIFT_SETTLE).await?;
    gw.scan_action(ScanAction::Resume, direction).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::supervisor::TaskControl;
    use ndarray::array;
    use scanbot_core::config::Settings;
    use scanbot_driver_mock::{simulated_pool, MockConnector, RecordingNotifier, SimulatedInstrument};
    use std::sync::Arc;

    fn context(instrument: &SimulatedInstrument) -> (ProcedureContext, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = simulated_pool(MockConnector::new(instrument.clone()), 1);
        let services = Arc::new(Services::new(pool, Settings::default()).with_notifier(notifier.clone()));
        let control = TaskControl::new();
        control.admit().unwrap();
        (ProcedureContext::new(services, control, "registration"), notifier)
    }

    #[test]
    fn test_complete_lines_ignores_partial_rows() {
        let raw = array![[1.0, 2.0], [3.0, f64::NAN], [f64::NAN, f64::NAN]];
        assert_eq!(complete_lines(&raw), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tip_is_lifted_mid_scan() {
        let instrument = SimulatedInstrument::new();
        let (ctx, notifier) = context(&instrument);
        let mut procedure = Registration::new(RegistrationConfig {
            z_set: -50e-12,
            lift: 200e-12,
            ..RegistrationConfig::default()
        });

        let summary = procedure.execute(&ctx, &instrument).await.unwrap();
        assert_eq!(summary, "registration 'sb-reg' complete");

        let actions: Vec<ScanAction> = instrument.scan_actions().iter().map(|(a, _)| *a).collect();
        assert_eq!(actions, vec![ScanAction::Start, ScanAction::Pause, ScanAction::Resume]);
        assert_eq!(instrument.saved_scans(), 1);
        assert!(instrument.z_feedback());
        let z = instrument.z_pos_get().await.unwrap();
        assert!((z - 150e-12).abs() < 1e-15);
        assert!(notifier.saw("Tip lifted by 200 pm after line 10"));
        assert_eq!(notifier.images().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lift_line_must_fit_the_frame() {
        let instrument = SimulatedInstrument::new();
        let (ctx, _notifier) = context(&instrument);
        let mut procedure = Registration::new(RegistrationConfig {
            lift_line: 64,
            ..RegistrationConfig::default()
        });
        let err = procedure.execute(&ctx, &instrument).await.unwrap_err();
        assert!(matches!(err, ScanbotError::InvalidParameter(_)));
        assert!(instrument.scan_actions().is_empty());
    }
}
