//! Constant-height imaging at a series of tip heights.
//!
//! Before every scan the tip is parked at its tracked position with feedback
//! on, a reference height is taken at the setpoint, feedback is switched off
//! and the tip is offset by the next `dz` relative to that reference. A
//! drift-correction scan at constant current keeps the frame and the tracked
//! tip on the same spot; with drift correction the z drift measured between
//! references is fed into the piezo drift compensation.

use crate::acquire::{acquire, Acquisition, ScanOutcome};
use crate::context::{Procedure, ProcedureContext};
use crate::motion::ramp_bias;
use crate::planner::linspace;
use crate::procedures::{
    buffer_for, check_bias, check_setpoint, line_speed, reference_height, restore_feedback,
    tip_in_frame,
};
use async_trait::async_trait;
use scanbot_analysis::{DriftCorrector, PixelSize};
use scanbot_core::capabilities::{
    BiasControl, DriftCompensation, FollowMe, Instrument, PiezoControl, ScanControl, ScanDirection,
    ZController,
};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::{round_up_pixels, Point, ScanFrame};
use scanbot_core::limits::CURRENT_CHANNEL;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Fixed overhead per height (references, ramps, moves).
const STEP_OVERHEAD: Duration = Duration::from_secs(4);

/// Height series parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeightSeriesConfig {
    /// First offset from the reference height (m); negative is closer
    pub first_offset: f64,
    /// Last offset (m)
    pub last_offset: f64,
    /// Number of heights
    pub count: usize,
    /// Setpoint of the reference height (A); the current setpoint otherwise
    pub setpoint: Option<f64>,
    /// Bias of the reference height (V); the current bias otherwise
    pub setpoint_bias: Option<f64>,
    /// Bias during the constant-height scans (V); the current bias otherwise
    pub bias: Option<f64>,
    /// Data scan pixels
    pub pixels: Option<u32>,
    /// Data scan lines
    pub lines: Option<u32>,
    /// Data scan forward line time (s)
    pub line_time: Option<f64>,
    /// Data scan backward line time (s)
    pub backward_line_time: Option<f64>,
    /// Bias of the drift-correction scans (V); none disables drift correction
    pub drift_bias: Option<f64>,
    /// Setpoint of the drift-correction scans (A)
    pub drift_setpoint: Option<f64>,
    /// Drift-correction scan pixels
    pub drift_pixels: u32,
    /// Drift-correction scan lines
    pub drift_lines: Option<u32>,
    /// Drift-correction line time (s)
    pub drift_line_time: Option<f64>,
    /// Appended to the basename of saved files
    pub suffix: String,
}

impl Default for HeightSeriesConfig {
    fn default() -> Self {
        Self {
            first_offset: -10e-12,
            last_offset: 10e-12,
            count: 5,
            setpoint: None,
            setpoint_bias: None,
            bias: None,
            pixels: None,
            lines: None,
            line_time: None,
            backward_line_time: None,
            drift_bias: None,
            drift_setpoint: None,
            drift_pixels: 64,
            drift_lines: None,
            drift_line_time: None,
            suffix: "sb-zdep".into(),
        }
    }
}

impl HeightSeriesConfig {
    /// Offsets in acquisition order (m).
    pub fn offsets(&self) -> Vec<f64> {
        linspace(self.first_offset, self.last_offset, self.count)
    }

    /// Check parameters before any hardware is touched.
    pub fn validate(&self) -> ScanbotResult<()> {
        if self.count == 0 || !self.first_offset.is_finite() || !self.last_offset.is_finite() {
            return Err(ScanbotError::InvalidParameter(
                "height series needs at least one finite offset".into(),
            ));
        }
        for setpoint in [self.setpoint, self.drift_setpoint].into_iter().flatten() {
            check_setpoint("setpoint", setpoint)?;
        }
        for bias in [self.setpoint_bias, self.bias, self.drift_bias].into_iter().flatten() {
            check_bias("bias", bias)?;
        }
        Ok(())
    }
}

/// Constant-height scans at a series of tip heights.
#[derive(Debug, Clone, Default)]
pub struct HeightSeries {
    config: HeightSeriesConfig,
}

impl HeightSeries {
    /// Procedure with `config`.
    pub fn new(config: HeightSeriesConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for HeightSeries {
    fn name(&self) -> &'static str {
        "height series"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        let cfg = &self.config;
        cfg.validate()?;
        let (tip, frame) = tip_in_frame(gw).await?;
        let setpoint = match cfg.setpoint {
            Some(amps) => amps.abs(),
            None => gw.setpoint_get().await?,
        };
        check_setpoint("setpoint", setpoint)?;

        let result = run_series(ctx, gw, cfg, tip, frame, setpoint).await;
        restore_feedback(gw, setpoint).await;
        result?;
        Ok(format!("height series '{}' complete", cfg.suffix))
    }
}

async fn run_series(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    cfg: &HeightSeriesConfig,
    mut tip: Point,
    mut frame: ScanFrame,
    setpoint: f64,
) -> ScanbotResult<()> {
    let bias_now = gw.bias_get().await?;
    let setpoint_bias = cfg.setpoint_bias.unwrap_or(bias_now);
    let scan_bias = cfg.bias.unwrap_or(bias_now);
    check_bias("reference bias", setpoint_bias)?;
    check_bias("scan bias", scan_bias)?;

    let buffer = gw.scan_buffer_get().await?;
    let current = gw.scan_speed_get().await?;
    let (pixels, lines) = buffer_for(cfg.pixels, cfg.lines, &buffer, &frame);
    let speed = line_speed(current, cfg.line_time, cfg.backward_line_time);
    let drift_pixels = round_up_pixels(cfg.drift_pixels);
    let drift_lines = cfg
        .drift_lines
        .unwrap_or_else(|| (drift_pixels * lines / pixels.max(1)).max(1));
    let drift_speed = line_speed(current, cfg.drift_line_time, None);

    let mut per_step = speed.frame_time(lines) + STEP_OVERHEAD;
    if cfg.drift_bias.is_some() {
        per_step += drift_speed.frame_time(drift_lines) + STEP_OVERHEAD / 2;
    }
    let offsets = cfg.offsets();
    let total = offsets.len();
    let eta = chrono::Duration::from_std(per_step * total as u32).unwrap_or_else(|_| chrono::Duration::zero());
    ctx.notify(&format!(
        "Starting height series of {total} scans, expected to finish at {}",
        (chrono::Local::now() + eta).format("%H:%M:%S")
    ));

    let temp = ctx.temp_basename(&cfg.suffix);
    let channel = ctx.settings().instrument.channel;
    let mut corrector = DriftCorrector::new();
    let mut previous: Option<(f64, Instant)> = None;

    for (i, dz) in offsets.into_iter().enumerate() {
        ctx.notify(&format!("Scan {} of {total}", i + 1));

        if let Some(drift_bias) = cfg.drift_bias {
            gw.z_controller_set(true).await?;
            gw.setpoint_set(cfg.drift_setpoint.map(f64::abs).unwrap_or(setpoint)).await?;
            gw.scan_buffer_set(drift_pixels, drift_lines).await?;
            gw.scan_speed_set(&drift_speed).await?;
            ramp_bias(ctx, gw, drift_bias, true).await?;
            ctx.set_series_name(gw, &format!("{temp}{drift_bias:.2}V-DC_")).await?;
            let acq = Acquisition::of(Some(frame), ScanDirection::Up).channel(channel);
            let scan = match acquire(ctx, gw, &acq).await? {
                ScanOutcome::Completed(scan) => scan,
                _ => break,
            };
            let pixel_size = PixelSize::of_frame(frame.width, frame.height, drift_pixels, drift_lines);
            let offset = corrector.observe(&scan.image, pixel_size, frame.angle_deg)?;
            let shift = Point::new(-offset.x, -offset.y);
            frame = frame.shifted(shift);
            tip = tip + shift;
            ctx.notify(&format!(
                "Drift correction: frame moved by ({:.2}, {:.2}) nm",
                shift.x * 1e9,
                shift.y * 1e9
            ));
        }

        ctx.bounded("folme_xy_set", gw.folme_xy_set(tip, true)).await?;
        let zref = reference_height(ctx, gw, setpoint, setpoint_bias).await?;
        if cfg.drift_bias.is_some() {
            if let Some((z_prev, t_prev)) = previous {
                let elapsed = t_prev.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let comp = gw.drift_comp_get().await?;
                    let vz = comp.vz + (zref - z_prev) / elapsed;
                    gw.drift_comp_set(&DriftCompensation {
                        enabled: true,
                        vz,
                        ..comp
                    })
                    .await?;
                    debug!(vz, "Updated z drift compensation");
                }
            }
            previous = Some((zref, Instant::now()));
        }

        gw.z_controller_set(false).await?;
        ramp_bias(ctx, gw, scan_bias, false).await?;
        gw.z_pos_set(zref + dz).await?;

        gw.scan_buffer_set(pixels, lines).await?;
        gw.scan_speed_set(&speed).await?;
        let picometres = (dz * 1e12).round() as i64;
        ctx.set_series_name(gw, &format!("{temp}{picometres}pm_")).await?;
        info!(dz, zref, "Constant-height scan");
        let acq = Acquisition::of(Some(frame), ScanDirection::Down).channel(CURRENT_CHANNEL);
        match acquire(ctx, gw, &acq).await? {
            ScanOutcome::Completed(scan) => {
                if let Some(path) = &scan.file_path {
                    ctx.send_image(path);
                }
            }
            _ => break,
        }
    }
    Ok(())
}
