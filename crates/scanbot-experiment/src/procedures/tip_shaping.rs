//! Automated tip shaping on clean metal.
//!
//! Each attempt scans a fresh grid frame, rejects it early if it is not flat,
//! makes a light imprint at the cleanest spot, re-scans and scores the
//! imprint. A rejected tip gets a strong pulse at the frame edge before the
//! next frame is tried.

use crate::acquire::{acquire, Acquisition, ScanOutcome};
use crate::context::{Procedure, ProcedureContext};
use crate::planner::{plan_grid, GridSpec};
use async_trait::async_trait;
use ndarray::Array2;
use rand::Rng;
use scanbot_analysis::{assess_or_sentinel, clean_coordinate, is_clean, AssessorConfig, CleanlinessCriteria, PixelSize};
use scanbot_core::capabilities::{
    FollowMe, Instrument, PiezoControl, ScanControl, ScanDirection, TipShaper, TipShaperProps,
};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::Point;
use scanbot_core::hooks::{ReshapeRequest, TipQuality};
use scanbot_core::limits::{
    CLEANLINESS_POLL, MIN_RANDOM_LIFT, MIN_TIP_LIFT, TIP_SHAPER_SETTLE, TIP_SHAPER_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Tip-shaping parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TipShapingConfig {
    /// Grid side; one attempt per frame
    pub n: usize,
    /// Frame size (m)
    pub size: f64,
    /// Minimum circularity of an accepted imprint
    pub symmetry_target: f64,
    /// Maximum imprint area of an accepted tip (nm²)
    pub size_target: f64,
    /// Lift of the light imprint pulse (m)
    pub light_lift: f64,
    /// Lift of the strong reshaping pulse (m)
    pub strong_lift: f64,
    /// Draw the strong lift uniformly from [1 nm, |strong_lift|)
    pub randomize: bool,
    /// Wait after every pulse
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Attempt limit; defaults to every grid frame
    pub max_attempts: Option<usize>,
    /// Registered reshape advisor
    pub advisor: Option<String>,
}

impl Default for TipShapingConfig {
    fn default() -> Self {
        Self {
            n: 20,
            size: 10e-9,
            symmetry_target: 0.7,
            size_target: 3.0,
            light_lift: -0.85e-9,
            strong_lift: -2.5e-9,
            randomize: true,
            settle: Duration::from_secs(1),
            max_attempts: None,
            advisor: None,
        }
    }
}

impl TipShapingConfig {
    /// Check parameters before any hardware is touched.
    pub fn validate(&self) -> ScanbotResult<()> {
        for (name, lift) in [("light_lift", self.light_lift), ("strong_lift", self.strong_lift)] {
            if !(lift < 0.0 && lift >= MIN_TIP_LIFT) {
                return Err(ScanbotError::InvalidParameter(format!(
                    "{name} must be negative and >= {:.0} nm (got {:.2} nm)",
                    MIN_TIP_LIFT * 1e9,
                    lift * 1e9
                )));
            }
        }
        if self.n == 0 {
            return Err(ScanbotError::InvalidParameter("tip shaping grid needs n >= 1".into()));
        }
        if !(self.size > 0.0) {
            return Err(ScanbotError::InvalidParameter(format!(
                "tip shaping frame size must be positive (got {})",
                self.size
            )));
        }
        if !(0.0..=1.0).contains(&self.symmetry_target) || !(self.size_target > 0.0) {
            return Err(ScanbotError::InvalidParameter(format!(
                "tip targets out of range: symmetry {} (0..1), size {} nm²",
                self.symmetry_target, self.size_target
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ScanbotError::InvalidParameter("max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    fn target(&self) -> TipQuality {
        TipQuality {
            symmetry: self.symmetry_target,
            size: self.size_target,
        }
    }

    fn light_props(&self, base: &TipShaperProps) -> TipShaperProps {
        TipShaperProps {
            change_bias: true,
            bias1: 0.1,
            lift1: self.light_lift,
            lift_time1: 0.1,
            bias2: 0.0,
            lift_time2: 0.1,
            lift3: -3.0 * self.light_lift,
            lift_time3: 0.1,
            final_wait: 0.1,
            restore_feedback: true,
            ..*base
        }
    }

    fn strong_props(&self, base: &TipShaperProps) -> TipShaperProps {
        TipShaperProps {
            lift1: self.strong_lift,
            lift3: -3.0 * self.strong_lift,
            restore_feedback: true,
            ..*base
        }
    }
}

/// Result of a tip-shaping run.
#[derive(Debug, Clone, PartialEq)]
pub struct TipShapingReport {
    /// The last imprint passed
    pub accepted: bool,
    /// Imprints that were scored
    pub attempts: usize,
    /// Score of the last imprint
    pub last: Option<TipQuality>,
}

impl TipShapingReport {
    /// Terminal summary.
    pub fn summary(&self) -> String {
        if self.accepted {
            format!("Tip shaping successful after {} attempts", self.attempts)
        } else {
            format!("Tip shaping failed after {} attempts", self.attempts)
        }
    }
}

async fn pulse(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    props: &TipShaperProps,
    settle: Duration,
) -> ScanbotResult<()> {
    props.validate()?;
    gw.tip_shaper_props_set(props).await?;
    ctx.sleep(gw, TIP_SHAPER_SETTLE).await?;
    gw.tip_shaper_start(true, TIP_SHAPER_TIMEOUT).await?;
    ctx.sleep(gw, settle).await
}

/// Uniform lift in `[1 nm, |max|)`, with the sign of `max`.
fn random_lift(max: f64) -> f64 {
    let upper = max.abs();
    if upper <= MIN_RANDOM_LIFT {
        return max;
    }
    -rand::thread_rng().gen_range(MIN_RANDOM_LIFT..upper)
}

/// Shape the tip on the clean metal under the scanner.
///
/// The grid is centred on the origin with a pitch of three frame sizes. Runs
/// until an imprint is accepted, the grid or the attempt limit is exhausted,
/// or a scan stops.
#[instrument(skip(ctx, gw, config), fields(n = config.n))]
pub async fn shape_tip(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    config: &TipShapingConfig,
) -> ScanbotResult<TipShapingReport> {
    config.validate()?;
    let range = gw.piezo_range_get().await?;
    let plan = plan_grid(
        &GridSpec {
            n: config.n,
            pitch: 3.0 * config.size,
            size: config.size,
            origin: Point::default(),
            reverse: false,
        },
        &range,
    )?;

    let base = gw.tip_shaper_props_get().await?;
    let light = config.light_props(&base);
    let mut strong = config.strong_props(&base);
    light.validate()?;
    strong.validate()?;

    ctx.set_series_name(gw, &ctx.temp_basename("sb-auto-tip")).await?;

    let max_attempts = config.max_attempts.unwrap_or(config.n * config.n);
    let target = config.target();
    let criteria = CleanlinessCriteria::default();
    let size = config.size;
    let clean_check = move |image: &Array2<f64>| is_clean(image, size, &criteria);
    let mut history = serde_json::Value::Null;
    let mut report = TipShapingReport {
        accepted: false,
        attempts: 0,
        last: None,
    };

    for (frame, cell) in plan.frames().iter().zip(plan.cells()) {
        if report.attempts >= max_attempts {
            break;
        }
        debug!(row = cell.row, col = cell.col, "Tip shaping frame");

        let acq = Acquisition::of(Some(*frame), ScanDirection::Up)
            .poll(CLEANLINESS_POLL)
            .monitor(&clean_check);
        let clean = match acquire(ctx, gw, &acq).await? {
            ScanOutcome::Completed(scan) => scan.image,
            ScanOutcome::Rejected => {
                ctx.notify("Bad area, moving scan frame");
                continue;
            }
            ScanOutcome::Stopped => break,
        };

        let spot = clean_coordinate(&clean, config.size);
        ctx.bounded("folme_xy_set", gw.folme_xy_set(frame.center() + spot, true)).await?;
        pulse(ctx, gw, &light, config.settle).await?;

        let imprint = match acquire(ctx, gw, &Acquisition::of(Some(*frame), ScanDirection::Up)).await? {
            ScanOutcome::Completed(scan) => scan,
            _ => break,
        };
        let buffer = gw.scan_buffer_get().await?;
        let pixel_size = PixelSize::of_frame(frame.width, frame.height, buffer.pixels, buffer.lines);
        let quality = assess_or_sentinel(&imprint.image, pixel_size, spot, &AssessorConfig::default())?;
        report.attempts += 1;
        report.last = Some(quality);

        if let Some(path) = &imprint.file_path {
            ctx.send_image(path);
        }
        if quality.found() {
            ctx.notify(&format!(
                "Imprint size {:.2} nm², symmetry {:.2}",
                quality.size, quality.symmetry
            ));
        } else {
            ctx.notify("Could not find the imprint");
        }

        let mut accept = quality.meets(&target);
        if let Some(advisor) = ctx.hooks().advisor(config.advisor.as_deref()) {
            let request = ReshapeRequest {
                clean_image: &clean,
                imprint: &imprint.image,
                params: &strong,
                target,
                actual: quality,
                history: &history,
            };
            match advisor.advise(&request) {
                Ok(advice) => {
                    accept = accept && advice.accept;
                    history = advice.history;
                    if let Some(params) = advice.params {
                        match params.validate() {
                            Ok(()) => strong = params,
                            Err(e) => warn!(error = %e, "Ignoring advised tip shaper settings"),
                        }
                    }
                }
                Err(e) => ctx.hook_failed(config.advisor.as_deref().unwrap_or("advisor"), e),
            }
        }

        if accept {
            report.accepted = true;
            break;
        }
        if !quality.found() {
            continue;
        }

        ctx.bounded("folme_xy_set", gw.folme_xy_set(frame.left_edge(), true)).await?;
        let mut props = strong;
        if config.randomize {
            let lift = random_lift(strong.lift1);
            props.lift1 = lift;
            props.lift3 = -3.0 * lift;
        }
        info!(lift_nm = props.lift1 * 1e9, "Strong tip-shaping pulse");
        pulse(ctx, gw, &props, config.settle).await?;
    }

    Ok(report)
}

/// Standalone tip-shaping procedure.
#[derive(Debug, Clone, Default)]
pub struct TipShaping {
    config: TipShapingConfig,
}

impl TipShaping {
    /// Procedure with `config`.
    pub fn new(config: TipShapingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for TipShaping {
    fn name(&self) -> &'static str {
        "tip shaping"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        let report = shape_tip(ctx, gw, &self.config).await?;
        Ok(report.summary())
    }
}
