//! Camera-guided coarse navigation between the sample and clean metal.
//!
//! Positions are camera pixels from the [`TipTracker`]; the marks come from
//! [`AutoInit`]. The tip is first raised until it is level with the target,
//! then stepped sideways until it is within tolerance.

use crate::context::{Procedure, ProcedureContext};
use crate::motion::{move_area, MoveAreaParams};
use crate::procedures::tip_shaping::{shape_tip, TipShapingConfig, TipShapingReport};
use async_trait::async_trait;
use scanbot_core::camera::{NavigationMarks, NavigationTarget, PixelPosition, TipTracker};
use scanbot_core::capabilities::{Instrument, MotorDirection};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::limits::MIN_LIFT_STEPS;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Step sizes and drive settings for camera navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Lateral steps per move
    pub x_steps: u32,
    /// Z+ steps per lift
    pub z_steps: u32,
    /// Lateral drive amplitude (V)
    pub xy_voltage: f64,
    /// Vertical drive amplitude (V)
    pub z_voltage: f64,
    /// Lateral drive frequency (Hz)
    pub xy_frequency: f64,
    /// Vertical drive frequency (Hz)
    pub z_frequency: f64,
    /// Accepted horizontal distance to the target (pixels)
    pub tolerance: i32,
    /// Give up after this many moves
    pub max_moves: usize,
    /// Registered illumination hook switched on while tracking
    pub illumination: Option<String>,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            x_steps: 20,
            z_steps: 100,
            xy_voltage: 130.0,
            z_voltage: 180.0,
            xy_frequency: 2100.0,
            z_frequency: 2100.0,
            tolerance: 5,
            max_moves: 200,
            illumination: None,
        }
    }
}

impl NavigationConfig {
    /// Reject lifts too small to clear the surface.
    pub fn validate(&self) -> ScanbotResult<()> {
        if self.z_steps < MIN_LIFT_STEPS || self.x_steps == 0 || self.tolerance < 0 {
            return Err(ScanbotError::InvalidParameter(format!(
                "navigation needs z_steps >= {MIN_LIFT_STEPS}, x_steps > 0 and a non-negative tolerance"
            )));
        }
        Ok(())
    }

    fn lift(&self) -> MoveAreaParams {
        MoveAreaParams {
            up: self.z_steps,
            up_voltage: self.z_voltage,
            up_frequency: self.z_frequency,
            direction: MotorDirection::XPlus,
            steps: 0,
            voltage: self.xy_voltage,
            frequency: self.xy_frequency,
            z_on: false,
            approach: false,
        }
    }

    fn across(&self, direction: MotorDirection) -> MoveAreaParams {
        MoveAreaParams {
            up: MIN_LIFT_STEPS,
            direction,
            steps: self.x_steps,
            ..self.lift()
        }
    }
}

fn light(ctx: &ProcedureContext, name: Option<&str>, on: bool) {
    if let Some(hook) = ctx.hooks().illumination(name) {
        if let Err(e) = hook.set_light(on) {
            ctx.hook_failed(name.unwrap_or("illumination"), e);
        }
    }
}

fn required_marks(ctx: &ProcedureContext, action: &'static str) -> ScanbotResult<NavigationMarks> {
    ctx.marks().ok_or(ScanbotError::NavigationRequired(action))
}

async fn drive(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    tracker: &dyn TipTracker,
    goal: PixelPosition,
    target: NavigationTarget,
    nav: &NavigationConfig,
) -> ScanbotResult<PixelPosition> {
    for _ in 0..nav.max_moves {
        ctx.checkpoint(gw).await?;
        let tip = tracker
            .locate_tip()
            .await
            .map_err(|e| ScanbotError::Instrument(format!("tip tracking failed: {e:#}")))?
            .ok_or_else(|| ScanbotError::Instrument("tip not visible in the camera".into()))?;
        debug!(x = tip.x, y = tip.y, "Tip located");

        let params = if tip.y > goal.y {
            nav.lift()
        } else if tip.x < goal.x - nav.tolerance {
            nav.across(MotorDirection::XPlus)
        } else if tip.x > goal.x + nav.tolerance {
            nav.across(MotorDirection::XMinus)
        } else {
            return Ok(tip);
        };
        move_area(ctx, gw, &params).await?;
    }
    Err(ScanbotError::Instrument(format!(
        "tip did not reach the {target} within {} moves",
        nav.max_moves
    )))
}

/// Drive the tip to `target` using the camera.
pub async fn move_tip_to(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    target: NavigationTarget,
    nav: &NavigationConfig,
) -> ScanbotResult<()> {
    nav.validate()?;
    let mut marks = required_marks(ctx, "moving the tip")?;
    let tracker = ctx
        .tracker()
        .cloned()
        .ok_or_else(|| ScanbotError::InvalidParameter("no camera tip tracker attached".into()))?;
    let goal = marks.target(target);
    info!(%target, x = goal.x, y = goal.y, "Moving tip");

    light(ctx, nav.illumination.as_deref(), true);
    let result = drive(ctx, gw, tracker.as_ref(), goal, target, nav).await;
    light(ctx, nav.illumination.as_deref(), false);

    let tip = result?;
    marks.tip = tip;
    ctx.set_marks(marks);
    ctx.notify(&format!("Tip reached the {target}"));
    Ok(())
}

/// Approach at the current position and switch feedback on.
pub async fn approach_here(ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<()> {
    move_area(
        ctx,
        gw,
        &MoveAreaParams {
            up: MIN_LIFT_STEPS,
            steps: 0,
            z_on: true,
            approach: true,
            ..MoveAreaParams::default()
        },
    )
    .await
}

/// Go to clean metal, shape the tip and come back once it is accepted.
pub async fn reshape_on_clean_metal(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    nav: &NavigationConfig,
    shaping: &TipShapingConfig,
) -> ScanbotResult<TipShapingReport> {
    required_marks(ctx, "tip shaping")?;
    ctx.notify("Moving to clean metal for tip shaping");
    move_tip_to(ctx, gw, NavigationTarget::CleanMetal, nav).await?;
    approach_here(ctx, gw).await?;

    let report = shape_tip(ctx, gw, shaping).await?;
    ctx.notify(&report.summary());
    if report.accepted {
        move_tip_to(ctx, gw, NavigationTarget::Sample, nav).await?;
        approach_here(ctx, gw).await?;
    }
    Ok(report)
}

// =============================================================================
// Procedures
// =============================================================================

/// Parameters of [`MoveTipToTarget`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveTipConfig {
    /// Where to go
    pub target: NavigationTarget,
    /// Drive settings
    pub navigation: NavigationConfig,
    /// Approach on arrival
    pub approach: bool,
    /// Shape the tip on arrival (clean metal only)
    pub tip_shape: bool,
    /// Tip-shaping parameters
    pub tip_shaping: TipShapingConfig,
    /// Go back to the sample after successful shaping
    pub return_to_sample: bool,
}

impl Default for MoveTipConfig {
    fn default() -> Self {
        Self {
            target: NavigationTarget::Sample,
            navigation: NavigationConfig::default(),
            approach: true,
            tip_shape: false,
            tip_shaping: TipShapingConfig::default(),
            return_to_sample: false,
        }
    }
}

/// Move the tip to a marked target.
#[derive(Debug, Clone, Default)]
pub struct MoveTipToTarget {
    config: MoveTipConfig,
}

impl MoveTipToTarget {
    /// Procedure with `config`.
    pub fn new(config: MoveTipConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for MoveTipToTarget {
    fn name(&self) -> &'static str {
        "move tip"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.navigation.validate()?;
        if self.config.tip_shape {
            if self.config.target != NavigationTarget::CleanMetal {
                return Err(ScanbotError::InvalidParameter(
                    "tip shaping is only done on clean metal".into(),
                ));
            }
            self.config.tip_shaping.validate()?;
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        let cfg = &self.config;
        required_marks(ctx, "moving the tip")?;
        move_tip_to(ctx, gw, cfg.target, &cfg.navigation).await?;
        if cfg.approach || cfg.tip_shape {
            approach_here(ctx, gw).await?;
        }
        if !cfg.tip_shape {
            return Ok(format!("Tip moved to the {}", cfg.target));
        }

        let report = shape_tip(ctx, gw, &cfg.tip_shaping).await?;
        if report.accepted && cfg.return_to_sample {
            ctx.notify(&report.summary());
            move_tip_to(ctx, gw, NavigationTarget::Sample, &cfg.navigation).await?;
            approach_here(ctx, gw).await?;
            return Ok("Tip shaped and returned to the sample".into());
        }
        Ok(report.summary())
    }
}

/// Coarse move as a standalone procedure.
#[derive(Debug, Clone, Default)]
pub struct MoveArea {
    params: MoveAreaParams,
}

impl MoveArea {
    /// Procedure with `params`.
    pub fn new(params: MoveAreaParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Procedure for MoveArea {
    fn name(&self) -> &'static str {
        "move area"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.params.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        move_area(ctx, gw, &self.params).await?;
        Ok("Move area complete".into())
    }
}

/// Parameters of [`AutoInit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoInitConfig {
    /// Tip position marked by the operator; the tracker wins when it sees the tip
    #[serde(default)]
    pub tip: Option<PixelPosition>,
    /// Clean metal mark
    pub clean_metal: PixelPosition,
    /// Sample mark
    pub sample: PixelPosition,
    /// Registered illumination hook
    #[serde(default)]
    pub illumination: Option<String>,
}

/// Record the navigation marks.
#[derive(Debug, Clone)]
pub struct AutoInit {
    config: AutoInitConfig,
}

impl AutoInit {
    /// Procedure with `config`.
    pub fn new(config: AutoInitConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for AutoInit {
    fn name(&self) -> &'static str {
        "auto init"
    }

    async fn execute(&mut self, ctx: &ProcedureContext, _gw: &dyn Instrument) -> ScanbotResult<String> {
        let cfg = &self.config;
        let illumination = cfg.illumination.as_deref();
        light(ctx, illumination, true);
        let located = match ctx.tracker() {
            Some(tracker) => tracker.locate_tip().await,
            None => Ok(None),
        };
        light(ctx, illumination, false);

        let tracked = located.map_err(|e| ScanbotError::Instrument(format!("tip tracking failed: {e:#}")))?;
        let tip = tracked.or(cfg.tip).ok_or_else(|| {
            ScanbotError::InvalidParameter("tip position unknown: no camera fix and none given".into())
        })?;
        ctx.set_marks(NavigationMarks {
            tip,
            clean_metal: cfg.clean_metal,
            sample: cfg.sample,
        });
        info!(tip_x = tip.x, tip_y = tip.y, "Navigation marks stored");
        Ok("Initialisation complete".into())
    }
}
