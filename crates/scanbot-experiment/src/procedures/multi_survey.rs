//! Surveys at several coarse-motor sites.
//!
//! Sites form an `nx` x `ny` snake walked with the coarse motor. The inner
//! survey alternates direction from site to site so each one starts where
//! the previous one ended.

use crate::context::{Procedure, ProcedureContext};
use crate::motion::{move_area, MoveAreaParams};
use crate::planner::{plan_sites, SiteSpec};
use crate::procedures::survey::{run_survey, SurveyConfig};
use async_trait::async_trait;
use scanbot_core::capabilities::Instrument;
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::limits::MIN_LIFT_STEPS;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Pause between finishing a site and moving on.
const SITE_PAUSE: Duration = Duration::from_secs(2);

/// Multi-site survey parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiSurveyConfig {
    /// Survey run at every site
    pub survey: SurveyConfig,
    /// Sites along x
    pub nx: usize,
    /// Sites along y
    pub ny: usize,
    /// Motor steps between sites along x; the sign picks the direction
    pub x_steps: i32,
    /// Motor steps between sites along y; the sign picks the direction
    pub y_steps: i32,
    /// Z+ steps before each move
    pub z_steps: u32,
    /// Lateral drive amplitude (V)
    pub xy_voltage: f64,
    /// Vertical drive amplitude (V)
    pub z_voltage: f64,
    /// Lateral drive frequency (Hz)
    pub xy_frequency: f64,
    /// Vertical drive frequency (Hz)
    pub z_frequency: f64,
}

impl Default for MultiSurveyConfig {
    fn default() -> Self {
        Self {
            survey: SurveyConfig::default(),
            nx: 2,
            ny: 2,
            x_steps: 20,
            y_steps: 20,
            z_steps: 500,
            xy_voltage: 120.0,
            z_voltage: 180.0,
            xy_frequency: 1100.0,
            z_frequency: 1100.0,
        }
    }
}

impl MultiSurveyConfig {
    /// Check parameters before any hardware is touched.
    pub fn validate(&self) -> ScanbotResult<()> {
        self.survey.validate()?;
        if self.nx == 0 || self.ny == 0 {
            return Err(ScanbotError::InvalidParameter(
                "multi-site survey needs nx >= 1 and ny >= 1".into(),
            ));
        }
        if self.z_steps < MIN_LIFT_STEPS {
            return Err(ScanbotError::InvalidParameter(format!(
                "z_steps must be at least {MIN_LIFT_STEPS} (got {})",
                self.z_steps
            )));
        }
        Ok(())
    }
}

/// Survey at every site of a coarse-motor grid.
#[derive(Debug, Clone, Default)]
pub struct MultiSiteSurvey {
    config: MultiSurveyConfig,
}

impl MultiSiteSurvey {
    /// Procedure with `config`.
    pub fn new(config: MultiSurveyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Procedure for MultiSiteSurvey {
    fn name(&self) -> &'static str {
        "multi-site survey"
    }

    fn validate(&self) -> ScanbotResult<()> {
        self.config.validate()
    }

    async fn execute(&mut self, ctx: &ProcedureContext, gw: &dyn Instrument) -> ScanbotResult<String> {
        let cfg = &self.config;
        let visits = plan_sites(&SiteSpec {
            nx: cfg.nx,
            ny: cfg.ny,
            x_steps: cfg.x_steps,
            y_steps: cfg.y_steps,
        })?;
        let total = visits.len();

        for (k, visit) in visits.iter().enumerate() {
            let mut inner = cfg.survey.clone();
            inner.suffix = format!("{}_y{}_x{}", cfg.survey.suffix, visit.y, visit.x);
            inner.reverse = cfg.survey.reverse ^ visit.reverse_inner;
            // only the first site resumes part-way
            if k > 0 {
                inner.start_at = 1;
            }
            info!(site = k + 1, total, y = visit.y, x = visit.x, "Surveying site");
            ctx.notify(&format!("Site {} of {total}", k + 1));
            let summary = run_survey(ctx, gw, &inner).await?;
            ctx.notify(&summary);

            let Some((direction, steps)) = visit.then_move else {
                continue;
            };
            ctx.sleep(gw, SITE_PAUSE).await?;
            ctx.notify(&format!("Moving {steps} steps in {direction}"));
            move_area(
                ctx,
                gw,
                &MoveAreaParams {
                    up: cfg.z_steps,
                    up_voltage: cfg.z_voltage,
                    up_frequency: cfg.z_frequency,
                    direction,
                    steps,
                    voltage: cfg.xy_voltage,
                    frequency: cfg.xy_frequency,
                    z_on: true,
                    approach: true,
                },
            )
            .await?;
            ctx.sleep(gw, cfg.survey.settle).await?;
        }

        Ok(format!("multi-site survey '{}' done", cfg.survey.suffix))
    }
}
