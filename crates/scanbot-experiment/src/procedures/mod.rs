//! Orchestration procedures.
//!
//! Each procedure is a typed, `serde`-deserializable config plus a
//! [`Procedure`](crate::context::Procedure) implementation. Configs are
//! validated before the supervisor admits the run; everything that needs the
//! instrument is checked again inside `execute` before the first mutation.
//!
//! | procedure | module |
//! |-----------|--------|
//! | [`Survey`] | [`survey`] |
//! | [`MultiSiteSurvey`] | [`multi_survey`] |
//! | [`BiasSeries`] | [`bias_series`] |
//! | [`HeightSeries`] | [`height_series`] |
//! | [`Registration`] | [`registration`] |
//! | [`TipShaping`] | [`tip_shaping`] |
//! | [`MoveTipToTarget`], [`AutoInit`], [`MoveArea`] | [`navigation`] |

pub mod bias_series;
pub mod height_series;
pub mod multi_survey;
pub mod navigation;
pub mod registration;
pub mod survey;
pub mod tip_shaping;

pub use bias_series::{BiasSeries, BiasSeriesConfig};
pub use height_series::{HeightSeries, HeightSeriesConfig};
pub use multi_survey::{MultiSiteSurvey, MultiSurveyConfig};
pub use navigation::{AutoInit, AutoInitConfig, MoveArea, MoveTipConfig, MoveTipToTarget, NavigationConfig};
pub use registration::{Registration, RegistrationConfig};
pub use survey::{Survey, SurveyConfig};
pub use tip_shaping::{TipShaping, TipShapingConfig, TipShapingReport};

use crate::context::ProcedureContext;
use crate::motion::{ramp_bias, z_reference};
use scanbot_core::capabilities::{FollowMe, Instrument, ScanBuffer, ScanControl, ScanSpeed, ZController};
use scanbot_core::error::{ScanbotError, ScanbotResult};
use scanbot_core::frame::{lines_for_aspect, round_up_pixels, Point, ScanFrame};
use scanbot_core::limits::{MAX_SETPOINT_CURRENT, SETPOINT_SETTLE};
use tracing::{debug, error};

/// Largest bias any procedure will ramp to (V).
const MAX_BIAS: f64 = 10.0;

/// Reject a bias of 0 V or beyond the controller limit.
pub(crate) fn check_bias(name: &str, bias: f64) -> ScanbotResult<()> {
    if !bias.is_finite() || bias == 0.0 || bias.abs() > MAX_BIAS {
        return Err(ScanbotError::InvalidParameter(format!(
            "{name} must be non-zero and within ±{MAX_BIAS} V (got {bias} V)"
        )));
    }
    Ok(())
}

/// Reject setpoints above 1 nA.
pub(crate) fn check_setpoint(name: &str, amps: f64) -> ScanbotResult<()> {
    if !amps.is_finite() || amps.abs() > MAX_SETPOINT_CURRENT {
        return Err(ScanbotError::InvalidParameter(format!(
            "{name} is limited to {:.0} pA (got {:.0} pA); set larger setpoints at the controller",
            MAX_SETPOINT_CURRENT * 1e12,
            amps * 1e12
        )));
    }
    Ok(())
}

/// Pixels and lines from optional overrides.
///
/// Pixels are rounded up to a multiple of 16. Without explicit lines an
/// overridden pixel count keeps the frame aspect; otherwise the current
/// buffer is kept.
pub(crate) fn buffer_for(
    pixels: Option<u32>,
    lines: Option<u32>,
    current: &ScanBuffer,
    frame: &ScanFrame,
) -> (u32, u32) {
    let px = round_up_pixels(pixels.unwrap_or(current.pixels));
    let lx = match (lines, pixels) {
        (Some(lines), _) => lines.max(1),
        (None, Some(_)) => lines_for_aspect(px, frame),
        (None, None) => current.lines,
    };
    (px, lx)
}

/// Line timing from optional forward and backward overrides.
pub(crate) fn line_speed(current: ScanSpeed, forward: Option<f64>, backward: Option<f64>) -> ScanSpeed {
    ScanSpeed {
        forward_line_time: forward.unwrap_or(current.forward_line_time),
        backward_line_time: backward.or(forward).unwrap_or(current.backward_line_time),
    }
}

/// Tip position and scan frame, failing unless the tip is inside the frame.
pub(crate) async fn tip_in_frame(gw: &dyn Instrument) -> ScanbotResult<(Point, ScanFrame)> {
    let tip = gw.folme_xy_get().await?;
    let frame = gw.scan_frame_get().await?;
    if !frame.contains(tip) {
        return Err(ScanbotError::InvalidParameter(format!(
            "tip at ({:.2}, {:.2}) nm must be inside the scan frame",
            tip.x * 1e9,
            tip.y * 1e9
        )));
    }
    Ok((tip, frame))
}

/// Establish a reference height at `setpoint` and `bias` with feedback on.
pub(crate) async fn reference_height(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    setpoint: f64,
    bias: f64,
) -> ScanbotResult<f64> {
    gw.z_controller_set(true).await?;
    gw.setpoint_set(setpoint.abs()).await?;
    ctx.sleep(gw, SETPOINT_SETTLE).await?;
    ramp_bias(ctx, gw, bias, true).await?;
    ctx.sleep(gw, SETPOINT_SETTLE).await?;
    let zref = z_reference(gw).await?;
    debug!(zref, setpoint, bias, "Reference height");
    Ok(zref)
}

/// Switch feedback back on at `setpoint`; failures are logged.
pub(crate) async fn restore_feedback(gw: &dyn Instrument, setpoint: f64) {
    if let Err(e) = gw.z_controller_set(true).await {
        error!(error = %e, "Failed to switch feedback back on");
    }
    if let Err(e) = gw.setpoint_set(setpoint.abs()).await {
        error!(error = %e, "Failed to restore setpoint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(pixels: u32, lines: u32) -> ScanBuffer {
        ScanBuffer {
            channels: vec![14],
            pixels,
            lines,
        }
    }

    #[test]
    fn test_buffer_overrides() {
        let frame = ScanFrame::new(0.0, 0.0, 20e-9, 10e-9, 0.0).unwrap();
        assert_eq!(buffer_for(None, None, &buffer(64, 48), &frame), (64, 48));
        assert_eq!(buffer_for(Some(100), None, &buffer(64, 48), &frame), (112, 56));
        assert_eq!(buffer_for(Some(32), Some(10), &buffer(64, 48), &frame), (32, 10));
    }

    #[test]
    fn test_zero_bias_rejected() {
        assert!(check_bias("bias", 0.0).is_err());
        assert!(check_bias("bias", 12.0).is_err());
        assert!(check_bias("bias", -0.5).is_ok());
        assert!(check_setpoint("setpoint", 2e-9).is_err());
        assert!(check_setpoint("setpoint", 50e-12).is_ok());
    }

    #[test]
    fn test_backward_time_follows_forward() {
        let current = ScanSpeed {
            forward_line_time: 0.1,
            backward_line_time: 0.2,
        };
        assert_eq!(line_speed(current, None, None), current);
        let fast = line_speed(current, Some(0.05), None);
        assert_eq!((fast.forward_line_time, fast.backward_line_time), (0.05, 0.05));
    }
}
