//! Instrument gateway capabilities.
//!
//! The controller is reached through an opaque gateway. Its operations are
//! split into small per-subsystem traits so simulated instruments and tests
//! can be written against exactly what a routine needs:
//!
//! - Scan: frame, buffer, props, speed, actions, end-of-scan wait, data grab
//! - Bias, Z controller, coarse motor, auto approach, current sensor
//! - FollowMe positioner, tip shaper, piezo range and drift compensation
//!
//! [`Instrument`] is the union of all of them and is what procedures lease
//! from the connection pool.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`ScanbotResult`]; connectivity failures map to
//!   [`ScanbotError::InstrumentUnavailable`](crate::error::ScanbotError::InstrumentUnavailable)
//! - Takes an explicit timeout wherever the call blocks on the hardware

use crate::error::{ScanbotError, ScanbotResult};
use crate::frame::{PiezoRange, Point, ScanFrame};
use crate::limits::MIN_TIP_LIFT;
use async_trait::async_trait;
use ndarray::Array2;
use scanbot_pool::{ConnectionPool, Connector, Lease};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Scan Types
// =============================================================================

/// Scan control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanAction {
    /// Start (or restart) scanning from the first line
    Start,
    /// Stop scanning; the partial frame is discarded
    Stop,
    /// Freeze the scan at the current line
    Pause,
    /// Continue a paused scan
    Resume,
}

/// Slow-axis direction of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    /// Bottom to top
    #[default]
    Up,
    /// Top to bottom
    Down,
}

impl ScanDirection {
    /// The opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            ScanDirection::Up => ScanDirection::Down,
            ScanDirection::Down => ScanDirection::Up,
        }
    }
}

/// Fast-axis direction of recorded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDirection {
    /// Left to right
    Forward,
    /// Right to left
    Backward,
}

/// Scan buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanBuffer {
    /// Recorded channel indexes
    pub channels: Vec<u32>,
    /// Pixels per line (multiple of 16)
    pub pixels: u32,
    /// Lines per frame
    pub lines: u32,
}

/// Scan properties that affect file naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProps {
    /// Series basename used for saved files
    pub series_name: String,
}

/// Scan line timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanSpeed {
    /// Forward line time (s)
    pub forward_line_time: f64,
    /// Backward line time (s)
    pub backward_line_time: f64,
}

impl ScanSpeed {
    /// Time to acquire `lines` lines in both directions.
    pub fn frame_time(&self, lines: u32) -> Duration {
        let secs = (self.forward_line_time + self.backward_line_time) * f64::from(lines);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Result of waiting for the end of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanWait {
    /// The wait timed out with the scan still running
    pub timed_out: bool,
    /// File the completed frame was saved to; `None` means the scan stopped
    pub file_path: Option<PathBuf>,
}

impl ScanWait {
    /// The scan completed and was saved.
    pub fn completed(&self) -> bool {
        !self.timed_out && self.file_path.is_some()
    }

    /// The scan ended without producing a file.
    pub fn stopped(&self) -> bool {
        !self.timed_out && self.file_path.is_none()
    }
}

// =============================================================================
// Motor Types
// =============================================================================

/// Coarse motor direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorDirection {
    /// +X
    #[serde(rename = "X+")]
    XPlus,
    /// -X
    #[serde(rename = "X-")]
    XMinus,
    /// +Y
    #[serde(rename = "Y+")]
    YPlus,
    /// -Y
    #[serde(rename = "Y-")]
    YMinus,
    /// +Z (away from the sample)
    #[serde(rename = "Z+")]
    ZPlus,
    /// -Z (towards the sample)
    #[serde(rename = "Z-")]
    ZMinus,
}

impl MotorDirection {
    /// Whether the direction is lateral (X or Y).
    pub fn is_lateral(self) -> bool {
        !matches!(self, MotorDirection::ZPlus | MotorDirection::ZMinus)
    }

    /// The opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            MotorDirection::XPlus => MotorDirection::XMinus,
            MotorDirection::XMinus => MotorDirection::XPlus,
            MotorDirection::YPlus => MotorDirection::YMinus,
            MotorDirection::YMinus => MotorDirection::YPlus,
            MotorDirection::ZPlus => MotorDirection::ZMinus,
            MotorDirection::ZMinus => MotorDirection::ZPlus,
        }
    }
}

impl fmt::Display for MotorDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MotorDirection::XPlus => "X+",
            MotorDirection::XMinus => "X-",
            MotorDirection::YPlus => "Y+",
            MotorDirection::YMinus => "Y-",
            MotorDirection::ZPlus => "Z+",
            MotorDirection::ZMinus => "Z-",
        };
        write!(f, "{}", label)
    }
}

impl std::str::FromStr for MotorDirection {
    type Err = ScanbotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "X+" => Ok(MotorDirection::XPlus),
            "X-" => Ok(MotorDirection::XMinus),
            "Y+" => Ok(MotorDirection::YPlus),
            "Y-" => Ok(MotorDirection::YMinus),
            "Z+" => Ok(MotorDirection::ZPlus),
            "Z-" => Ok(MotorDirection::ZMinus),
            other => Err(ScanbotError::InvalidParameter(format!(
                "invalid motor direction '{other}', expected X+, X-, Y+, Y-, Z+ or Z-"
            ))),
        }
    }
}

// =============================================================================
// Tip Shaper & Piezo Types
// =============================================================================

/// Tip shaper pulse parameters.
///
/// A pulse optionally switches the bias to `bias1`, lowers the tip by `lift1`
/// over `lift_time1`, holds, switches to `bias2`, then raises the tip by
/// `lift3` over `lift_time3` before restoring feedback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TipShaperProps {
    /// Delay before the z controller is switched off (s)
    pub switch_off_delay: f64,
    /// Apply `bias1` during the pulse
    pub change_bias: bool,
    /// Bias during the lowering step (V)
    pub bias1: f64,
    /// First z displacement (m), negative moves towards the sample
    pub lift1: f64,
    /// Duration of the first displacement (s)
    pub lift_time1: f64,
    /// Bias after the first displacement (V)
    pub bias2: f64,
    /// Hold time at `bias2` (s)
    pub lift_time2: f64,
    /// Final z displacement (m)
    pub lift3: f64,
    /// Duration of the final displacement (s)
    pub lift_time3: f64,
    /// Wait before feedback is restored (s)
    pub final_wait: f64,
    /// Switch the z controller back on afterwards
    pub restore_feedback: bool,
}

impl TipShaperProps {
    /// Reject lifts below the controller's limit and negative times.
    pub fn validate(&self) -> Result<(), ScanbotError> {
        if self.lift1 < MIN_TIP_LIFT || self.lift3 < MIN_TIP_LIFT {
            return Err(ScanbotError::InvalidParameter(format!(
                "tip shaper lifts must be >= {MIN_TIP_LIFT:e} m (got {:e}, {:e})",
                self.lift1, self.lift3
            )));
        }
        let times = [
            self.switch_off_delay,
            self.lift_time1,
            self.lift_time2,
            self.lift_time3,
            self.final_wait,
        ];
        if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(ScanbotError::InvalidParameter(
                "tip shaper times must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Piezo drift compensation velocities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriftCompensation {
    /// Compensation enabled
    pub enabled: bool,
    /// x velocity (m/s)
    pub vx: f64,
    /// y velocity (m/s)
    pub vy: f64,
    /// z velocity (m/s)
    pub vz: f64,
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Scan subsystem.
#[async_trait]
pub trait ScanControl: Send + Sync {
    /// Read the current scan frame.
    async fn scan_frame_get(&self) -> ScanbotResult<ScanFrame>;

    /// Set the scan frame.
    async fn scan_frame_set(&self, frame: &ScanFrame) -> ScanbotResult<()>;

    /// Read the scan buffer configuration.
    async fn scan_buffer_get(&self) -> ScanbotResult<ScanBuffer>;

    /// Set pixels and lines, keeping the recorded channels.
    async fn scan_buffer_set(&self, pixels: u32, lines: u32) -> ScanbotResult<()>;

    /// Read the scan properties.
    async fn scan_props_get(&self) -> ScanbotResult<ScanProps>;

    /// Set the scan properties.
    async fn scan_props_set(&self, props: &ScanProps) -> ScanbotResult<()>;

    /// Read line timing.
    async fn scan_speed_get(&self) -> ScanbotResult<ScanSpeed>;

    /// Set line timing.
    async fn scan_speed_set(&self, speed: &ScanSpeed) -> ScanbotResult<()>;

    /// Start, stop, pause or resume scanning.
    async fn scan_action(&self, action: ScanAction, direction: ScanDirection) -> ScanbotResult<()>;

    /// Block until the current scan ends or `timeout` elapses.
    async fn wait_end_of_scan(&self, timeout: Duration) -> ScanbotResult<ScanWait>;

    /// Grab the latest data of `channel`; unscanned lines are NaN.
    async fn frame_data_grab(
        &self,
        channel: u32,
        direction: DataDirection,
    ) -> ScanbotResult<Array2<f64>>;
}

/// Tip-sample bias.
#[async_trait]
pub trait BiasControl: Send + Sync {
    /// Read the bias (V).
    async fn bias_get(&self) -> ScanbotResult<f64>;

    /// Set the bias (V).
    async fn bias_set(&self, volts: f64) -> ScanbotResult<()>;
}

/// Z (feedback) controller.
#[async_trait]
pub trait ZController: Send + Sync {
    /// Whether feedback is on.
    async fn z_controller_get(&self) -> ScanbotResult<bool>;

    /// Switch feedback on or off.
    async fn z_controller_set(&self, on: bool) -> ScanbotResult<()>;

    /// Read the current setpoint (A).
    async fn setpoint_get(&self) -> ScanbotResult<f64>;

    /// Set the current setpoint (A).
    async fn setpoint_set(&self, amps: f64) -> ScanbotResult<()>;

    /// Read the tip height (m).
    async fn z_pos_get(&self) -> ScanbotResult<f64>;

    /// Set the tip height (m); only effective with feedback off.
    async fn z_pos_set(&self, z: f64) -> ScanbotResult<()>;

    /// Withdraw the tip; with `wait` the call blocks up to `timeout`.
    async fn withdraw(&self, wait: bool, timeout: Duration) -> ScanbotResult<()>;
}

/// Coarse (stick-slip) motor.
#[async_trait]
pub trait MotorControl: Send + Sync {
    /// Set drive frequency (Hz) and amplitude (V).
    async fn motor_freq_amp_set(&self, frequency: f64, amplitude: f64) -> ScanbotResult<()>;

    /// Move `steps` steps in `direction`; with `wait` the call blocks until done.
    async fn motor_start_move(
        &self,
        direction: MotorDirection,
        steps: u32,
        wait: bool,
    ) -> ScanbotResult<()>;
}

/// Auto approach.
#[async_trait]
pub trait AutoApproach: Send + Sync {
    /// Open the approach module.
    async fn approach_open(&self) -> ScanbotResult<()>;

    /// Start or stop approaching.
    async fn approach_set(&self, on: bool) -> ScanbotResult<()>;

    /// Whether an approach is in progress.
    async fn approach_get(&self) -> ScanbotResult<bool>;
}

/// Tunnelling current sensor.
#[async_trait]
pub trait CurrentSensor: Send + Sync {
    /// Instantaneous current (A).
    async fn current_get(&self) -> ScanbotResult<f64>;
}

/// FollowMe tip positioner.
#[async_trait]
pub trait FollowMe: Send + Sync {
    /// Current tip position (m).
    async fn folme_xy_get(&self) -> ScanbotResult<Point>;

    /// Move the tip; with `wait` the call blocks until the move ends.
    async fn folme_xy_set(&self, position: Point, wait: bool) -> ScanbotResult<()>;
}

/// Tip shaper.
#[async_trait]
pub trait TipShaper: Send + Sync {
    /// Read the pulse parameters.
    async fn tip_shaper_props_get(&self) -> ScanbotResult<TipShaperProps>;

    /// Set the pulse parameters.
    async fn tip_shaper_props_set(&self, props: &TipShaperProps) -> ScanbotResult<()>;

    /// Fire a pulse; with `wait` the call blocks up to `timeout`.
    async fn tip_shaper_start(&self, wait: bool, timeout: Duration) -> ScanbotResult<()>;
}

/// Scan piezo.
#[async_trait]
pub trait PiezoControl: Send + Sync {
    /// Reachable range.
    async fn piezo_range_get(&self) -> ScanbotResult<PiezoRange>;

    /// Read drift compensation.
    async fn drift_comp_get(&self) -> ScanbotResult<DriftCompensation>;

    /// Set drift compensation.
    async fn drift_comp_set(&self, comp: &DriftCompensation) -> ScanbotResult<()>;
}

/// Every gateway capability a procedure may use.
pub trait Instrument:
    ScanControl
    + BiasControl
    + ZController
    + MotorControl
    + AutoApproach
    + CurrentSensor
    + FollowMe
    + TipShaper
    + PiezoControl
{
}

impl<T> Instrument for T where
    T: ScanControl
        + BiasControl
        + ZController
        + MotorControl
        + AutoApproach
        + CurrentSensor
        + FollowMe
        + TipShaper
        + PiezoControl
{
}

// =============================================================================
// Connections
// =============================================================================

/// Shared handle to an open instrument connection.
pub type InstrumentHandle = Arc<dyn Instrument>;

/// Connector producing instrument handles.
pub type InstrumentConnector =
    dyn Connector<Connection = InstrumentHandle, Error = ScanbotError>;

/// Pool of controller endpoints.
pub type InstrumentPool = ConnectionPool<Arc<InstrumentConnector>>;

/// Exclusive lease on one instrument connection.
pub type InstrumentLease = Lease<Arc<InstrumentConnector>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_direction_round_trips_labels() {
        for label in ["X+", "X-", "Y+", "Y-", "Z+", "Z-"] {
            let dir: MotorDirection = label.parse().unwrap();
            assert_eq!(dir.to_string(), label);
        }
        assert!("up".parse::<MotorDirection>().is_err());
        assert!(MotorDirection::YMinus.is_lateral());
        assert!(!MotorDirection::ZPlus.is_lateral());
    }

    #[test]
    fn test_tip_shaper_lift_limit() {
        let mut props = TipShaperProps {
            switch_off_delay: 0.05,
            change_bias: false,
            bias1: 0.0,
            lift1: -2e-9,
            lift_time1: 0.1,
            bias2: 0.0,
            lift_time2: 0.1,
            lift3: 6e-9,
            lift_time3: 0.1,
            final_wait: 0.1,
            restore_feedback: true,
        };
        assert!(props.validate().is_ok());
        props.lift1 = -60e-9;
        assert!(props.validate().is_err());
    }

    #[test]
    fn test_scan_wait_states() {
        let stopped = ScanWait::default();
        assert!(stopped.stopped());
        let running = ScanWait {
            timed_out: true,
            file_path: None,
        };
        assert!(!running.stopped() && !running.completed());
        let done = ScanWait {
            timed_out: false,
            file_path: Some(PathBuf::from("survey_001.sxm")),
        };
        assert!(done.completed());
    }
}
