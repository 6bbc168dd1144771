//! Shared constants for instrument pacing, safety and parameter limits.
//!
//! Centralizing these keeps the procedures and the simulated instrument in
//! agreement about step sizes and timeouts.

use std::time::Duration;

// =============================================================================
// Scan Constants
// =============================================================================

/// Scan buffer pixel counts must be multiples of this value.
pub const PIXEL_MULTIPLE: u32 = 16;

/// Default acquisition channel (topography, Z).
pub const DEFAULT_CHANNEL: u32 = 14;

/// Channel recorded in constant-height images (current).
pub const CURRENT_CHANNEL: u32 = 18;

/// Timeout handed to each `wait_end_of_scan` poll in surveys.
///
/// A poll that times out is followed by a checkpoint and another poll, so
/// this bounds how long a cancellation or pause can go unobserved.
pub const SCAN_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while scanning tip-shaping frames for cleanliness.
pub const CLEANLINESS_POLL: Duration = Duration::from_secs(3);

/// Granularity of interruptible sleeps (drift settle, approach polling).
pub const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Default bound on one blocking gateway call (motor moves, FollowMe moves).
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single scan acquisition before it is treated as stopped.
pub const MAX_SCAN_DURATION: Duration = Duration::from_secs(3600);

// =============================================================================
// Safety & Motion
// =============================================================================

/// Z+ steps per batch while recovering from a current trip.
pub const RETRACT_BATCH_STEPS: u32 = 50;

/// A warning is emitted on every n-th retract batch.
pub const RETRACT_WARN_EVERY: usize = 5;

/// Lateral motor steps moved between safety checks.
pub const MOTOR_BATCH_STEPS: u32 = 10;

/// Minimum Z+ lift before any lateral coarse move.
pub const MIN_LIFT_STEPS: u32 = 10;

/// Timeout for the withdraw that precedes every coarse move.
pub const WITHDRAW_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval while the auto approach is running.
pub const APPROACH_POLL: Duration = Duration::from_secs(1);

/// Upper bound on an auto approach.
pub const APPROACH_TIMEOUT: Duration = Duration::from_secs(1800);

// =============================================================================
// Bias & Z Controller
// =============================================================================

/// Bias ramp step (V).
pub const BIAS_RAMP_STEP: f64 = 50e-3;

/// Bias ramp rate (V/s).
pub const BIAS_RAMP_RATE: f64 = 1.0;

/// Highest setpoint current accepted when establishing a reference height (A).
pub const MAX_SETPOINT_CURRENT: f64 = 1e-9;

/// Number of z readings averaged into a reference height.
pub const Z_REFERENCE_SAMPLES: usize = 100;

/// Interval between z readings while averaging.
pub const Z_REFERENCE_INTERVAL: Duration = Duration::from_millis(10);

/// Settle time after enabling the z controller at a new setpoint.
pub const SETPOINT_SETTLE: Duration = Duration::from_millis(500);

// =============================================================================
// Tip Shaping
// =============================================================================

/// Lowest lift (most negative) the tip shaper accepts (m).
pub const MIN_TIP_LIFT: f64 = -50e-9;

/// Smallest randomized main lift magnitude (m).
pub const MIN_RANDOM_LIFT: f64 = 1e-9;

/// Timeout for a single tip-shaper pulse.
pub const TIP_SHAPER_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before and after a tip-shaper pulse.
pub const TIP_SHAPER_SETTLE: Duration = Duration::from_secs(1);
