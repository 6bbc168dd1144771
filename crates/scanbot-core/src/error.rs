//! Error taxonomy for the orchestration engine.
//!
//! `ScanbotError` is the single error type crossing crate boundaries. Instrument
//! gateway calls, procedures, the planner and the analysis routines all return
//! [`ScanbotResult`]. Hook implementations and the binary use `anyhow`; hook
//! errors are converted to [`ScanbotError::HookFailure`] where they are called.
//!
//! ## Error Categories
//!
//! 1. **Connectivity** - `InstrumentUnavailable`, `PoolExhausted`
//!    - Abort the procedure immediately, no retry
//!    - Reconnection is the caller's responsibility
//!
//! 2. **Validation** - `GridExceedsRange`, `InvalidParameter`, `Configuration`
//!    - Reported before any hardware action
//!
//! 3. **Runtime** - `Timeout`, `SafetyTripped`, `Cancelled`, `HookFailure`, ...
//!    - Trigger procedure cleanup followed by a terminal status message

use scanbot_pool::PoolError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type ScanbotResult<T> = std::result::Result<T, ScanbotError>;

/// Primary error type for scanbot.
#[derive(Error, Debug)]
pub enum ScanbotError {
    /// The instrument could not be reached.
    ///
    /// Occurs when the TCP connection or handshake to a controller endpoint
    /// fails, or when an open connection drops during a call.
    ///
    /// **Error Type**: Permanent for the current procedure.
    ///
    /// **Recovery Strategy**: Abort immediately. The operator checks the
    /// controller software and restarts the procedure.
    #[error("Instrument unavailable: {0}")]
    InstrumentUnavailable(String),

    /// Every endpoint of the connection pool is leased.
    ///
    /// **Error Type**: Fatal - the only condition requiring operator
    /// intervention, since single-flight execution never holds more than two
    /// endpoints at once.
    #[error("No ports available: all {capacity} instrument endpoints are in use")]
    PoolExhausted {
        /// Configured number of endpoints
        capacity: usize,
    },

    /// The instrument rejected or failed a command.
    ///
    /// **Error Type**: Usually permanent for the current step.
    ///
    /// **Recovery Strategy**: Abort the procedure through its cleanup path.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A planned scan frame would leave the piezo's reachable area.
    ///
    /// Raised by the grid planner before any hardware action.
    #[error(
        "Grid exceeds piezo range: frame at ({x:.3e}, {y:.3e}) m with half extent {half_extent:.3e} m \
         does not fit in range {range_x:.3e} x {range_y:.3e} m"
    )]
    GridExceedsRange {
        /// Frame center x (m)
        x: f64,
        /// Frame center y (m)
        y: f64,
        /// Largest half extent of the frame (m)
        half_extent: f64,
        /// Piezo range along x (m)
        range_x: f64,
        /// Piezo range along y (m)
        range_y: f64,
    },

    /// A blocking instrument operation did not complete in time.
    ///
    /// **Error Type**: Transient.
    ///
    /// **Recovery Strategy**: Treated as a stopped scan. The procedure either
    /// advances to its next step or ends gracefully.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// Operation that was awaited
        operation: &'static str,
        /// Time limit that elapsed
        after: Duration,
    },

    /// Tunnelling current exceeded the crash threshold.
    ///
    /// The safety monitor has already withdrawn and retracted the tip and
    /// requested global cancellation by the time this error is returned.
    #[error("Safety tripped: current {current:.3e} A exceeded threshold {threshold:.3e} A")]
    SafetyTripped {
        /// Measured current magnitude (A)
        current: f64,
        /// Configured maximum (A)
        threshold: f64,
    },

    /// Retracting did not bring the current below the threshold.
    ///
    /// **Recovery Strategy**: Operator intervention at the instrument.
    #[error("Safety recovery gave up after {batches} retract batches, current still {current:.3e} A")]
    SafetyRecoveryExhausted {
        /// Number of Z+ batches moved
        batches: usize,
        /// Last measured current (A)
        current: f64,
    },

    /// An external hook failed; the built-in default is used instead.
    #[error("Hook '{hook}' failed: {message}")]
    HookFailure {
        /// Registered hook name
        hook: String,
        /// Error reported by the hook
        message: String,
    },

    /// No imprint contour encloses the expected location.
    ///
    /// Indeterminate quality; the tip-shaping policy decides whether to retry.
    #[error("No contour encloses the expected imprint location")]
    ContourNotFound,

    /// A procedure is already active.
    #[error("Something already running")]
    AlreadyRunning,

    /// The supervisor is not in a state that accepts the request.
    #[error("Cannot {action}: task is {state}")]
    InvalidState {
        /// Requested action
        action: &'static str,
        /// Current task state
        state: String,
    },

    /// The procedure observed a cancellation request at a checkpoint.
    #[error("Cancelled")]
    Cancelled,

    /// A procedure parameter failed validation.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Navigation marks from auto-initialization are required.
    #[error("Run auto-initialization before {0}")]
    NavigationRequired(&'static str),

    /// Settings parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing processed data to disk failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ScanbotError {
    /// True when the error reports a connectivity failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ScanbotError::InstrumentUnavailable(_) | ScanbotError::PoolExhausted { .. }
        )
    }
}

impl From<PoolError<ScanbotError>> for ScanbotError {
    fn from(err: PoolError<ScanbotError>) -> Self {
        match err {
            PoolError::Exhausted { capacity } => ScanbotError::PoolExhausted { capacity },
            PoolError::Connect { endpoint, source } => match source {
                ScanbotError::InstrumentUnavailable(msg) => {
                    ScanbotError::InstrumentUnavailable(format!("{endpoint}: {msg}"))
                }
                other => ScanbotError::InstrumentUnavailable(format!("{endpoint}: {other}")),
            },
        }
    }
}

impl From<figment::Error> for ScanbotError {
    fn from(err: figment::Error) -> Self {
        ScanbotError::Configuration(err.to_string())
    }
}
