//! Simulated instrument for scanbot.
//!
//! This crate stands in for the scanning-probe controller so procedures can be
//! exercised without hardware. All timing uses `tokio::time`, so tests running
//! with a paused clock complete instantly.
//!
//! # Available Simulators
//!
//! - [`SimulatedInstrument`] - every gateway capability over a [`Surface`] model
//! - [`MockConnector`] / [`simulated_pool`] - connection pool handing out the instrument
//! - [`RecordingNotifier`] - captures status messages for assertions
//! - [`OdometerTracker`] - camera tip tracker following the coarse motor
//!
//! # Behavior
//!
//! - Scans take `lines x (forward + backward line time)`; pause extends them
//! - Grabbed data is in acquisition order with NaN for unscanned lines
//! - Completed scans are saved as `<basename>NNN.sxm`
//! - Tip-shaper pulses leave elliptical imprints at the FollowMe position
//! - Each Z+ move relieves a crash current by a fixed amount
//! - [`FaultConfig`] injects communication loss or per-operation failures

pub mod faults;
mod connector;
mod instrument;
mod notifier;
mod surface;
mod tracker;

pub use connector::{simulated_pool, MockConnector};
pub use faults::{FaultConfig, FaultScenario};
pub use instrument::{
    MotorMove, Odometer, SimulatedInstrument, SimulatedInstrumentBuilder, TipPulse,
};
pub use notifier::{Notification, RecordingNotifier};
pub use surface::{Feature, Imprint, Surface};
pub use tracker::OdometerTracker;
