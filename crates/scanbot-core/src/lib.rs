//! Core types and traits for the scanbot orchestration engine.
//!
//! - [`capabilities`]: instrument gateway traits and their data types
//! - [`frame`]: scan-frame geometry and pixel rules
//! - [`error`]: the shared error taxonomy
//! - [`config`]: layered, read-only settings
//! - [`notify`], [`hooks`], [`camera`]: outbound collaborators
//! - [`limits`]: pacing, safety and parameter constants

pub mod camera;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod frame;
pub mod hooks;
pub mod limits;
pub mod notify;

pub use capabilities::{Instrument, InstrumentHandle, InstrumentLease, InstrumentPool};
pub use error::{ScanbotError, ScanbotResult};
pub use frame::{GridCell, PiezoRange, Point, ScanFrame};
