//! Procedures and task supervision for scanbot.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  start/pause/stop  ┌──────────────────┐
//! │ TaskSupervisor │───────────────────▶│   TaskControl    │
//! └───────┬────────┘                    └────────┬─────────┘
//!         │ spawn                                │ checkpoint()
//!         ▼                                      ▼
//! ┌────────────────┐  lease   ┌────────────────────────────┐
//! │ run_procedure  │─────────▶│ Procedure::execute(ctx, gw)│
//! └────────────────┘          └────────────────────────────┘
//! ```
//!
//! - [`supervisor`]: single-flight runner and the task state machine
//! - [`context`]: services, per-run context, session snapshot and restore
//! - [`acquire`]: checkpointed single-frame acquisition
//! - [`motion`]: coarse moves, approach, bias ramps and reference heights
//! - [`safety`]: crash detection and retract recovery
//! - [`planner`]: survey grids and multi-site walks
//! - [`output`]: stitched survey files
//! - [`procedures`]: the orchestration routines

pub mod acquire;
pub mod context;
pub mod motion;
pub mod output;
pub mod planner;
pub mod procedures;
pub mod safety;
pub mod supervisor;

pub use context::{run_procedure, Procedure, ProcedureContext, ProcedureOutcome, Services};
pub use supervisor::{TaskControl, TaskState, TaskSupervisor};
