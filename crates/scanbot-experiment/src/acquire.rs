//! Acquire one frame with a checkpointed wait.
//!
//! Every procedure acquires through [`acquire`]: set the frame, start, wait
//! for the end of the scan in short polls with a checkpoint after each, and
//! grab the result in display orientation (row 0 at the top).
//!
//! An optional monitor sees each partial image while the scan runs and the
//! final one; returning `false` stops the scan and reports
//! [`ScanOutcome::Rejected`].

use crate::context::ProcedureContext;
use ndarray::Array2;
use scanbot_analysis::filters::flip_rows;
use scanbot_core::capabilities::{DataDirection, Instrument, ScanAction, ScanControl, ScanDirection};
use scanbot_core::error::ScanbotResult;
use scanbot_core::frame::ScanFrame;
use scanbot_core::limits::{DEFAULT_CHANNEL, MAX_SCAN_DURATION, SCAN_POLL_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Predicate over a (partial) image in display orientation.
pub type ImageMonitor<'a> = &'a (dyn Fn(&Array2<f64>) -> bool + Send + Sync);

/// Parameters of one acquisition.
#[derive(Clone, Copy)]
pub struct Acquisition<'a> {
    /// Frame to set first; `None` scans the current frame
    pub frame: Option<ScanFrame>,
    /// Slow-axis direction
    pub direction: ScanDirection,
    /// Drift settle time after the first start, followed by a restart
    pub settle: Duration,
    /// Channel to grab
    pub channel: u32,
    /// Timeout of each end-of-scan poll
    pub poll: Duration,
    /// Scan time after which the acquisition counts as stopped
    pub timeout: Duration,
    /// Optional acceptance check on partial and final images
    pub monitor: Option<ImageMonitor<'a>>,
}

impl Default for Acquisition<'_> {
    fn default() -> Self {
        Self {
            frame: None,
            direction: ScanDirection::Up,
            settle: Duration::ZERO,
            channel: DEFAULT_CHANNEL,
            poll: SCAN_POLL_TIMEOUT,
            timeout: MAX_SCAN_DURATION,
            monitor: None,
        }
    }
}

impl<'a> Acquisition<'a> {
    /// Scan `frame` in `direction`.
    pub fn of(frame: Option<ScanFrame>, direction: ScanDirection) -> Self {
        Self {
            frame,
            direction,
            ..Self::default()
        }
    }

    /// Grab `channel` instead of the default.
    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    /// Wait `settle` after the first start and restart.
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Poll the scan every `poll`.
    pub fn poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Check partial images with `monitor`.
    pub fn monitor(mut self, monitor: ImageMonitor<'a>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

impl std::fmt::Debug for Acquisition<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("frame", &self.frame)
            .field("direction", &self.direction)
            .field("settle", &self.settle)
            .field("channel", &self.channel)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

/// A completed frame.
#[derive(Debug, Clone)]
pub struct ScanImage {
    /// Data in display orientation
    pub image: Array2<f64>,
    /// File the instrument saved
    pub file_path: Option<PathBuf>,
    /// Frame that was scanned
    pub frame: ScanFrame,
}

/// How an acquisition ended.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// The scan completed
    Completed(ScanImage),
    /// The scan stopped or timed out without producing a file
    Stopped,
    /// The monitor rejected the image and the scan was stopped
    Rejected,
}

/// Orient grabbed data so row 0 is the top of the frame.
pub fn display_oriented(raw: Array2<f64>, direction: ScanDirection) -> Array2<f64> {
    match direction {
        ScanDirection::Up => flip_rows(&raw),
        ScanDirection::Down => raw,
    }
}

pub(crate) async fn halt(gw: &dyn Instrument, direction: ScanDirection) {
    if let Err(e) = gw.scan_action(ScanAction::Stop, direction).await {
        warn!(error = %e, "Failed to stop scan");
    }
}

async fn grab(gw: &dyn Instrument, acq: &Acquisition<'_>) -> ScanbotResult<Array2<f64>> {
    let raw = gw.frame_data_grab(acq.channel, DataDirection::Forward).await?;
    Ok(display_oriented(raw, acq.direction))
}

/// Acquire one frame.
///
/// A cancellation observed while waiting stops the scan and is returned as
/// an error; everything else ends in a [`ScanOutcome`].
pub async fn acquire(
    ctx: &ProcedureContext,
    gw: &dyn Instrument,
    acq: &Acquisition<'_>,
) -> ScanbotResult<ScanOutcome> {
    let frame = match acq.frame {
        Some(frame) => {
            gw.scan_frame_set(&frame).await?;
            frame
        }
        None => gw.scan_frame_get().await?,
    };
    gw.scan_action(ScanAction::Start, acq.direction).await?;

    if !acq.settle.is_zero() {
        debug!(settle = ?acq.settle, "Waiting for drift to settle");
        if let Err(e) = ctx.sleep(gw, acq.settle).await {
            halt(gw, acq.direction).await;
            return Err(e);
        }
        gw.scan_action(ScanAction::Start, acq.direction).await?;
    }

    let mut scanning = Duration::ZERO;
    loop {
        let polled = Instant::now();
        let wait = gw.wait_end_of_scan(acq.poll).await?;
        scanning += polled.elapsed();

        if let Err(e) = ctx.checkpoint(gw).await {
            halt(gw, acq.direction).await;
            return Err(e);
        }

        if wait.stopped() {
            warn!(procedure = ctx.procedure(), "Scan stopped before completion");
            return Ok(ScanOutcome::Stopped);
        }

        if wait.completed() {
            let image = grab(gw, acq).await?;
            if let Some(monitor) = acq.monitor {
                if !monitor(&image) {
                    return Ok(ScanOutcome::Rejected);
                }
            }
            return Ok(ScanOutcome::Completed(ScanImage {
                image,
                file_path: wait.file_path,
                frame,
            }));
        }

        if let Some(monitor) = acq.monitor {
            let partial = grab(gw, acq).await?;
            if !monitor(&partial) {
                debug!("Partial image rejected, stopping scan");
                halt(gw, acq.direction).await;
                return Ok(ScanOutcome::Rejected);
            }
        }

        if scanning >= acq.timeout {
            warn!(after = ?acq.timeout, "Scan did not complete in time, treating it as stopped");
            halt(gw, acq.direction).await;
            return Ok(ScanOutcome::Stopped);
        }
    }
}
