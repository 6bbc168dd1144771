//! Outbound status notifications.
//!
//! Procedures report every transition (scan progress, drift offsets, safety
//! trips, tip-shaping verdicts) through a [`Notifier`]. Delivery is
//! fire-and-forget: a notifier never blocks or fails the procedure.

use std::fmt;
use std::path::Path;
use tracing::info;

/// Reaction attached to the operator's last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reaction {
    /// Command accepted and running
    Working,
    /// Procedure stopped
    Stop,
    /// Procedure paused
    Pause,
    /// Procedure resumed
    Play,
    /// Safety trip or other warning
    Warning,
    /// Procedure succeeded
    Success,
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Reaction::Working => "working",
            Reaction::Stop => "stop_button",
            Reaction::Pause => "pause",
            Reaction::Play => "play",
            Reaction::Warning => "warning",
            Reaction::Success => "success",
        };
        write!(f, "{}", label)
    }
}

/// Sink for status messages, images and reactions.
pub trait Notifier: Send + Sync {
    /// Send a status message.
    fn send_text(&self, message: &str);

    /// Send an image file saved by the instrument or a post-processing step.
    fn send_image(&self, path: &Path);

    /// React to the operator's last command.
    fn react(&self, reaction: Reaction);
}

/// Notifier that writes everything to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send_text(&self, message: &str) {
        info!("{}", message);
    }

    fn send_image(&self, path: &Path) {
        info!(path = %path.display(), "Image");
    }

    fn react(&self, reaction: Reaction) {
        info!(%reaction, "Reaction");
    }
}
