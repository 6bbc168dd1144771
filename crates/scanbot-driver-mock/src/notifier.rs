//! Notifier that records everything it is sent.

use parking_lot::Mutex;
use scanbot_core::notify::{Notifier, Reaction};
use std::path::{Path, PathBuf};

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Status message
    Text(String),
    /// Image path
    Image(PathBuf),
    /// Reaction
    Reaction(Reaction),
}

/// In-memory [`Notifier`] for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    log: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded, in order.
    pub fn all(&self) -> Vec<Notification> {
        self.log.lock().clone()
    }

    /// Recorded status messages.
    pub fn texts(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded image paths.
    pub fn images(&self) -> Vec<PathBuf> {
        self.log
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Image(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded reactions.
    pub fn reactions(&self) -> Vec<Reaction> {
        self.log
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Reaction(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    /// Whether any status message contains `needle`.
    pub fn saw(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }

    /// Last status message.
    pub fn last_text(&self) -> Option<String> {
        self.texts().pop()
    }
}

impl Notifier for RecordingNotifier {
    fn send_text(&self, message: &str) {
        self.log.lock().push(Notification::Text(message.to_string()));
    }

    fn send_image(&self, path: &Path) {
        self.log.lock().push(Notification::Image(path.to_path_buf()));
    }

    fn react(&self, reaction: Reaction) {
        self.log.lock().push(Notification::Reaction(reaction));
    }
}
