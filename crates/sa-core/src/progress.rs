use serde::{Deserialize, Serialize};

/// Progress as reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// Work started but its length is unknown yet
    Busy,
    Percent(u32),
    /// No run in progress
    Idle,
}

impl ProgressEvent {
    pub fn percent(&self) -> Option<u32> {
        match self {
            Self::Busy => Some(0),
            Self::Percent(p) => Some(*p),
            Self::Idle => None,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Step counter for one run.
///
/// Steps are 0-based; the reported percentage is `(step + 1) * 100 / total`.
/// The counter never moves backwards and never passes the last step, so
/// every reported value lies in `0..=100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressTracker {
    current: Option<u32>,
    total: u32,
}

impl ProgressTracker {
    pub fn new(total: u32) -> Self {
        Self {
            current: None,
            total: total.max(1),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Last step reported, if any
    pub fn current(&self) -> Option<u32> {
        self.current
    }

    /// Move to `step` unless already past it
    pub fn advance_to(&mut self, step: u32) -> u32 {
        let step = step.min(self.total - 1);
        self.current = Some(self.current.map_or(step, |current| current.max(step)));
        self.percent()
    }

    /// Move one step forward
    pub fn advance(&mut self) -> u32 {
        let next = self.current.map_or(0, |current| current + 1);
        self.advance_to(next)
    }

    pub fn percent(&self) -> u32 {
        match self.current {
            Some(step) => ((step as u64 + 1) * 100 / self.total as u64) as u32,
            None => 0,
        }
    }
}
