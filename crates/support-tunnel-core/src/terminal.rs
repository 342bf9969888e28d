//! Terminal lines and the bounded, broadcast-backed terminal buffer.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::session::now_millis;

/// Default number of retained lines.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Where a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSource {
    Device,
    Admin,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineLevel {
    Info,
    Warn,
    Error,
}

/// One renderable unit of terminal output. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalLine {
    pub text: String,
    pub source: LineSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LineLevel>,
    /// Local arrival time, Unix epoch milliseconds.
    pub timestamp: i64,
}

impl TerminalLine {
    #[must_use]
    pub fn device(text: impl Into<String>) -> Self {
        Self::new(text, LineSource::Device, None)
    }

    #[must_use]
    pub fn admin(text: impl Into<String>) -> Self {
        Self::new(text, LineSource::Admin, None)
    }

    #[must_use]
    pub fn system(level: LineLevel, text: impl Into<String>) -> Self {
        Self::new(text, LineSource::System, Some(level))
    }

    fn new(text: impl Into<String>, source: LineSource, level: Option<LineLevel>) -> Self {
        Self {
            text: text.into(),
            source,
            level,
            timestamp: now_millis(),
        }
    }
}

/// Ordered terminal view with a fixed recent-line window.
///
/// Lines are kept in arrival order at this endpoint. Live listeners receive
/// each line as it is pushed; late listeners can replay the retained window
/// first.
pub struct TerminalAggregator {
    history: RwLock<VecDeque<TerminalLine>>,
    capacity: usize,
    sender: broadcast::Sender<TerminalLine>,
}

impl Default for TerminalAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TerminalAggregator {
    /// Create a buffer retaining at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            sender,
        }
    }

    /// Append a line, evicting the oldest when full.
    ///
    /// Listeners are notified under the history lock, so a line is either in
    /// a snapshot or delivered live, never both and never neither.
    pub fn push(&self, line: TerminalLine) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(line.clone());
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(line);
    }

    pub fn push_device(&self, text: impl Into<String>) {
        self.push(TerminalLine::device(text));
    }

    pub fn push_admin(&self, text: impl Into<String>) {
        self.push(TerminalLine::admin(text));
    }

    pub fn push_system(&self, level: LineLevel, text: impl Into<String>) {
        self.push(TerminalLine::system(level, text));
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the retained lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<TerminalLine> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Get a receiver for live lines.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalLine> {
        self.sender.subscribe()
    }

    /// Stream that yields retained lines first, then live lines.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, TerminalLine> {
        let (history, rx) = {
            let guard = self.history.read().unwrap_or_else(PoisonError::into_inner);
            (guard.iter().cloned().collect::<Vec<_>>(), self.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
