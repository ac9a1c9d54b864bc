use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LineMode {
    Output,
    /// Input with edge detection on rising and falling transitions.
    InputBothEdges,
    /// Output driven high as part of the export.
    OutputHigh,
}

impl LineMode {
    pub fn is_writable(&self) -> bool {
        matches!(self, LineMode::Output | LineMode::OutputHigh)
    }

    pub fn is_edge_detectable(&self) -> bool {
        matches!(self, LineMode::InputBothEdges)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub line: u32,
    pub edge: Edge,
    pub timestamp_ms: u64,
}

/// Forwards edge events from backend listeners to the button loop. Events are
/// queued without bound so none is lost while a shutdown is being requested.
pub struct EventCallbackHandler {
    event_tx: mpsc::UnboundedSender<EdgeEvent>,
}

impl EventCallbackHandler {
    pub fn new(event_tx: mpsc::UnboundedSender<EdgeEvent>) -> Self {
        Self { event_tx }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        // receiver gone means nobody handles the button anymore
        let _ = self.event_tx.send(event);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

/// A GPIO line namespace addressed by physical (OS) line number.
pub trait GpioBackend: Send + Sync {
    fn export(&self, line: u32, mode: LineMode) -> Result<(), AppError>;
    fn write_value(&self, line: u32, value: u8) -> Result<(), AppError>;
    fn watch(&self, line: u32, handler: EventHandler) -> Result<(), AppError>;
    /// Removing watches from a line that has none is not an error.
    fn unwatch_all(&self, line: u32) -> Result<(), AppError>;
    /// Unexporting a line that is not exported is not an error.
    fn unexport(&self, line: u32) -> Result<(), AppError>;
}
