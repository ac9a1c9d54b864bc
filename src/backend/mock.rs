use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;

use crate::error::AppError;
use crate::gpio::{Edge, EdgeEvent, EventHandler, GpioBackend, LineMode};

/// In-memory backend. Every call is recorded so the lifecycle can be checked
/// without hardware.
#[derive(Default)]
pub struct MockGpioBackend {
    lines: RwLock<FxHashMap<u32, MockLineState>>, // keyed by physical line
    ops: Mutex<Vec<MockOp>>,
    failing: RwLock<FxHashSet<u32>>,
    failing_unexport: RwLock<FxHashSet<u32>>,
}

struct MockLineState {
    mode: LineMode,
    value: u8,
    handlers: Vec<EventHandler>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockOp {
    Export { line: u32, mode: LineMode },
    Write { line: u32, value: u8, at: Instant },
    Watch { line: u32 },
    UnwatchAll { line: u32 },
    Unexport { line: u32 },
}

impl MockGpioBackend {
    /// Makes every later export of `line` fail, like a busy or missing pin.
    pub fn fail_export(&self, line: u32) {
        self.failing.write().insert(line);
    }

    /// Makes every later unexport of `line` fail. The line is still
    /// forgotten, as the kernel side is left in an unknown state.
    pub fn fail_unexport(&self, line: u32) {
        self.failing_unexport.write().insert(line);
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.ops.lock().clone()
    }

    pub fn exported_lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self.lines.read().keys().copied().collect();
        lines.sort_unstable();
        lines
    }

    pub fn mode(&self, line: u32) -> Option<LineMode> {
        self.lines.read().get(&line).map(|l| l.mode)
    }

    pub fn value(&self, line: u32) -> Option<u8> {
        self.lines.read().get(&line).map(|l| l.value)
    }

    pub fn watcher_count(&self, line: u32) -> usize {
        self.lines
            .read()
            .get(&line)
            .map(|l| l.handlers.len())
            .unwrap_or(0)
    }

    /// Simulates the input level changing to `value` on a watched line.
    pub fn trigger_edge(&self, line: u32, value: u8) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let state = lines
            .get_mut(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not exported")))?;
        if !state.mode.is_edge_detectable() {
            return Err(AppError::InvalidState(format!(
                "line {line} has no edge detection"
            )));
        }

        state.value = value;
        let edge = if value == 0 { Edge::Falling } else { Edge::Rising };
        for handler in &state.handlers {
            handler.dispatch(EdgeEvent {
                line,
                edge,
                timestamp_ms: epoch_millis(),
            });
        }
        Ok(())
    }

    fn record(&self, op: MockOp) {
        self.ops.lock().push(op);
    }
}

impl GpioBackend for MockGpioBackend {
    fn export(&self, line: u32, mode: LineMode) -> Result<(), AppError> {
        if self.failing.read().contains(&line) {
            return Err(AppError::Gpio(format!("export {line}: device busy")));
        }

        let mut lines = self.lines.write();
        if lines.contains_key(&line) {
            return Err(AppError::Gpio(format!("line {line} already exported")));
        }
        lines.insert(
            line,
            MockLineState {
                mode,
                value: if mode == LineMode::OutputHigh { 1 } else { 0 },
                handlers: Vec::new(),
            },
        );
        drop(lines);

        self.record(MockOp::Export { line, mode });
        Ok(())
    }

    fn write_value(&self, line: u32, value: u8) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let state = lines
            .get_mut(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not exported")))?;
        if !state.mode.is_writable() {
            return Err(AppError::InvalidState(format!(
                "line {line} must be an output to set value"
            )));
        }
        state.value = value;
        drop(lines);

        self.record(MockOp::Write {
            line,
            value,
            at: Instant::now(),
        });
        Ok(())
    }

    fn watch(&self, line: u32, handler: EventHandler) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let state = lines
            .get_mut(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not exported")))?;
        if !state.mode.is_edge_detectable() {
            return Err(AppError::InvalidState(format!(
                "line {line} has no edge detection"
            )));
        }
        state.handlers.push(handler);
        drop(lines);

        self.record(MockOp::Watch { line });
        Ok(())
    }

    fn unwatch_all(&self, line: u32) -> Result<(), AppError> {
        if let Some(state) = self.lines.write().get_mut(&line) {
            state.handlers.clear();
        }
        self.record(MockOp::UnwatchAll { line });
        Ok(())
    }

    fn unexport(&self, line: u32) -> Result<(), AppError> {
        if self.lines.write().remove(&line).is_none() {
            return Ok(());
        }
        if self.failing_unexport.read().contains(&line) {
            return Err(AppError::Gpio(format!("unexport {line}: permission denied")));
        }
        self.record(MockOp::Unexport { line });
        Ok(())
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
