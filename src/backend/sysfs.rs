use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, sleep};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sysfs_gpio::{Direction, Pin};

use crate::error::AppError;
use crate::gpio::{Edge, EdgeEvent, EventHandler, GpioBackend, LineMode};

const SYSFS_BACKEND_EDGE_POLL_TIMEOUT_MS: isize = 100;
const SYSFS_BACKEND_EXPORT_RETRY: Duration = Duration::from_millis(10);

/// Drives the legacy `/sys/class/gpio` interface, which is numbered the same
/// way as the configured (translated) pins.
pub struct SysfsBackend {
    export_wait: Duration,
    lines: RwLock<FxHashMap<u32, LineHandle>>, // keyed by physical line
}

struct LineHandle {
    mode: LineMode,
    pin: Pin,
    listeners: Vec<EdgeListener>, // dropped before the pin is unexported
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(line: u32, pin: &Pin, handler: EventHandler) -> Result<Self, AppError> {
        let mut poller = pin
            .get_poller()
            .map_err(|e| AppError::Gpio(format!("poller for line {line}: {e}")))?;
        // a fresh poller reports the current level, which is not an edge
        let _ = poller.poll(0);

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let value = match poller.poll(SYSFS_BACKEND_EDGE_POLL_TIMEOUT_MS) {
                    Ok(Some(value)) => value,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("poll edge error for line {line}: {e}");
                        sleep(Duration::from_millis(
                            SYSFS_BACKEND_EDGE_POLL_TIMEOUT_MS as u64,
                        ));
                        continue;
                    }
                };

                handler.dispatch(EdgeEvent {
                    line,
                    edge: if value == 0 {
                        Edge::Falling
                    } else {
                        Edge::Rising
                    },
                    timestamp_ms: epoch_millis(),
                });
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl SysfsBackend {
    pub fn new(export_wait: Duration) -> Self {
        Self {
            export_wait,
            lines: RwLock::new(FxHashMap::default()),
        }
    }

    fn direction(mode: LineMode) -> Direction {
        match mode {
            LineMode::Output => Direction::Out,
            LineMode::InputBothEdges => Direction::In,
            LineMode::OutputHigh => Direction::High,
        }
    }

    // udev fixes up permissions on the new gpioN directory asynchronously
    fn set_direction(&self, line: u32, pin: &Pin, mode: LineMode) -> Result<(), AppError> {
        let deadline = Instant::now() + self.export_wait;
        loop {
            match pin.set_direction(Self::direction(mode)) {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(AppError::Gpio(format!(
                        "set direction on line {line}: {e}"
                    )));
                }
                Err(_) => sleep(SYSFS_BACKEND_EXPORT_RETRY),
            }
        }
    }
}

impl GpioBackend for SysfsBackend {
    fn export(&self, line: u32, mode: LineMode) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        if lines.contains_key(&line) {
            return Err(AppError::Gpio(format!("line {line} already exported")));
        }

        let pin = Pin::new(u64::from(line));
        pin.export()
            .map_err(|e| AppError::Gpio(format!("export line {line}: {e}")))?;
        self.set_direction(line, &pin, mode)?;
        if mode.is_edge_detectable() {
            pin.set_edge(sysfs_gpio::Edge::BothEdges)
                .map_err(|e| AppError::Gpio(format!("set edge on line {line}: {e}")))?;
        }

        debug!("exported line {line} as {mode:?}");
        lines.insert(
            line,
            LineHandle {
                mode,
                pin,
                listeners: Vec::new(),
            },
        );
        Ok(())
    }

    fn write_value(&self, line: u32, value: u8) -> Result<(), AppError> {
        let lines = self.lines.read();
        let handle = lines
            .get(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not exported")))?;
        if !handle.mode.is_writable() {
            return Err(AppError::InvalidState(format!(
                "line {line} must be an output to set value"
            )));
        }

        handle
            .pin
            .set_value(if value == 0 { 0 } else { 1 })
            .map_err(|e| AppError::Gpio(format!("set value on line {line}: {e}")))
    }

    fn watch(&self, line: u32, handler: EventHandler) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not exported")))?;
        if !handle.mode.is_edge_detectable() {
            return Err(AppError::InvalidState(format!(
                "line {line} has no edge detection"
            )));
        }

        let listener = EdgeListener::new(line, &handle.pin, handler)?;
        handle.listeners.push(listener);
        Ok(())
    }

    fn unwatch_all(&self, line: u32) -> Result<(), AppError> {
        if let Some(handle) = self.lines.write().get_mut(&line) {
            handle.listeners.clear();
        }
        Ok(())
    }

    fn unexport(&self, line: u32) -> Result<(), AppError> {
        let Some(mut handle) = self.lines.write().remove(&line) else {
            return Ok(());
        };
        handle.listeners.clear();

        handle
            .pin
            .unexport()
            .map_err(|e| AppError::Gpio(format!("unexport line {line}: {e}")))
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
