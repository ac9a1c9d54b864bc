use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{PinConfig, PinStore};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventCallbackHandler, EventHandler, GpioBackend, LineMode};
use crate::pin::{self, PinTranslator};
use crate::platform::HostPlatform;

/// How long soft-shutdown stays active before power may be cut.
pub const SOFT_SHUTDOWN_HOLD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SoftShutdown,
    ShutdownButton,
    BootOk,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::SoftShutdown, Role::ShutdownButton, Role::BootOk];

    pub fn mode(self) -> LineMode {
        match self {
            Role::SoftShutdown => LineMode::Output,
            Role::ShutdownButton => LineMode::InputBothEdges,
            Role::BootOk => LineMode::OutputHigh,
        }
    }

    pub fn logical_pin(self, pins: &PinConfig) -> u32 {
        match self {
            Role::SoftShutdown => pins.soft_shutdown,
            Role::ShutdownButton => pins.shutdown_button,
            Role::BootOk => pins.boot_ok,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::SoftShutdown => "Soft shutdown",
            Role::ShutdownButton => "Hardware button",
            Role::BootOk => "Boot OK",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unconfigured,
    Starting,
    Bound,
    Watching,
    Stopping,
    Released,
}

/// A line exported for one role. The physical number is fixed at bind time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundGpioLine {
    pub role: Role,
    pub line: u32,
    pub mode: LineMode,
    pub watching: bool,
}

#[derive(Debug, Default)]
pub struct StartSummary {
    pub bound: Vec<BoundGpioLine>,
    pub failed: Vec<(Role, AppError)>,
}

impl StartSummary {
    pub fn line(&self, role: Role) -> Option<u32> {
        self.bound.iter().find(|b| b.role == role).map(|b| b.line)
    }
}

struct ManagerState {
    lifecycle: LifecycleState,
    soft_shutdown: Option<BoundGpioLine>,
    shutdown_button: Option<BoundGpioLine>,
    boot_ok: Option<BoundGpioLine>,
}

impl ManagerState {
    fn slot(&mut self, role: Role) -> &mut Option<BoundGpioLine> {
        match role {
            Role::SoftShutdown => &mut self.soft_shutdown,
            Role::ShutdownButton => &mut self.shutdown_button,
            Role::BootOk => &mut self.boot_ok,
        }
    }
}

pub struct GpioManager<B: GpioBackend> {
    backend: Arc<B>,
    platform: Arc<dyn HostPlatform>,
    state: Mutex<ManagerState>,
    prefix: Mutex<u32>,
    event_handler: EventHandler,
    events: Mutex<Option<mpsc::UnboundedReceiver<EdgeEvent>>>,
}

impl<B: GpioBackend> GpioManager<B> {
    pub fn new(backend: Arc<B>, platform: Arc<dyn HostPlatform>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            backend,
            platform,
            state: Mutex::new(ManagerState {
                lifecycle: LifecycleState::Unconfigured,
                soft_shutdown: None,
                shutdown_button: None,
                boot_ok: None,
            }),
            prefix: Mutex::new(0),
            event_handler: Arc::new(EventCallbackHandler::new(event_tx)),
            events: Mutex::new(Some(event_rx)),
        }
    }

    /// Hands out the button edge stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EdgeEvent>> {
        self.events.lock().take()
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub fn prefix(&self) -> u32 {
        *self.prefix.lock()
    }

    pub fn bound_lines(&self) -> Vec<BoundGpioLine> {
        let state = self.state.lock();
        [&state.soft_shutdown, &state.shutdown_button, &state.boot_ok]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Re-reads the GPIO chip base. A failed probe keeps the last known value.
    pub fn refresh_prefix(&self) -> u32 {
        let probed = self
            .platform
            .probe_gpio_ids()
            .and_then(|output| pin::parse_prefix(&output));

        let mut prefix = self.prefix.lock();
        match probed {
            Ok(value) => {
                debug!("GPIO prefix is {value}");
                *prefix = value;
            }
            Err(e) => error!("Error getting GPIO prefix: {e}"),
        }
        *prefix
    }

    pub fn translator(&self) -> PinTranslator {
        let major = match self.platform.kernel_release() {
            Ok(release) => pin::kernel_major(&release).unwrap_or_else(|| {
                warn!("unrecognised kernel release {release}, assuming unprefixed GPIO numbering");
                0
            }),
            Err(e) => {
                warn!("{e}, assuming unprefixed GPIO numbering");
                0
            }
        };
        PinTranslator::new(major, self.prefix())
    }

    pub fn start(&self, pins: &PinConfig) -> Result<StartSummary, AppError> {
        {
            let mut state = self.state.lock();
            match state.lifecycle {
                LifecycleState::Unconfigured | LifecycleState::Released => {}
                other => {
                    return Err(AppError::InvalidState(format!(
                        "cannot start while {other:?}"
                    )));
                }
            }
            state.lifecycle = LifecycleState::Starting;
        }

        // the chip base lookup runs a subprocess; keep the state lock free meanwhile
        self.refresh_prefix();
        let translator = self.translator();
        info!("Configuring GPIO pins");

        let mut state = self.state.lock();
        let mut summary = StartSummary::default();
        for role in Role::ALL {
            let logical = role.logical_pin(pins);
            if logical == 0 {
                debug!("{role} GPIO not configured");
                continue;
            }

            let Some(line) = translator.physical_pin(logical) else {
                let e = AppError::InvalidValue(format!(
                    "pin {logical} is out of range with GPIO prefix {}",
                    translator.prefix()
                ));
                error!("{role} GPIO binding failed: {e}");
                summary.failed.push((role, e));
                continue;
            };
            match self.backend.export(line, role.mode()) {
                Ok(()) => {
                    info!("{role} GPIO {line} binding... OK");
                    let bound = BoundGpioLine {
                        role,
                        line,
                        mode: role.mode(),
                        watching: false,
                    };
                    summary.bound.push(bound.clone());
                    *state.slot(role) = Some(bound);
                }
                Err(e) => {
                    error!("{role} GPIO {line} binding failed: {e}");
                    summary.failed.push((role, e));
                }
            }
        }

        let mut watching = false;
        if let Some(button) = state.shutdown_button.as_mut() {
            match self.backend.watch(button.line, self.event_handler.clone()) {
                Ok(()) => {
                    button.watching = true;
                    watching = true;
                    if let Some(b) = summary
                        .bound
                        .iter_mut()
                        .find(|b| b.role == Role::ShutdownButton)
                    {
                        b.watching = true;
                    }
                }
                Err(e) => {
                    error!("watching hardware button GPIO {} failed: {e}", button.line);
                    summary.failed.push((Role::ShutdownButton, e));
                }
            }
        }

        state.lifecycle = if watching {
            LifecycleState::Watching
        } else {
            LifecycleState::Bound
        };
        Ok(summary)
    }

    /// Releases every bound line. Each release is attempted even if an
    /// earlier one failed, and stopping twice is harmless.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match state.lifecycle {
            LifecycleState::Unconfigured | LifecycleState::Released => {
                debug!("stop requested with no GPIO bound");
                return;
            }
            LifecycleState::Starting => {
                warn!("stop requested while GPIO pins are being configured, ignored");
                return;
            }
            _ => {}
        }
        state.lifecycle = LifecycleState::Stopping;

        for role in [Role::BootOk, Role::SoftShutdown, Role::ShutdownButton] {
            let Some(bound) = state.slot(role).take() else {
                continue;
            };
            if bound.watching
                && let Err(e) = self.backend.unwatch_all(bound.line)
            {
                error!("unwatching {role} GPIO {} failed: {e}", bound.line);
            }
            match self.backend.unexport(bound.line) {
                Ok(()) => debug!("{role} GPIO {} released", bound.line),
                Err(e) => error!("releasing {role} GPIO {} failed: {e}", bound.line),
            }
        }

        state.lifecycle = LifecycleState::Released;
    }

    fn soft_shutdown_line(&self) -> Option<u32> {
        self.state.lock().soft_shutdown.as_ref().map(|b| b.line)
    }

    /// The reboot itself drops the line, so it is only raised.
    pub fn reboot_notify(&self) -> Result<(), AppError> {
        let Some(line) = self.soft_shutdown_line() else {
            debug!("reboot notification skipped, soft shutdown not bound");
            return Ok(());
        };
        self.backend.write_value(line, 1)
    }

    /// Holds soft-shutdown active for [`SOFT_SHUTDOWN_HOLD`] and releases it,
    /// which the power board reads as safe to cut power.
    pub async fn shutdown_notify(&self) -> Result<(), AppError> {
        let Some(line) = self.soft_shutdown_line() else {
            debug!("shutdown notification skipped, soft shutdown not bound");
            return Ok(());
        };

        self.backend.write_value(line, 1)?;
        tokio::time::sleep(SOFT_SHUTDOWN_HOLD).await;
        self.backend.write_value(line, 0)
    }

    /// Creates the pin store with every role unset on first install.
    pub fn install(&self, store: &mut PinStore) -> Result<(), AppError> {
        info!("performing install action");
        if store.ensure_defaults()? {
            info!("created default pin configuration");
        }
        Ok(())
    }

    pub fn uninstall(&self) {
        info!("performing uninstall action");
        self.stop();
    }
}
