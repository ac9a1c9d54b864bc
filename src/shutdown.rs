use log::{error, info, warn};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use crate::error::AppError;
use crate::gpio::EdgeEvent;

/// What the host does when the hardware button asks for power off.
pub trait ShutdownAction: Send + Sync {
    fn request_shutdown(&self) -> Result<(), AppError>;
}

pub struct CommandShutdown {
    command: Vec<String>,
}

impl CommandShutdown {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Starts the command and hands the child to a detached thread that
    /// reaps it, so no zombie is left behind when the host does not go down.
    pub(crate) fn spawn(&self) -> Result<JoinHandle<Option<ExitStatus>>, AppError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AppError::Shutdown("shutdown command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| AppError::Shutdown(format!("spawn {program}: {e}")))?;
        info!("shutdown requested, spawned {program} (pid {})", child.id());

        let program = program.clone();
        thread::Builder::new()
            .name("shutdown-reaper".into())
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => Some(status),
                Ok(status) => {
                    warn!("{program} exited with {status}");
                    Some(status)
                }
                Err(e) => {
                    warn!("waiting on {program} failed: {e}");
                    None
                }
            })
            .map_err(|e| AppError::Shutdown(format!("reaper thread: {e}")))
    }
}

impl ShutdownAction for CommandShutdown {
    fn request_shutdown(&self) -> Result<(), AppError> {
        self.spawn().map(drop)
    }
}

/// Requests one shutdown per edge, in delivery order, until every sender of
/// `events` is dropped.
pub async fn run_button_loop(
    mut events: mpsc::UnboundedReceiver<EdgeEvent>,
    action: Arc<dyn ShutdownAction>,
) {
    while let Some(event) = events.recv().await {
        info!(
            "shutdown button edge {:?} on line {}",
            event.edge, event.line
        );
        if let Err(e) = action.request_shutdown() {
            error!("hardware shutdown request failed: {e}");
        }
    }
}
