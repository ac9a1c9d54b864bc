pub mod backend;
pub mod config;
pub mod error;
pub mod gpio;
pub mod lifecycle;
pub mod pin;
pub mod platform;
pub mod routes;
pub mod shutdown;

#[cfg(feature = "hardware-gpio")]
pub use backend::SysfsBackend;
pub use backend::MockGpioBackend;
pub use config::{AppConfig, HttpConfig, PinConfig, PinStore};
pub use error::AppError;
pub use gpio::{Edge, EdgeEvent, EventHandler, GpioBackend, LineMode};
pub use lifecycle::{BoundGpioLine, GpioManager, LifecycleState, Role, StartSummary};
pub use pin::PinTranslator;
pub use platform::{HostPlatform, SystemPlatform};
pub use routes::AppState;
pub use shutdown::{CommandShutdown, ShutdownAction};
