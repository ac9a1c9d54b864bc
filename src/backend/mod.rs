pub mod mock;
#[cfg(feature = "hardware-gpio")]
pub mod sysfs;

pub use mock::{MockGpioBackend, MockOp};
#[cfg(feature = "hardware-gpio")]
pub use sysfs::SysfsBackend;
