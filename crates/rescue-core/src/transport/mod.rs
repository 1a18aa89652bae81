//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBus, MockFaults, MockStats, MockTransport};
pub use self::nusb::{NusbBus, NusbTransport};
pub use traits::{
    ControlSetup, EndpointInfo, RecoveryTransport, TransportError, UsbBus, UsbDeviceRecord,
};
