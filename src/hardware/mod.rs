//! Beamline hardware used by workflow tasks.
//!
//! - `capabilities`: `Movable` and `Detector` traits
//! - `registry`: named device lookup
//! - `goniostat`: task executor that centres and collects with registered devices
//! - `mock`: simulated motors and detector

pub mod capabilities;
pub mod goniostat;
pub mod mock;
pub mod registry;

pub use capabilities::{Detector, Movable};
pub use goniostat::GoniostatExecutor;
pub use mock::{MockDetector, MockMotor};
pub use registry::{Capability, DeviceId, DeviceInfo, HardwareRepository};
