//! Hardware repository: named lookup of the devices workflow tasks drive.
//!
//! Handlers and executors never construct drivers; they ask the repository for a device by
//! name and capability.
//!
//! ```rust,ignore
//! let mut hardware = HardwareRepository::new();
//! hardware.register_motor("omega", Arc::new(MockMotor::new("omega")))?;
//! hardware.register_detector("detector", Arc::new(MockDetector::new()))?;
//!
//! hardware.motor("omega")?.move_abs(90.0).await?;
//! ```

use crate::error::{WorkflowError, WorkflowResult};
use crate::hardware::capabilities::{Detector, Movable};
use crate::hardware::mock::{MockDetector, MockMotor};
use std::collections::HashMap;
use std::sync::Arc;

/// Unique identifier for a registered device, e.g. "omega", "sampx"
pub type DeviceId = String;

/// Capabilities a device can have (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Goniostat axes and translation stages
    Movable,
    /// Area detectors
    Detector,
}

/// Information about a registered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Registered name
    pub id: DeviceId,
    /// What the device can do
    pub capabilities: Vec<Capability>,
}

/// Registered devices by id and capability.
#[derive(Default)]
pub struct HardwareRepository {
    motors: HashMap<DeviceId, Arc<dyn Movable>>,
    detectors: HashMap<DeviceId, Arc<dyn Detector>>,
}

impl std::fmt::Debug for HardwareRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareRepository")
            .field("devices", &self.list_devices())
            .finish()
    }
}

impl HardwareRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository of instant mock motors for `axes` plus a mock detector named "detector".
    pub fn simulated<'a>(axes: impl IntoIterator<Item = &'a str>) -> Self {
        Self::simulated_with_detector(axes, MockDetector::new())
    }

    /// Like [`HardwareRepository::simulated`] with a prepared detector.
    pub fn simulated_with_detector<'a>(
        axes: impl IntoIterator<Item = &'a str>,
        detector: MockDetector,
    ) -> Self {
        let mut repository = Self::new();
        for axis in axes {
            repository
                .motors
                .insert(axis.to_string(), Arc::new(MockMotor::new(axis)));
        }
        repository
            .detectors
            .insert("detector".to_string(), Arc::new(detector));
        repository
    }

    /// Register a motion device.
    pub fn register_motor(
        &mut self,
        id: impl Into<DeviceId>,
        device: Arc<dyn Movable>,
    ) -> WorkflowResult<()> {
        let id = id.into();
        if self.contains(&id) {
            return Err(WorkflowError::Hardware(format!(
                "Device '{id}' is already registered"
            )));
        }
        self.motors.insert(id, device);
        Ok(())
    }

    /// Register a detector.
    pub fn register_detector(
        &mut self,
        id: impl Into<DeviceId>,
        device: Arc<dyn Detector>,
    ) -> WorkflowResult<()> {
        let id = id.into();
        if self.contains(&id) {
            return Err(WorkflowError::Hardware(format!(
                "Device '{id}' is already registered"
            )));
        }
        self.detectors.insert(id, device);
        Ok(())
    }

    /// Motion device by id.
    pub fn motor(&self, id: &str) -> WorkflowResult<Arc<dyn Movable>> {
        self.get_movable(id)
            .ok_or_else(|| WorkflowError::Hardware(format!("No motor named '{id}'")))
    }

    /// Detector by id.
    pub fn detector(&self, id: &str) -> WorkflowResult<Arc<dyn Detector>> {
        self.detectors
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::Hardware(format!("No detector named '{id}'")))
    }

    /// Motion device by id, if registered.
    pub fn get_movable(&self, id: &str) -> Option<Arc<dyn Movable>> {
        self.motors.get(id).cloned()
    }

    /// All devices, sorted by id.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .motors
            .keys()
            .map(|id| DeviceInfo {
                id: id.clone(),
                capabilities: vec![Capability::Movable],
            })
            .chain(self.detectors.keys().map(|id| DeviceInfo {
                id: id.clone(),
                capabilities: vec![Capability::Detector],
            }))
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Whether `id` is registered under any capability.
    pub fn contains(&self, id: &str) -> bool {
        self.motors.contains_key(id) || self.detectors.contains_key(id)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.motors.len() + self.detectors.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
