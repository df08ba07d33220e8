//! Task executor that drives the goniostat and detector.
//!
//! # Node Lifecycle
//!
//! | Kind            | pre_execute               | execute                                   |
//! |-----------------|---------------------------|-------------------------------------------|
//! | Group           | -                         | -                                         |
//! | Centring        | move to rotation          | apply recentring hint, read translation   |
//! | DataCollection  | move to sweep rotation    | per scan: position scan axis, arm, trigger |

use crate::config::RecentringConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::geometry::AxisSettings;
use crate::hardware::registry::HardwareRepository;
use crate::queue::{TaskExecutor, TaskKind, TaskNode, TaskOutput};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Detector id used when none is given.
pub const DEFAULT_DETECTOR: &str = "detector";

/// Runs centring and data-collection nodes on real or mock hardware.
#[derive(Debug, Clone)]
pub struct GoniostatExecutor {
    hardware: Arc<HardwareRepository>,
    translation_axes: Vec<String>,
    detector: String,
}

impl GoniostatExecutor {
    /// Executor driving `hardware`, reading translations from `translation_axes` in order.
    pub fn new(hardware: Arc<HardwareRepository>, translation_axes: Vec<String>) -> Self {
        Self {
            hardware,
            translation_axes,
            detector: DEFAULT_DETECTOR.to_string(),
        }
    }

    /// Executor using the translation axes of the recentring configuration.
    pub fn from_config(hardware: Arc<HardwareRepository>, config: &RecentringConfig) -> Self {
        Self::new(hardware, config.translation_axes.clone())
    }

    /// Use a detector other than [`DEFAULT_DETECTOR`].
    pub fn with_detector(mut self, detector: impl Into<String>) -> Self {
        self.detector = detector.into();
        self
    }

    /// Move every axis of `settings`, then wait for all of them to settle.
    async fn move_to(&self, settings: &AxisSettings) -> WorkflowResult<()> {
        let mut moved = Vec::with_capacity(settings.len());
        for (axis, value) in settings.iter() {
            let motor = self.hardware.motor(axis)?;
            motor.move_abs(value).await.map_err(hardware_error)?;
            moved.push(motor);
        }
        for motor in moved {
            motor.wait_settled().await.map_err(hardware_error)?;
        }
        Ok(())
    }

    /// Current sample translation.
    async fn read_translation(&self) -> WorkflowResult<AxisSettings> {
        let mut values = Vec::with_capacity(self.translation_axes.len());
        for axis in &self.translation_axes {
            let position = self
                .hardware
                .motor(axis)?
                .position()
                .await
                .map_err(hardware_error)?;
            values.push((axis.as_str(), position));
        }
        Ok(AxisSettings::new(values))
    }
}

#[async_trait]
impl TaskExecutor for GoniostatExecutor {
    async fn pre_execute(&self, node: &TaskNode) -> WorkflowResult<()> {
        match node.kind() {
            TaskKind::Group => Ok(()),
            TaskKind::Centring { rotation, .. } => {
                debug!(node = %node.display_name(), rotation = %rotation.axis_settings(), "Moving to centring rotation");
                self.move_to(rotation.axis_settings()).await
            }
            TaskKind::DataCollection { sweep, .. } => {
                debug!(node = %node.display_name(), rotation = %sweep.rotation.axis_settings(), "Moving to sweep rotation");
                self.move_to(sweep.rotation.axis_settings()).await
            }
        }
    }

    async fn execute(&self, node: &TaskNode) -> WorkflowResult<TaskOutput> {
        match node.kind() {
            TaskKind::Group => Ok(TaskOutput::None),
            TaskKind::Centring { hint, .. } => {
                if let Some(hint) = hint.as_ref().filter(|hint| !hint.is_empty()) {
                    info!(node = %node.display_name(), translation = %hint, "Applying recentring");
                    self.move_to(hint).await?;
                }
                let translation = self.read_translation().await?;
                info!(node = %node.display_name(), %translation, "Sample centred");
                Ok(TaskOutput::Centred(translation))
            }
            TaskKind::DataCollection { sweep, image_root } => {
                let scan_axis = self.hardware.motor(&sweep.scan_axis)?;
                let detector = self.hardware.detector(&self.detector)?;
                let mut images: u32 = 0;
                for scan in &sweep.scans {
                    let expected = scan
                        .image_count()
                        .map_err(|e| WorkflowError::task(node.display_name(), e.to_string()))?;
                    scan_axis
                        .move_abs(scan.start_deg)
                        .await
                        .map_err(hardware_error)?;
                    scan_axis.wait_settled().await.map_err(hardware_error)?;
                    detector
                        .arm(expected, scan.exposure_s)
                        .await
                        .map_err(hardware_error)?;
                    let acquired = detector.trigger().await.map_err(hardware_error)?;
                    images = images.checked_add(acquired).ok_or_else(|| {
                        WorkflowError::task(node.display_name(), "image count overflow")
                    })?;
                }
                info!(
                    node = %node.display_name(),
                    sweep = %sweep.base_name,
                    images,
                    image_root = %image_root,
                    "Sweep acquired"
                );
                Ok(TaskOutput::Collected { images })
            }
        }
    }
}

fn hardware_error(e: anyhow::Error) -> WorkflowError {
    WorkflowError::Hardware(format!("{e:#}"))
}
