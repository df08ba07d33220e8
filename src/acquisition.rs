//! Planned acquisitions proposed by the engine.
//!
//! These are read-only records: a [`CollectionProposal`] holds [`Sweep`]s, and each sweep
//! is split into one or more [`Scan`]s that are acquired back to back.

use crate::error::{WorkflowError, WorkflowResult};
use crate::geometry::GoniostatRotation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tolerance when checking that scans lie within their sweep, in degrees.
const RANGE_TOLERANCE_DEG: f64 = 1e-6;

/// A contiguous part of a sweep acquired as one image series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: Uuid,
    /// Start of the scan, in degrees of the scan axis
    pub start_deg: f64,
    /// Angular width of the scan
    pub width_deg: f64,
    /// Oscillation width of one image
    pub image_width_deg: f64,
    /// Exposure time per image, in seconds
    pub exposure_s: f64,
    /// Number of the first image of the scan
    pub first_image_no: u32,
}

impl Scan {
    /// Number of images the scan produces.
    ///
    /// Fails when the image width is not positive or the count does not fit in a `u32`.
    pub fn image_count(&self) -> WorkflowResult<u32> {
        let count = (self.width_deg / self.image_width_deg).round();
        if self.image_width_deg.is_nan()
            || self.image_width_deg <= 0.0
            || !count.is_finite()
            || count < 0.0
        {
            return Err(WorkflowError::Configuration(format!(
                "scan {} has no valid image count (width {}, image width {})",
                self.id, self.width_deg, self.image_width_deg
            )));
        }
        if count > f64::from(u32::MAX) {
            return Err(too_many_images(&format!("scan {}", self.id)));
        }
        Ok(count as u32)
    }

    fn validate(&self) -> WorkflowResult<()> {
        let values = [
            self.start_deg,
            self.width_deg,
            self.image_width_deg,
            self.exposure_s,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(WorkflowError::Configuration(format!(
                "scan {} has a non-finite angle or exposure",
                self.id
            )));
        }
        if self.image_width_deg <= 0.0 || self.width_deg < 0.0 {
            return Err(WorkflowError::Configuration(format!(
                "scan {} has width {} and image width {}",
                self.id, self.width_deg, self.image_width_deg
            )));
        }
        self.image_count().map(|_| ())
    }

    fn end_deg(&self) -> f64 {
        self.start_deg + self.width_deg
    }
}

/// Planned rotation range at a fixed goniostat/detector/beam setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub id: Uuid,
    /// Base name used for image files and queue labels
    pub base_name: String,
    pub rotation: GoniostatRotation,
    /// Axis rotated during acquisition (usually omega)
    pub scan_axis: String,
    pub start_deg: f64,
    pub width_deg: f64,
    pub detector_distance_mm: f64,
    pub wavelength_a: f64,
    pub scans: Vec<Scan>,
}

impl Sweep {
    /// Total images over all scans.
    pub fn image_count(&self) -> WorkflowResult<u32> {
        self.scans.iter().try_fold(0u32, |total, scan| {
            total
                .checked_add(scan.image_count()?)
                .ok_or_else(|| too_many_images(&format!("sweep '{}'", self.base_name)))
        })
    }

    fn validate(&self) -> WorkflowResult<()> {
        if !self.start_deg.is_finite() || !self.width_deg.is_finite() {
            return Err(WorkflowError::Configuration(format!(
                "sweep '{}' has a non-finite range",
                self.base_name
            )));
        }
        if self.width_deg <= 0.0 {
            return Err(WorkflowError::Configuration(format!(
                "sweep '{}' has non-positive width {}",
                self.base_name, self.width_deg
            )));
        }
        let end = self.start_deg + self.width_deg;
        for scan in &self.scans {
            scan.validate()?;
            if scan.start_deg < self.start_deg - RANGE_TOLERANCE_DEG
                || scan.end_deg() > end + RANGE_TOLERANCE_DEG
            {
                return Err(WorkflowError::Configuration(format!(
                    "scan {} [{}, {}] lies outside sweep '{}' [{}, {}]",
                    scan.id,
                    scan.start_deg,
                    scan.end_deg(),
                    self.base_name,
                    self.start_deg,
                    end
                )));
            }
        }
        self.image_count().map(|_| ())
    }
}

/// Full acquisition plan for one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionProposal {
    pub id: Uuid,
    pub strategy_label: String,
    /// Image directory, relative to the run's image root
    pub relative_image_dir: String,
    pub sweeps: Vec<Sweep>,
}

impl CollectionProposal {
    /// Build a proposal, checking that every scan lies within its sweep.
    pub fn new(
        strategy_label: impl Into<String>,
        relative_image_dir: impl Into<String>,
        sweeps: Vec<Sweep>,
    ) -> WorkflowResult<Self> {
        let proposal = Self {
            id: Uuid::new_v4(),
            strategy_label: strategy_label.into(),
            relative_image_dir: relative_image_dir.into(),
            sweeps,
        };
        proposal.validate()?;
        Ok(proposal)
    }

    /// Check a proposal received from the engine.
    pub fn validate(&self) -> WorkflowResult<()> {
        self.sweeps.iter().try_for_each(Sweep::validate)?;
        self.image_count().map(|_| ())
    }

    /// Total images over all sweeps.
    pub fn image_count(&self) -> WorkflowResult<u32> {
        self.sweeps.iter().try_fold(0u32, |total, sweep| {
            total
                .checked_add(sweep.image_count()?)
                .ok_or_else(|| too_many_images(&format!("proposal '{}'", self.strategy_label)))
        })
    }
}

fn too_many_images(what: &str) -> WorkflowError {
    WorkflowError::Configuration(format!("{what} has more than {} images", u32::MAX))
}
