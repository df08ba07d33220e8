//! Hardware capabilities used by workflow tasks.
//!
//! Devices implement the small capability traits they support instead of one monolithic
//! instrument trait:
//!
//! - a goniostat axis or sample stage implements [`Movable`]
//! - an area detector implements [`Detector`]
//!
//! Each trait is async, `Send + Sync`, and reports failures with `anyhow::Result`; the task
//! executor turns those into hardware errors of the workflow.

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Motion Control
///
/// Goniostat rotation axes (degrees) and sample translation stages (mm).
///
/// # Contract
/// - `move_abs` and `move_rel` may return before motion completes
/// - `wait_settled` blocks until motion completes
/// - `position` may be approximate during motion
///
/// Implementations use interior mutability; all methods take `&self`.
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Current position in device-native units
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    ///
    /// Not all devices support this; the default reports an error.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Image Series Acquisition
///
/// # Contract
/// - `arm()` prepares a series of `images` frames of `exposure_s` seconds each
/// - `trigger()` acquires the armed series and returns the number of frames written
/// - calling `trigger()` on an unarmed detector is an error
#[async_trait]
pub trait Detector: Send + Sync {
    /// Prepare an image series
    async fn arm(&self, images: u32, exposure_s: f64) -> Result<()>;

    /// Acquire the armed series
    async fn trigger(&self) -> Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Axis {
        position: Mutex<f64>,
    }

    #[async_trait]
    impl Movable for Axis {
        async fn move_abs(&self, position: f64) -> Result<()> {
            *self.position.lock().map_err(|_| anyhow::anyhow!("poisoned"))? = position;
            Ok(())
        }

        async fn move_rel(&self, distance: f64) -> Result<()> {
            let current = self.position().await?;
            self.move_abs(current + distance).await
        }

        async fn position(&self) -> Result<f64> {
            Ok(*self.position.lock().map_err(|_| anyhow::anyhow!("poisoned"))?)
        }

        async fn wait_settled(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_movable_trait() {
        let axis = Axis {
            position: Mutex::new(0.0),
        };
        axis.move_abs(90.0).await.unwrap();
        axis.move_rel(-45.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 45.0);
        assert!(axis.stop().await.is_err());
    }
}
