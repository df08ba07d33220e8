//! Mock hardware for simulation and tests.
//!
//! All mock devices use async-safe operations (`tokio::time::sleep`, never
//! `std::thread::sleep`).
//!
//! - [`MockMotor`]: goniostat axis or translation stage, instant by default
//! - [`MockDetector`]: counts frames and can be told to fail a given series

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{Detector, Movable};

// =============================================================================
// MockMotor
// =============================================================================

/// Simulated axis.
///
/// Moves at a fixed speed (infinite by default, so moves are instant), tracks its position,
/// and can be made to reject every move.
///
/// ```rust,ignore
/// let omega = MockMotor::with_speed(90.0); // deg/s
/// omega.move_abs(45.0).await?; // ~0.5 s
/// assert_eq!(omega.position().await?, 45.0);
/// ```
pub struct MockMotor {
    name: String,
    position: Arc<RwLock<f64>>,
    speed_per_sec: f64,
    settle: Duration,
    fault: Option<String>,
}

impl MockMotor {
    /// Instant motor at 0.0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: Arc::new(RwLock::new(0.0)),
            speed_per_sec: f64::INFINITY,
            settle: Duration::ZERO,
            fault: None,
        }
    }

    /// Motor starting at `initial_position`
    pub fn with_position(name: impl Into<String>, initial_position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(initial_position)),
            ..Self::new(name)
        }
    }

    /// Set a finite speed and a settling time
    pub fn with_speed(mut self, speed_per_sec: f64, settle: Duration) -> Self {
        self.speed_per_sec = speed_per_sec;
        self.settle = settle;
        self
    }

    /// Make every move fail with `message`
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fault = Some(message.into());
        self
    }
}

#[async_trait]
impl Movable for MockMotor {
    async fn move_abs(&self, target: f64) -> Result<()> {
        if let Some(fault) = &self.fault {
            bail!("{}: {}", self.name, fault);
        }
        let current = *self.position.read().await;
        let distance = (target - current).abs();
        let delay = Duration::from_secs_f64((distance / self.speed_per_sec).min(3600.0));

        debug!(motor = %self.name, from = current, to = target, ?delay, "Moving");
        if !delay.is_zero() {
            sleep(delay).await;
        }

        *self.position.write().await = target;
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = *self.position.read().await;
        self.move_abs(current + distance).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> Result<()> {
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        debug!(motor = %self.name, "Stop");
        Ok(())
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// Simulated detector.
///
/// Acquisition takes `exposure_s` per frame, scaled by a time factor (zero by default).
/// `fail_on_series(n)` makes the n-th armed series (1-based) fail.
pub struct MockDetector {
    armed: RwLock<Option<(u32, f64)>>,
    series: AtomicU32,
    frames: AtomicU32,
    time_scale: f64,
    fail_on: Option<u32>,
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDetector {
    /// Detector that acquires instantly and never fails.
    pub fn new() -> Self {
        Self {
            armed: RwLock::new(None),
            series: AtomicU32::new(0),
            frames: AtomicU32::new(0),
            time_scale: 0.0,
            fail_on: None,
        }
    }

    /// Sleep `time_scale × exposure` per frame
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    /// Fail the n-th series (1-based)
    pub fn fail_on_series(mut self, series: u32) -> Self {
        self.fail_on = Some(series);
        self
    }

    /// Frames written so far
    pub fn frames_acquired(&self) -> u32 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Series armed so far
    pub fn series_armed(&self) -> u32 {
        self.series.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for MockDetector {
    async fn arm(&self, images: u32, exposure_s: f64) -> Result<()> {
        let series = self.series.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(series) {
            bail!("detector fault on series {series}");
        }
        *self.armed.write().await = Some((images, exposure_s));
        Ok(())
    }

    async fn trigger(&self) -> Result<u32> {
        let (images, exposure_s) = self
            .armed
            .write()
            .await
            .take()
            .ok_or_else(|| anyhow!("Detector not armed"))?;

        let duration = f64::from(images) * exposure_s * self.time_scale;
        if duration > 0.0 {
            sleep(Duration::from_secs_f64(duration)).await;
        }
        self.frames.fetch_add(images, Ordering::SeqCst);
        debug!(images, "Series acquired");
        Ok(images)
    }
}
