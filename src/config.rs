//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/workflow.toml`)
//! 2. environment variables prefixed with `BEAMLINE_WF_`, with `__` separating nested keys
//!
//! # Example
//! ```no_run
//! use beamline_workflow::config::WorkflowConfig;
//!
//! let config = WorkflowConfig::load()?;
//! println!("Engine: {}", config.engine.executable.display());
//! # Ok::<(), beamline_workflow::error::WorkflowError>(())
//! ```

use crate::error::{WorkflowError, WorkflowResult};
use crate::logging::OutputFormat;
use crate::queue::SiblingFailurePolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/workflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Workflow connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// External engine process
    #[serde(default)]
    pub engine: EngineConfig,
    /// Recentring calculator
    #[serde(default)]
    pub recentring: RecentringConfig,
    /// Task queue behaviour
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Workflow connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Capacity of the engine→dispatcher FIFO
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Longest time one engine request may stay unanswered before the run is aborted
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Directory reported in `ConfigurationData`
    #[serde(default = "default_configuration_location")]
    pub configuration_location: String,
    /// Root directory for images of a run
    #[serde(default = "default_image_root")]
    pub image_root: String,
    /// Sample name reported in `PriorInformation`
    #[serde(default = "default_sample_name")]
    pub sample_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            request_timeout: default_request_timeout(),
            configuration_location: default_configuration_location(),
            image_root: default_image_root(),
            sample_name: default_sample_name(),
        }
    }
}

/// External engine process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program to run (e.g. a java launcher)
    #[serde(default = "default_engine_executable")]
    pub executable: PathBuf,
    /// Classpath passed with `-cp`
    #[serde(default)]
    pub classpath: Option<String>,
    /// `-D<key>=<value>` properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Application (workflow) to launch
    #[serde(default)]
    pub application: String,
    /// `-<key> <value>` options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Engine working directory, created if absent
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Engine installation directory
    #[serde(default)]
    pub installation_dir: Option<PathBuf>,
    /// License directory
    #[serde(default)]
    pub license_dir: Option<PathBuf>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// How long `stop()` waits for a clean exit before killing
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_engine_executable(),
            classpath: None,
            properties: BTreeMap::new(),
            application: String::new(),
            options: BTreeMap::new(),
            working_dir: default_working_dir(),
            installation_dir: None,
            license_dir: None,
            env: BTreeMap::new(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

/// One rotation axis and its direction in the laboratory frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDirection {
    /// Axis name, e.g. "omega"
    pub name: String,
    /// Unit direction vector
    pub direction: Vec<f64>,
}

/// Recentring calculator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentringConfig {
    /// Geometry tool; recentring is unavailable when unset
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Where the namelist input file is written
    #[serde(default = "default_recentring_input")]
    pub input_file: PathBuf,
    /// Goniostat home position (x, y, z)
    #[serde(default = "default_home_position")]
    pub home_position: Vec<f64>,
    /// Cross-section of the sphere of confusion
    #[serde(default = "default_cross_sec_of_soc")]
    pub cross_sec_of_soc: Vec<f64>,
    /// Rotation axes in declared order (omega, kappa, phi)
    #[serde(default = "default_rotation_axes")]
    pub rotation_axes: Vec<AxisDirection>,
    /// Translation axis names in declared order
    #[serde(default = "default_translation_axes")]
    pub translation_axes: Vec<String>,
    /// Extra environment variables for the tool
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RecentringConfig {
    fn default() -> Self {
        Self {
            executable: None,
            input_file: default_recentring_input(),
            home_position: default_home_position(),
            cross_sec_of_soc: default_cross_sec_of_soc(),
            rotation_axes: default_rotation_axes(),
            translation_axes: default_translation_axes(),
            env: BTreeMap::new(),
        }
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Behaviour of a group after one child failed
    #[serde(default)]
    pub sibling_failure_policy: SiblingFailurePolicy,
}

// Default value functions
fn default_name() -> String {
    "Beamline Workflow".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_channel_capacity() -> usize {
    32
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_configuration_location() -> String {
    "/config/gphl".to_string()
}

fn default_image_root() -> String {
    "/data/visitor".to_string()
}

fn default_sample_name() -> String {
    "sample".to_string()
}

fn default_engine_executable() -> PathBuf {
    PathBuf::from("java")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("gphl_wdir")
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_recentring_input() -> PathBuf {
    PathBuf::from("gphl_wdir/temp_recen.in")
}

fn default_home_position() -> Vec<f64> {
    vec![0.0, 0.0, 0.0]
}

fn default_cross_sec_of_soc() -> Vec<f64> {
    vec![0.0, 0.0, 0.0]
}

fn default_rotation_axes() -> Vec<AxisDirection> {
    vec![
        AxisDirection {
            name: "omega".into(),
            direction: vec![1.0, 0.0, 0.0],
        },
        AxisDirection {
            name: "kappa".into(),
            direction: vec![0.914, 0.279, -0.297],
        },
        AxisDirection {
            name: "phi".into(),
            direction: vec![1.0, 0.0, 0.0],
        },
    ]
}

fn default_translation_axes() -> Vec<String> {
    vec!["sampx".into(), "sampy".into(), "phiy".into()]
}

impl WorkflowConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> WorkflowResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// Missing files fall back to defaults; environment overrides always apply,
    /// e.g. `BEAMLINE_WF_CONNECTION__REQUEST_TIMEOUT=30m`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> WorkflowResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(WorkflowConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_WF_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no environment overrides).
    pub fn from_toml(toml: &str) -> WorkflowResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(WorkflowConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> WorkflowResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)?;
        self.application.log_format.parse::<OutputFormat>()?;

        if self.connection.channel_capacity == 0 {
            return Err(WorkflowError::Configuration(
                "connection.channel_capacity must be positive".into(),
            ));
        }
        if self.connection.request_timeout.is_zero() {
            return Err(WorkflowError::Configuration(
                "connection.request_timeout must be positive".into(),
            ));
        }

        let recentring = &self.recentring;
        for (label, values) in [
            ("home_position", &recentring.home_position),
            ("cross_sec_of_soc", &recentring.cross_sec_of_soc),
        ] {
            if values.len() != 3 {
                return Err(WorkflowError::Configuration(format!(
                    "recentring.{label} must have 3 components, found {}",
                    values.len()
                )));
            }
        }

        let mut names = HashSet::new();
        for axis in &recentring.rotation_axes {
            if axis.direction.len() != 3 {
                return Err(WorkflowError::Configuration(format!(
                    "rotation axis '{}' direction must have 3 components",
                    axis.name
                )));
            }
            if !names.insert(axis.name.as_str()) {
                return Err(WorkflowError::Configuration(format!(
                    "Duplicate rotation axis: {}",
                    axis.name
                )));
            }
        }
        if recentring.rotation_axes.len() != 3 {
            return Err(WorkflowError::Configuration(format!(
                "recentring needs exactly 3 rotation axes, found {}",
                recentring.rotation_axes.len()
            )));
        }

        let mut names = HashSet::new();
        for axis in &recentring.translation_axes {
            if !names.insert(axis.as_str()) {
                return Err(WorkflowError::Configuration(format!(
                    "Duplicate translation axis: {axis}"
                )));
            }
        }
        if recentring.translation_axes.len() != 3 {
            return Err(WorkflowError::Configuration(format!(
                "recentring needs exactly 3 translation axes, found {}",
                recentring.translation_axes.len()
            )));
        }

        Ok(())
    }

    /// Rotation axis names in declared order.
    pub fn rotation_axis_names(&self) -> Vec<&str> {
        self.recentring
            .rotation_axes
            .iter()
            .map(|axis| axis.name.as_str())
            .collect()
    }
}
