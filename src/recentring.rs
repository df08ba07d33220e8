//! Recentring calculator.
//!
//! Predicts the sample translation at a new goniostat rotation from a reference
//! rotation/translation pair by running an external geometry tool:
//!
//! ```text
//! <tool> --input <namelist> --init-xyz "x y z" --init-okp "o k p" --okp "o k p"
//! ```
//!
//! The tool's output is free text. A successful run contains a `NORMAL termination` line and
//! an `X,Y,Z` line whose last three tokens are the new translation.
//!
//! Failures never propagate: they are logged and the result is empty, meaning "no recentring
//! available".

use crate::config::{AxisDirection, RecentringConfig};
use crate::error::{WorkflowError, WorkflowResult};
use crate::geometry::{AxisSettings, GoniostatRotation, GoniostatTranslation};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const TERMINATION_MARKER: &str = "NORMAL termination";
const RESULT_MARKER: &str = "X,Y,Z";

/// Runs the geometry tool for one beamline configuration.
#[derive(Debug, Clone)]
pub struct RecentringCalculator {
    executable: PathBuf,
    input_file: PathBuf,
    home_position: Vec<f64>,
    cross_sec_of_soc: Vec<f64>,
    rotation_axes: Vec<AxisDirection>,
    translation_axes: Vec<String>,
    env: BTreeMap<String, String>,
}

impl RecentringCalculator {
    /// Calculator for `config`, or `None` when no tool is configured.
    pub fn from_config(config: &RecentringConfig) -> Option<Self> {
        let executable = config.executable.clone()?;
        Some(Self {
            executable,
            input_file: config.input_file.clone(),
            home_position: config.home_position.clone(),
            cross_sec_of_soc: config.cross_sec_of_soc.clone(),
            rotation_axes: config.rotation_axes.clone(),
            translation_axes: config.translation_axes.clone(),
            env: config.env.clone(),
        })
    }

    /// Translation axis names in declared order.
    pub fn translation_axes(&self) -> &[String] {
        &self.translation_axes
    }

    /// Input file contents: a `&recen_list` namelist with axis directions and calibration.
    pub fn namelist(&self) -> String {
        let mut text = String::from("&recen_list\n");
        for axis in &self.rotation_axes {
            let _ = writeln!(text, " {}_axis = {},", axis.name, join_values(&axis.direction, ", "));
        }
        let _ = writeln!(text, " home = {},", join_values(&self.home_position, ", "));
        let _ = writeln!(
            text,
            " cross_sec_of_soc = {},",
            join_values(&self.cross_sec_of_soc, ", ")
        );
        text.push_str("/\n");
        text
    }

    /// Write [`RecentringCalculator::namelist`] to the configured input file.
    pub async fn write_input(&self) -> WorkflowResult<&Path> {
        if let Some(dir) = self.input_file.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }
        fs::write(&self.input_file, self.namelist()).await?;
        Ok(&self.input_file)
    }

    /// Command-line arguments for one calculation.
    pub fn arguments(
        &self,
        reference_rotation: &GoniostatRotation,
        reference_translation: &GoniostatTranslation,
        target: &GoniostatRotation,
    ) -> WorkflowResult<Vec<String>> {
        let rotation_names: Vec<&str> = self.rotation_axes.iter().map(|a| a.name.as_str()).collect();
        let xyz = reference_translation
            .axis_settings()
            .values_for(self.translation_axes.iter().map(String::as_str))
            .ok_or_else(|| missing_axes("reference translation", reference_translation.axis_settings()))?;
        let init_okp = reference_rotation
            .axis_settings()
            .values_for(rotation_names.iter().copied())
            .ok_or_else(|| missing_axes("reference rotation", reference_rotation.axis_settings()))?;
        let okp = target
            .axis_settings()
            .values_for(rotation_names.iter().copied())
            .ok_or_else(|| missing_axes("target rotation", target.axis_settings()))?;

        Ok(vec![
            "--input".to_string(),
            self.input_file.display().to_string(),
            "--init-xyz".to_string(),
            join_values(&xyz, " "),
            "--init-okp".to_string(),
            join_values(&init_okp, " "),
            "--okp".to_string(),
            join_values(&okp, " "),
        ])
    }

    /// Translation at `target`, or an empty result when recentring is not available.
    pub async fn recentre(
        &self,
        reference_rotation: &GoniostatRotation,
        reference_translation: &GoniostatTranslation,
        target: &GoniostatRotation,
    ) -> AxisSettings {
        match self
            .run(reference_rotation, reference_translation, target)
            .await
        {
            Ok(output) => parse_recentring_output(&output, &self.translation_axes),
            Err(e) => {
                error!(error = %e, "Recentring calculation failed");
                AxisSettings::default()
            }
        }
    }

    async fn run(
        &self,
        reference_rotation: &GoniostatRotation,
        reference_translation: &GoniostatTranslation,
        target: &GoniostatRotation,
    ) -> WorkflowResult<String> {
        let args = self.arguments(reference_rotation, reference_translation, target)?;
        self.write_input().await?;
        debug!(tool = %self.executable.display(), ?args, "Running recentring tool");

        let output = Command::new(&self.executable)
            .args(&args)
            .envs(&self.env)
            .output()
            .await
            .map_err(|e| {
                WorkflowError::EngineProcess(format!(
                    "cannot run {}: {e}",
                    self.executable.display()
                ))
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(WorkflowError::EngineProcess(format!(
                "{} exited with {}: {}",
                self.executable.display(),
                output.status,
                text.trim()
            )));
        }
        Ok(text)
    }
}

/// Extract the recentred translation from the tool's output.
///
/// Lines are scanned backwards for the termination marker; the `X,Y,Z` line is the first one
/// after it, or failing that the nearest one before it. Its last three tokens are mapped onto
/// `axes` in order. Anything unexpected yields an empty result and an error log entry.
pub fn parse_recentring_output(text: &str, axes: &[String]) -> AxisSettings {
    let lines: Vec<&str> = text.lines().collect();
    let Some(marker) = lines
        .iter()
        .rposition(|line| line.contains(TERMINATION_MARKER))
    else {
        error!("Recentring output lacks '{}'", TERMINATION_MARKER);
        return AxisSettings::default();
    };

    let after = lines[marker + 1..]
        .iter()
        .find(|line| line.contains(RESULT_MARKER));
    let before = || {
        lines[..marker]
            .iter()
            .rev()
            .find(|line| line.contains(RESULT_MARKER))
    };
    let Some(result_line) = after.or_else(before) else {
        error!("Recentring output has no '{}' line", RESULT_MARKER);
        return AxisSettings::default();
    };

    let tokens: Vec<&str> = result_line.split_whitespace().collect();
    if tokens.len() < 3 {
        error!(line = %result_line, "Malformed recentring result line");
        return AxisSettings::default();
    }
    let values: Result<Vec<f64>, _> = tokens[tokens.len() - 3..]
        .iter()
        .map(|token| token.trim_end_matches(',').parse::<f64>())
        .collect();
    let values = match values {
        Ok(values) => values,
        Err(e) => {
            error!(line = %result_line, error = %e, "Malformed recentring result line");
            return AxisSettings::default();
        }
    };

    if axes.len() != values.len() {
        warn!(
            axes = axes.len(),
            "Recentring result has {} values; extra values or axes are ignored",
            values.len()
        );
    }
    let settings = AxisSettings::new(axes.iter().map(String::as_str).zip(values));
    info!(translation = %settings, "Recentring result");
    settings
}

fn join_values(values: &[f64], separator: &str) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

fn missing_axes(what: &str, settings: &AxisSettings) -> WorkflowError {
    WorkflowError::EngineProcess(format!("{what} {settings} lacks a recentring axis"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn axes() -> Vec<String> {
        vec!["sampx".into(), "sampy".into(), "phiy".into()]
    }

    fn rotation(omega: f64, kappa: f64, phi: f64) -> GoniostatRotation {
        GoniostatRotation::new(AxisSettings::new([
            ("omega", omega),
            ("kappa", kappa),
            ("phi", phi),
        ]))
    }

    fn calculator(executable: PathBuf, input_file: PathBuf) -> RecentringCalculator {
        let config = RecentringConfig {
            executable: Some(executable),
            input_file,
            ..Default::default()
        };
        RecentringCalculator::from_config(&config).unwrap()
    }

    #[test]
    fn parses_translation_after_termination() {
        let text = "startup\nNORMAL termination\n  X,Y,Z  1.0 2.0 3.0\n";
        let settings = parse_recentring_output(text, &axes());
        assert_eq!(settings.axes().collect::<Vec<_>>(), ["sampx", "sampy", "phiy"]);
        assert_eq!(settings.values(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn falls_back_to_result_before_termination() {
        let text = "Recentred X,Y,Z: -0.25 0.5 1.75\n NORMAL termination\n";
        let settings = parse_recentring_output(text, &axes());
        assert_eq!(settings.values(), vec![-0.25, 0.5, 1.75]);
    }

    #[test]
    #[traced_test]
    fn missing_marker_yields_empty_result() {
        let settings = parse_recentring_output("X,Y,Z 1.0 2.0 3.0\n", &axes());
        assert!(settings.is_empty());
        assert!(logs_contain("lacks 'NORMAL termination'"));
    }

    #[test]
    #[traced_test]
    fn malformed_tokens_yield_empty_result() {
        let settings = parse_recentring_output("NORMAL termination\nX,Y,Z 1.0 two 3.0\n", &axes());
        assert!(settings.is_empty());
        assert!(logs_contain("Malformed recentring result line"));
    }

    #[test]
    fn namelist_lists_axes_and_calibration() {
        let calc = calculator(PathBuf::from("recen"), PathBuf::from("recen.in"));
        let namelist = calc.namelist();
        assert!(namelist.starts_with("&recen_list\n"));
        assert!(namelist.contains(" omega_axis = 1, 0, 0,\n"));
        assert!(namelist.contains(" kappa_axis = 0.914, 0.279, -0.297,\n"));
        assert!(namelist.contains(" home = 0, 0, 0,\n"));
        assert!(namelist.ends_with("/\n"));
    }

    #[test]
    fn arguments_follow_declared_axis_order() {
        let calc = calculator(PathBuf::from("recen"), PathBuf::from("recen.in"));
        let reference = rotation(0.0, 10.0, 20.0);
        let translation = GoniostatTranslation::for_rotation(
            &reference,
            AxisSettings::new([("phiy", 3.0), ("sampx", 1.0), ("sampy", 2.0)]),
        );
        let args = calc
            .arguments(&reference, &translation, &rotation(90.0, 0.0, 45.0))
            .unwrap();
        assert_eq!(
            args,
            vec![
                "--input", "recen.in", "--init-xyz", "1 2 3", "--init-okp", "0 10 20", "--okp",
                "90 0 45"
            ]
        );
    }

    #[tokio::test]
    async fn write_input_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("wdir").join("temp_recen.in");
        let calc = calculator(PathBuf::from("recen"), input.clone());

        calc.write_input().await.unwrap();
        let written = tokio::fs::read_to_string(input).await.unwrap();
        assert_eq!(written, calc.namelist());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recentre_runs_the_tool() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("recen.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'NORMAL termination' >&2\necho ' X,Y,Z  0.1 0.2 0.3'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let calc = calculator(script, dir.path().join("recen.in"));
        let reference = rotation(0.0, 0.0, 0.0);
        let translation = GoniostatTranslation::for_rotation(
            &reference,
            AxisSettings::new([("sampx", 0.0), ("sampy", 0.0), ("phiy", 0.0)]),
        );

        let settings = calc
            .recentre(&reference, &translation, &rotation(90.0, 0.0, 0.0))
            .await;
        // stderr is appended after stdout, so the result line precedes the marker
        assert_eq!(settings.values(), vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_tool_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let calc = calculator(dir.path().join("no-such-tool"), dir.path().join("recen.in"));
        let reference = rotation(0.0, 0.0, 0.0);
        let translation = GoniostatTranslation::for_rotation(
            &reference,
            AxisSettings::new([("sampx", 0.0), ("sampy", 0.0), ("phiy", 0.0)]),
        );

        let settings = calc.recentre(&reference, &translation, &reference).await;
        assert!(settings.is_empty());
        assert!(logs_contain("Recentring calculation failed"));
    }
}
