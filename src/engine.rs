//! External engine process management.
//!
//! The strategy engine runs as a separate process. The connection only needs to start it,
//! stop it at the end of a run, kill it on abort, and notice when it exits on its own;
//! [`EngineProcess`] is that interface. [`SubprocessEngine`] implements it with
//! `tokio::process`, using a command line assembled by [`EngineCommand`].

use crate::config::EngineConfig;
use crate::error::{WorkflowError, WorkflowResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    /// Exit code; `None` when killed by a signal or when the engine is not a real process
    pub code: Option<i32>,
}

impl EngineExit {
    /// Whether the engine exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for EngineExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "no exit code"),
        }
    }
}

/// Lifecycle of the external engine.
#[async_trait]
pub trait EngineProcess: Send {
    /// Launch the engine.
    async fn start(&mut self) -> WorkflowResult<()>;

    /// Let the engine finish after a terminal message, killing it if it lingers.
    async fn stop(&mut self) -> WorkflowResult<()>;

    /// Kill the engine immediately.
    async fn abort(&mut self) -> WorkflowResult<()>;

    /// Resolve when the engine exits. Never resolves if the engine is not running.
    ///
    /// Must be cancel safe: the dispatcher polls it inside `select!`.
    async fn wait(&mut self) -> WorkflowResult<EngineExit>;
}

/// Command line and environment for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: PathBuf,
}

impl EngineCommand {
    /// Assemble `program [-cp CP] [-Dk=v...] application [-key value...] -wdir DIR`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut args = Vec::new();
        if let Some(classpath) = &config.classpath {
            args.push("-cp".to_string());
            args.push(classpath.clone());
        }
        for (key, value) in &config.properties {
            args.push(format!("-D{key}={value}"));
        }
        if !config.application.is_empty() {
            args.push(config.application.clone());
        }
        for (key, value) in &config.options {
            args.push(format!("-{key}"));
            args.push(value.clone());
        }
        args.push("-wdir".to_string());
        args.push(config.working_dir.display().to_string());

        let mut env = BTreeMap::new();
        if let Some(installation) = &config.installation_dir {
            let installation = installation.display().to_string();
            env.insert("GPHL_INSTALLATION".to_string(), installation.clone());
            env.insert("BDG_home".to_string(), installation);
        }
        if let Some(license) = &config.license_dir {
            env.insert("GPHL_LICENSE_DIR".to_string(), license.display().to_string());
        }
        env.extend(config.env.clone());

        Self {
            program: config.executable.clone(),
            args,
            env,
            working_dir: config.working_dir.clone(),
        }
    }

    /// Program to run.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments in command-line order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment added to the inherited one.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Working directory passed with `-wdir`.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Create the working directory if absent.
    ///
    /// Failure is only logged; the engine reports it when it tries to use the directory.
    pub fn prepare_working_dir(&self) {
        if self.working_dir.is_dir() {
            return;
        }
        match std::fs::create_dir_all(&self.working_dir) {
            Ok(()) => info!(dir = %self.working_dir.display(), "Created engine working directory"),
            Err(e) => warn!(
                dir = %self.working_dir.display(),
                error = %e,
                "Cannot create engine working directory"
            ),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env).kill_on_drop(true);
        command
    }
}

/// Engine running as a child process.
#[derive(Debug)]
pub struct SubprocessEngine {
    command: EngineCommand,
    stop_timeout: Duration,
    child: Option<Child>,
}

impl SubprocessEngine {
    /// Engine that is not yet started.
    pub fn new(command: EngineCommand, stop_timeout: Duration) -> Self {
        Self {
            command,
            stop_timeout,
            child: None,
        }
    }

    /// Engine for the `[engine]` section.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(EngineCommand::from_config(config), config.stop_timeout)
    }

    /// OS process id while running.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl EngineProcess for SubprocessEngine {
    async fn start(&mut self) -> WorkflowResult<()> {
        if self.child.is_some() {
            return Err(WorkflowError::EngineProcess(
                "engine is already running".into(),
            ));
        }
        self.command.prepare_working_dir();
        info!(
            program = %self.command.program.display(),
            args = ?self.command.args,
            "Starting workflow engine"
        );
        let child = self.command.command().spawn().map_err(|e| {
            WorkflowError::EngineProcess(format!(
                "cannot start {}: {e}",
                self.command.program.display()
            ))
        })?;
        debug!(pid = ?child.id(), "Workflow engine started");
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> WorkflowResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(%status, "Workflow engine exited");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout = ?self.stop_timeout,
                    "Workflow engine did not exit; killing it"
                );
                child.kill().await?;
                Ok(())
            }
        }
    }

    async fn abort(&mut self) -> WorkflowResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        warn!(pid = ?child.id(), "Killing workflow engine");
        child.kill().await?;
        Ok(())
    }

    async fn wait(&mut self) -> WorkflowResult<EngineExit> {
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let status = child.wait().await?;
        self.child = None;
        Ok(EngineExit {
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn config() -> EngineConfig {
        let mut config = EngineConfig {
            executable: PathBuf::from("/usr/bin/java"),
            classpath: Some("/opt/gphl/ASTRA.jar".into()),
            application: "co.gphl.wf.workflows.WFTransCal".into(),
            working_dir: PathBuf::from("/tmp/wdir"),
            installation_dir: Some(PathBuf::from("/opt/gphl")),
            license_dir: Some(PathBuf::from("/opt/gphl/licence")),
            ..Default::default()
        };
        config
            .properties
            .insert("file.encoding".into(), "UTF-8".into());
        config.options.insert("wfport".into(), "9090".into());
        config.env.insert("EXTRA".into(), "1".into());
        config
    }

    #[test]
    fn command_line_order() {
        let command = EngineCommand::from_config(&config());
        assert_eq!(command.program(), Path::new("/usr/bin/java"));
        assert_eq!(
            command.args(),
            [
                "-cp",
                "/opt/gphl/ASTRA.jar",
                "-Dfile.encoding=UTF-8",
                "co.gphl.wf.workflows.WFTransCal",
                "-wfport",
                "9090",
                "-wdir",
                "/tmp/wdir",
            ]
        );
    }

    #[test]
    fn environment_carries_installation_paths() {
        let command = EngineCommand::from_config(&config());
        let env = command.env();
        assert_eq!(env["GPHL_INSTALLATION"], "/opt/gphl");
        assert_eq!(env["BDG_home"], "/opt/gphl");
        assert_eq!(env["GPHL_LICENSE_DIR"], "/opt/gphl/licence");
        assert_eq!(env["EXTRA"], "1");
    }

    #[test]
    fn working_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            working_dir: dir.path().join("a").join("wdir"),
            ..Default::default()
        };
        let command = EngineCommand::from_config(&config);
        command.prepare_working_dir();
        assert!(command.working_dir().is_dir());
    }

    #[test]
    #[traced_test]
    fn working_dir_failure_is_only_logged() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = EngineConfig {
            working_dir: file.path().join("wdir"),
            ..Default::default()
        };
        EngineCommand::from_config(&config).prepare_working_dir();
        assert!(logs_contain("Cannot create engine working directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_runs_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            executable: PathBuf::from("/bin/sh"),
            options: BTreeMap::from([("c".to_string(), "exit 3".to_string())]),
            working_dir: dir.path().join("wdir"),
            ..Default::default()
        };
        // `sh -c "exit 3" -wdir <dir>`: the trailing words become $0 and $1
        let mut engine = SubprocessEngine::from_config(&config);
        engine.start().await.unwrap();
        assert!(engine.id().is_some());

        let exit = engine.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert!(engine.stop().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abort_kills_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            executable: PathBuf::from("/bin/sh"),
            options: BTreeMap::from([("c".to_string(), "sleep 30".to_string())]),
            working_dir: dir.path().join("wdir"),
            ..Default::default()
        };
        let mut engine = SubprocessEngine::from_config(&config);
        engine.start().await.unwrap();
        engine.abort().await.unwrap();
        assert!(engine.id().is_none());
    }

    #[tokio::test]
    async fn missing_program_is_an_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            executable: dir.path().join("no-such-engine"),
            working_dir: dir.path().join("wdir"),
            ..Default::default()
        };
        let mut engine = SubprocessEngine::from_config(&config);
        assert!(matches!(
            engine.start().await,
            Err(WorkflowError::EngineProcess(_))
        ));
    }
}
