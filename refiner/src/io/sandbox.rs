//! Sandbox execution engine.
//!
//! Each call writes the candidate and the oracle into a fresh temporary
//! workspace and runs the oracle in a disposable, network-less container that
//! sees the workspace read-only. Nothing is reused between calls.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{RawExecution, TIMEOUT_EXIT_CODE};
use crate::io::process::{CommandOutput, run_command};

pub const CANDIDATE_FILE: &str = "impl.py";
pub const ORACLE_FILE: &str = "test_impl.py";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
const REQUIREMENTS: &str = "pytest\nhypothesis\n";

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Budget for short control commands (`version`, `inspect`, `ps`, `rm`).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const CONTROL_OUTPUT_LIMIT: usize = 64 * 1024;
/// `docker run` exits with 125 when the daemon itself failed.
const DOCKER_DAEMON_ERROR: i32 = 125;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("isolation backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("sandbox image `{image}` unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },
}

/// `[sandbox]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker CLI binary.
    pub docker_bin: String,
    /// Image providing python + pytest.
    pub image: String,
    /// Pull the image at startup when it is missing locally.
    pub pull_missing_image: bool,
    /// Hard memory ceiling (`docker run --memory`).
    pub memory: String,
    /// CPU ceiling (`docker run --cpus`).
    pub cpus: f64,
    pub pids_limit: u32,
    /// Per-execution wall-clock timeout.
    pub timeout_secs: u64,
    /// Bytes of stdout/stderr kept per execution.
    pub output_limit_bytes: usize,
    /// Harness command run inside the container.
    pub command: Vec<String>,
    /// `key=value` label put on every container, used for garbage collection.
    pub label: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "auto-tdd-pytest:latest".to_string(),
            pull_missing_image: true,
            memory: "50m".to_string(),
            cpus: 0.5,
            pids_limit: 64,
            timeout_secs: 30,
            output_limit_bytes: 100_000,
            command: [
                "pytest",
                ORACLE_FILE,
                "-v",
                "--tb=short",
                "--no-header",
                "-p",
                "no:cacheprovider",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            label: "refiner.sandbox=1".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.docker_bin.trim().is_empty() {
            return Err("sandbox.docker_bin must not be empty".to_string());
        }
        if self.image.trim().is_empty() {
            return Err("sandbox.image must not be empty".to_string());
        }
        if self.memory.trim().is_empty() {
            return Err("sandbox.memory must not be empty".to_string());
        }
        if self.cpus.is_nan() || self.cpus <= 0.0 {
            return Err("sandbox.cpus must be > 0".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("sandbox.timeout_secs must be > 0".to_string());
        }
        if self.output_limit_bytes == 0 {
            return Err("sandbox.output_limit_bytes must be > 0".to_string());
        }
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err("sandbox.command must be a non-empty array".to_string());
        }
        if !self.label.contains('=') {
            return Err("sandbox.label must look like key=value".to_string());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One isolated run of `command` against a prepared workspace.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub workspace: &'a Path,
    pub command: &'a [String],
    pub timeout: Duration,
}

/// Host-provided isolation primitive.
///
/// Implementations only fail with [`SandboxError`] for infrastructure
/// problems; anything the candidate does is reported through the returned
/// [`RawExecution`].
pub trait IsolationBackend {
    fn ping(&self) -> Result<(), SandboxError>;

    /// Make sure the execution image is present.
    fn ensure_image(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    fn run(
        &self,
        request: &RunRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<RawExecution, SandboxError>;

    /// Remove environments leaked by earlier runs. Returns how many were removed.
    fn collect_garbage(&self) -> Result<usize, SandboxError>;
}

/// Writes workspaces and drives an [`IsolationBackend`].
pub struct Sandbox {
    backend: Box<dyn IsolationBackend>,
    command: Vec<String>,
    timeout: Duration,
}

impl Sandbox {
    /// Check the backend, make sure the image exists and sweep leaked containers.
    #[instrument(skip_all)]
    pub fn new(
        backend: Box<dyn IsolationBackend>,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        backend.ping()?;
        backend.ensure_image()?;
        match backend.collect_garbage() {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed leaked sandbox containers"),
            Err(err) => warn!(err = %err, "sandbox garbage collection failed"),
        }
        Ok(Self {
            backend,
            command: config.command.clone(),
            timeout: config.timeout(),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `oracle` against `candidate` in a fresh workspace.
    ///
    /// Only infrastructure failures are errors; a candidate that cannot even
    /// be written out yields a failed [`RawExecution`].
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), candidate_bytes = candidate.len()))]
    pub fn execute(
        &self,
        candidate: &str,
        oracle: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RawExecution, SandboxError> {
        let started = Instant::now();
        let workspace = match prepare_workspace(candidate, oracle) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(err = %err, "failed to prepare sandbox workspace");
                return Ok(RawExecution::failed_to_run(
                    format!("failed to prepare workspace: {err:#}"),
                    started.elapsed(),
                ));
            }
        };

        let request = RunRequest {
            workspace: workspace.path(),
            command: &self.command,
            timeout,
        };
        let raw = self.backend.run(&request, cancel)?;
        debug!(
            exit_code = raw.exit_code,
            timed_out = raw.timed_out,
            "sandbox execution finished"
        );
        // `workspace` drops here, removing the directory.
        Ok(raw)
    }

    pub fn collect_garbage(&self) -> Result<usize, SandboxError> {
        self.backend.collect_garbage()
    }
}

fn prepare_workspace(candidate: &str, oracle: &str) -> anyhow::Result<tempfile::TempDir> {
    use anyhow::Context;

    let dir = tempfile::Builder::new()
        .prefix("refiner-")
        .tempdir()
        .context("create workspace")?;
    // The container user is not necessarily the host user.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))
            .context("open workspace permissions")?;
    }
    for (name, contents) in [
        (CANDIDATE_FILE, candidate),
        (ORACLE_FILE, oracle),
        (REQUIREMENTS_FILE, REQUIREMENTS),
    ] {
        let path = dir.path().join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(dir)
}

/// [`IsolationBackend`] driving the Docker CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    config: SandboxConfig,
}

impl DockerBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn docker(&self) -> Command {
        Command::new(&self.config.docker_bin)
    }

    fn control(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, SandboxError> {
        let mut cmd = self.docker();
        cmd.args(args);
        run_command(cmd, None, timeout, CONTROL_OUTPUT_LIMIT, &CancelToken::new()).map_err(|err| {
            SandboxError::BackendUnavailable(format!(
                "{} {}: {err:#}",
                self.config.docker_bin,
                args.join(" ")
            ))
        })
    }

    /// Arguments for `docker run`, excluding the binary.
    pub fn run_args(&self, name: &str, workspace: &Path, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            self.config.label.clone(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            self.config.memory.clone(),
            "--memory-swap".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.to_string(),
            "--pids-limit".into(),
            self.config.pids_limit.to_string(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp:rw,size=16m".into(),
            "-v".into(),
            format!("{}:{CONTAINER_WORKDIR}:ro", workspace.display()),
            "-w".into(),
            CONTAINER_WORKDIR.into(),
            "-e".into(),
            "PYTHONDONTWRITEBYTECODE=1".into(),
            "-e".into(),
            "PYTEST_DISABLE_PLUGIN_AUTOLOAD=1".into(),
            self.config.image.clone(),
        ];
        args.extend(command.iter().cloned());
        args
    }

    /// Kill and remove a named container. Errors are logged, not returned.
    fn destroy(&self, name: &str) {
        let steps: [&[&str]; 2] = [&["kill", name], &["rm", "-f", name]];
        for args in steps {
            match self.control(args, CONTROL_TIMEOUT) {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    debug!(container = name, stderr = %out.stderr_lossy().trim(), "container cleanup step failed");
                }
                Err(err) => warn!(container = name, err = %err, "container cleanup failed"),
            }
        }
    }
}

impl IsolationBackend for DockerBackend {
    fn ping(&self) -> Result<(), SandboxError> {
        let out = self.control(&["version", "--format", "{{.Server.Version}}"], CONTROL_TIMEOUT)?;
        if !out.success() {
            return Err(SandboxError::BackendUnavailable(
                out.stderr_lossy().trim().to_string(),
            ));
        }
        debug!(server_version = %out.stdout_lossy().trim(), "docker daemon reachable");
        Ok(())
    }

    fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = self.config.image.as_str();
        if self.control(&["image", "inspect", image], CONTROL_TIMEOUT)?.success() {
            return Ok(());
        }
        if !self.config.pull_missing_image {
            return Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: "not present locally and pulling is disabled".to_string(),
            });
        }
        info!(image, "pulling sandbox image");
        let out = self.control(&["pull", image], PULL_TIMEOUT)?;
        if !out.success() {
            return Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: out.stderr_lossy().trim().to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(image = %self.config.image, timeout_secs = request.timeout.as_secs()))]
    fn run(
        &self,
        request: &RunRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<RawExecution, SandboxError> {
        let name = format!("refiner-{}", hex::encode(rand::random::<[u8; 6]>()));
        let mut cmd = self.docker();
        cmd.args(self.run_args(&name, request.workspace, request.command));

        let out = run_command(
            cmd,
            None,
            request.timeout,
            self.config.output_limit_bytes,
            cancel,
        )
        .map_err(|err| SandboxError::BackendUnavailable(format!("docker run: {err:#}")))?;

        if out.timed_out || out.cancelled {
            // Killing the client leaves the container running.
            self.destroy(&name);
        }

        let stderr = out.stderr_lossy();
        let exit_code = if out.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            out.status.code().unwrap_or(-1)
        };
        if exit_code == DOCKER_DAEMON_ERROR
            && stderr.contains("Cannot connect to the Docker daemon")
        {
            return Err(SandboxError::BackendUnavailable(stderr.trim().to_string()));
        }

        Ok(RawExecution {
            stdout: out.stdout_lossy(),
            stderr,
            exit_code,
            timed_out: out.timed_out,
            duration: out.duration,
        })
    }

    fn collect_garbage(&self) -> Result<usize, SandboxError> {
        let filter = format!("label={}", self.config.label);
        let out = self.control(&["ps", "-aq", "--filter", &filter], CONTROL_TIMEOUT)?;
        if !out.success() {
            return Err(SandboxError::BackendUnavailable(
                out.stderr_lossy().trim().to_string(),
            ));
        }
        let stdout = out.stdout_lossy();
        let ids: Vec<&str> = stdout.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["rm", "-f"];
        args.extend(ids.iter().copied());
        let out = self.control(&args, CONTROL_TIMEOUT)?;
        if !out.success() {
            warn!(stderr = %out.stderr_lossy().trim(), "failed to remove some leaked containers");
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::test_support::raw_output;

    #[test]
    fn run_args_isolate_the_container() {
        let backend = DockerBackend::new(SandboxConfig::default());
        let command = vec!["pytest".to_string(), ORACLE_FILE.to_string()];
        let args = backend.run_args("refiner-abc", Path::new("/tmp/ws"), &command);
        let joined = args.join(" ");

        assert!(joined.starts_with("run --rm --name refiner-abc --label refiner.sandbox=1"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 50m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("-v /tmp/ws:/workspace:ro"));
        assert!(joined.contains("-e PYTEST_DISABLE_PLUGIN_AUTOLOAD=1"));
        assert!(joined.ends_with("auto-tdd-pytest:latest pytest test_impl.py"));
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(SandboxConfig::default().validate(), Ok(()));
        let bad = SandboxConfig {
            timeout_secs: 0,
            ..SandboxConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    /// Records what the workspace looked like while the backend ran.
    #[derive(Default)]
    struct InspectingBackend {
        seen: RefCell<Vec<(String, String, String)>>,
        workspace: RefCell<Option<std::path::PathBuf>>,
    }

    impl IsolationBackend for Rc<InspectingBackend> {
        fn ping(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        fn run(
            &self,
            request: &RunRequest<'_>,
            _cancel: &CancelToken,
        ) -> Result<RawExecution, SandboxError> {
            let read = |name: &str| {
                fs::read_to_string(request.workspace.join(name)).unwrap_or_default()
            };
            self.seen.borrow_mut().push((
                read(CANDIDATE_FILE),
                read(ORACLE_FILE),
                read(REQUIREMENTS_FILE),
            ));
            *self.workspace.borrow_mut() = Some(request.workspace.to_path_buf());
            Ok(raw_output("1 passed in 0.01s", 0))
        }

        fn collect_garbage(&self) -> Result<usize, SandboxError> {
            Ok(0)
        }
    }

    #[test]
    fn execute_writes_fresh_workspace_and_removes_it() {
        let backend = Rc::new(InspectingBackend::default());
        let sandbox =
            Sandbox::new(Box::new(Rc::clone(&backend)), &SandboxConfig::default()).expect("sandbox");

        let raw = sandbox
            .execute(
                "def f():\n    return 1\n",
                "from impl import f\n",
                Duration::from_secs(5),
                &CancelToken::new(),
            )
            .expect("execute");
        assert_eq!(raw.exit_code, 0);

        let seen = backend.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "def f():\n    return 1\n");
        assert_eq!(seen[0].1, "from impl import f\n");
        assert_eq!(seen[0].2, "pytest\nhypothesis\n");

        let workspace = backend.workspace.borrow().clone().expect("workspace");
        assert!(!workspace.exists());
    }

    struct UnreachableBackend;

    impl IsolationBackend for UnreachableBackend {
        fn ping(&self) -> Result<(), SandboxError> {
            Err(SandboxError::BackendUnavailable("daemon down".to_string()))
        }

        fn run(&self, _: &RunRequest<'_>, _: &CancelToken) -> Result<RawExecution, SandboxError> {
            unreachable!("never pinged successfully")
        }

        fn collect_garbage(&self) -> Result<usize, SandboxError> {
            Ok(0)
        }
    }

    #[test]
    fn unreachable_backend_is_fatal() {
        let err = Sandbox::new(Box::new(UnreachableBackend), &SandboxConfig::default())
            .err()
            .expect("error");
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
    }
}
