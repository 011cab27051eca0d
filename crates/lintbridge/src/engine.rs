//! Engine process seam.
//!
//! The bridge only needs two things from whoever runs the engine: start it
//! pointed at the acceptor's port, and stop it on request.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

/// How long a terminated engine gets to exit before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("engine jar not found: {}", .0.display())]
    MissingJar(PathBuf),
    #[error("failed to spawn engine: {0}")]
    Spawn(#[from] io::Error),
}

/// Starts an engine that connects back to `port`.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, port: u16) -> Result<Box<dyn EngineProcess>, LaunchError>;
}

/// Handle to a running engine.
#[async_trait]
pub trait EngineProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Terminate the engine and wait for it to exit.
    async fn stop(&mut self);
}

/// Runs the language server jar with the JVM:
/// `java -jar <server.jar> <port> file://<analyzer.jar>...`
#[derive(Debug, Clone)]
pub struct JavaLauncher {
    java_bin: PathBuf,
    server_jar: PathBuf,
    analyzers: Vec<PathBuf>,
}

impl JavaLauncher {
    pub fn new(server_jar: impl Into<PathBuf>) -> Self {
        Self {
            java_bin: PathBuf::from("java"),
            server_jar: server_jar.into(),
            analyzers: Vec::new(),
        }
    }

    pub fn with_java_bin(mut self, java_bin: impl Into<PathBuf>) -> Self {
        self.java_bin = java_bin.into();
        self
    }

    pub fn with_analyzers(mut self, analyzers: impl IntoIterator<Item = PathBuf>) -> Self {
        self.analyzers = analyzers.into_iter().collect();
        self
    }

    pub fn command_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "-jar".to_string(),
            self.server_jar.display().to_string(),
            port.to_string(),
        ];
        args.extend(
            self.analyzers
                .iter()
                .map(|analyzer| format!("file://{}", analyzer.display())),
        );
        args
    }
}

impl EngineLauncher for JavaLauncher {
    fn launch(&self, port: u16) -> Result<Box<dyn EngineProcess>, LaunchError> {
        if !self.server_jar.is_file() {
            return Err(LaunchError::MissingJar(self.server_jar.clone()));
        }
        for analyzer in &self.analyzers {
            if !analyzer.is_file() {
                tracing::warn!(analyzer = %analyzer.display(), "Analyzer jar not found");
            }
        }

        let child = Command::new(&self.java_bin)
            .args(self.command_args(port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        tracing::info!(pid = child.id(), port, jar = %self.server_jar.display(), "Engine launched");
        Ok(Box::new(ChildEngine::new(child)))
    }
}

/// Engine running as a child process of this one.
pub struct ChildEngine {
    child: Child,
}

impl ChildEngine {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl EngineProcess for ChildEngine {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn stop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "Engine already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to poll engine status"),
        }

        terminate(&mut self.child);

        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "Engine stopped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for engine"),
            Err(_) => {
                tracing::warn!("Engine ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::error!(error = %e, "Failed to kill engine");
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM to engine");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to terminate engine");
    }
}
