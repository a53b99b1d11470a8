use std::{process::ExitStatus, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use rustix::process::{self, Pid, Signal};
use tokio::{
    process::{Child, ChildStderr, Command},
    sync::Mutex,
};
use tracing::{debug, warn};

struct Supervised {
    child: Child,
    status: Option<ExitStatus>,
}

/// Shared handle to a spawned process.
/// Clones refer to the same process; the exit status is cached after the first reap.
#[derive(Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Pid,
    inner: Arc<Mutex<Supervised>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.pid.as_raw_nonzero())
    }
}

impl ProcessHandle {
    pub fn spawn(name: impl Into<String>, cmd: &mut Command) -> Result<Self> {
        let name = name.into();
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {name}"))?;

        let pid = child
            .id()
            .and_then(|id| Pid::from_raw(id as i32))
            .ok_or(anyhow!("{name} exited before its pid could be read"))?;

        debug!("Spawned {name} with pid {}", pid.as_raw_nonzero());

        Ok(Self {
            name,
            pid,
            inner: Arc::new(Mutex::new(Supervised {
                child,
                status: None,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The piped stderr of the process, for the first caller
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.inner.try_lock().ok()?.child.stderr.take()
    }

    /// Waits for the process to exit. Cancel-safe.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut inner = self.inner.lock().await;

        if let Some(status) = inner.status {
            return Ok(status);
        }

        let status = inner
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", self.name))?;

        inner.status = Some(status);
        Ok(status)
    }

    /// Exit status, if the process has already been reaped or has exited by now
    pub fn try_status(&self) -> Result<Option<ExitStatus>> {
        let Ok(mut inner) = self.inner.try_lock() else {
            // Someone is waiting on it, so it's still running
            return Ok(None);
        };

        if inner.status.is_none() {
            inner.status = inner.child.try_wait()?;
        }
        Ok(inner.status)
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.try_status(), Ok(Some(_)))
    }

    /// Sends SIGINT and waits for the process to go away.
    /// A process that has already been reaped is left alone.
    pub async fn interrupt_and_wait(&self) -> Result<ExitStatus> {
        if let Some(status) = self.try_status()? {
            return Ok(status);
        }

        match process::kill_process(self.pid, Signal::INT) {
            Ok(()) => debug!("Interrupted {}", self.name),
            // Exited but not yet reaped
            Err(rustix::io::Errno::SRCH) => {}
            Err(error) => bail!("Failed to interrupt {}: {error}", self.name),
        }

        let status = self.wait().await?;
        if !status.success() {
            warn!("{} exited with {status} after interrupt", self.name);
        }
        Ok(status)
    }
}

/// Runs a short-lived helper and returns its trimmed stdout.
/// The helper is killed if the returned future is dropped early.
pub async fn output(name: &str, cmd: &mut Command) -> Result<String> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run {name}"))?;

    if !output.status.success() {
        bail!(
            "{name} failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8(output.stdout)
        .with_context(|| format!("{name} produced non-UTF-8 output"))?
        .trim()
        .to_string())
}
