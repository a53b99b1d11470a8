use std::{future::Future, sync::Mutex};

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::login::subprocess::ProcessHandle;

/// Turns terminating signals into a cancellation the login flow can observe.
/// The signal listener only cancels the token; the actual teardown happens
/// in the login flow itself.
#[derive(Default)]
pub struct InterruptController {
    token: CancellationToken,
    armed: Mutex<Vec<ProcessHandle>>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening for SIGINT, SIGTERM, SIGHUP and SIGQUIT.
    /// Must be called from within a tokio runtime.
    pub fn install(&self) -> Result<()> {
        let listen = |kind: SignalKind, name: &str| {
            signal(kind).with_context(|| format!("Failed to install {name} handler"))
        };

        let mut int = listen(SignalKind::interrupt(), "SIGINT")?;
        let mut term = listen(SignalKind::terminate(), "SIGTERM")?;
        let mut hup = listen(SignalKind::hangup(), "SIGHUP")?;
        let mut quit = listen(SignalKind::quit(), "SIGQUIT")?;

        let token = self.token.clone();
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = term.recv() => "SIGTERM",
                _ = hup.recv() => "SIGHUP",
                _ = quit.recv() => "SIGQUIT",
                _ = token.cancelled() => return,
            };

            info!("Received {name}, ending the session");
            token.cancel();
        });

        Ok(())
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Replaces the set of processes interrupted on cancellation
    pub fn arm(&self, handles: Vec<ProcessHandle>) {
        match self.armed.lock() {
            Ok(mut armed) => *armed = handles,
            Err(poisoned) => *poisoned.into_inner() = handles,
        }
    }

    /// Runs `fut` unless an interrupt arrives first
    pub async fn race<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            value = fut => Some(value),
        }
    }

    /// Interrupts every armed process in the order it was armed and waits for each
    pub async fn interrupt_armed(&self) {
        let armed = match self.armed.lock() {
            Ok(mut armed) => std::mem::take(&mut *armed),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for handle in armed {
            if let Err(error) = handle.interrupt_and_wait().await {
                warn!("{error:#}");
            }
        }
    }
}
