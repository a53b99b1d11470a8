use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use rustix::process::Pid;
use tracing::info;

use super::{Carrier, SessionKind, client};
use crate::{
    environment::Env,
    login::{subprocess::ProcessHandle, users::Identity},
};

// Toolkits that still default to X11 otherwise
const TOOLKIT_HINTS: [(&str, &str); 4] = [
    ("MOZ_ENABLE_WAYLAND", "1"),
    ("QT_QPA_PLATFORM", "wayland"),
    ("SDL_VIDEODRIVER", "wayland"),
    ("_JAVA_AWT_WM_NONREPARENTING", "1"),
];

/// A compositor started directly as the session.
/// It is ready as soon as it is running.
pub struct WaylandCarrier {
    command_line: Vec<String>,
    compositor: Option<ProcessHandle>,
}

impl WaylandCarrier {
    pub fn new(command_line: Vec<String>) -> Self {
        Self {
            command_line,
            compositor: None,
        }
    }
}

#[async_trait(?Send)]
impl Carrier for WaylandCarrier {
    fn kind(&self) -> SessionKind {
        SessionKind::Wayland
    }

    async fn start(&mut self, identity: &Identity, env: &Env) -> Result<ProcessHandle> {
        let env = env.clone().merge(self.session_env());

        let mut cmd = client::command(identity, &self.command_line, env)?;
        cmd.stdin(Stdio::null());

        info!("Starting compositor {}", self.command_line.join(" "));
        let compositor = ProcessHandle::spawn("compositor", &mut cmd)?;
        self.compositor = Some(compositor.clone());

        Ok(compositor)
    }

    async fn stop(&mut self) -> Result<()> {
        match self.compositor.take() {
            Some(compositor) => compositor.interrupt_and_wait().await.map(|_| ()),
            None => Ok(()),
        }
    }

    fn pid(&self) -> Option<Pid> {
        self.compositor.as_ref().map(ProcessHandle::pid)
    }

    fn session_env(&self) -> Env {
        TOOLKIT_HINTS
            .iter()
            .fold(Env::empty().set(SessionKind::Wayland), |env, (key, value)| {
                env.set_raw(*key, *value)
            })
    }

    fn record_display(&self) -> String {
        String::new()
    }

    fn hosts_client(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::users::Passwd;

    #[tokio::test]
    async fn compositor_is_the_session() {
        let identity = Passwd.current().unwrap();
        let mut carrier = WaylandCarrier::new(vec!["sleep".into(), "30".into()]);

        let compositor = carrier.start(&identity, &Env::empty().set_raw("PATH", "/usr/bin:/bin")).await.unwrap();

        assert!(carrier.hosts_client());
        assert_eq!(carrier.pid(), Some(compositor.pid()));
        assert_eq!(carrier.record_display(), "");

        carrier.stop().await.unwrap();
        carrier.stop().await.unwrap();
        assert!(compositor.has_exited());
        assert_eq!(carrier.pid(), None);
    }

    #[test]
    fn toolkits_are_pointed_at_wayland() {
        let env = WaylandCarrier::new(vec!["sway".into()]).session_env();

        assert_eq!(env.get_raw("XDG_SESSION_TYPE").unwrap(), "wayland");
        assert_eq!(env.get_raw("QT_QPA_PLATFORM").unwrap(), "wayland");
    }

    #[tokio::test]
    async fn missing_compositor_fails_to_start() {
        let identity = Passwd.current().unwrap();
        let mut carrier = WaylandCarrier::new(vec!["/nonexistent/compositor".into()]);

        assert!(carrier.start(&identity, &Env::empty()).await.is_err());
        assert_eq!(carrier.pid(), None);
    }
}
