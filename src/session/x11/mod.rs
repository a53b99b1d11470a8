pub mod auth;
pub mod connection;
pub mod display;

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rustix::process::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{Carrier, SessionKind};
use crate::{
    environment::{self, prelude::*},
    login::{
        context::VtNumber,
        privilege::{command, command_as},
        subprocess::ProcessHandle,
        tty::{TtyLease, current_tty},
        users::Identity,
    },
    utils::{config::Config, misc::split_words},
};
use auth::{Authority, XAuthority};
use connection::DisplayConnector;
use display::{Display, DisplayAllocator, WindowPath};

const HANDSHAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the X server may run as the logged in user.
/// Without a session manager handing out the VT, that only works from the VT itself.
pub fn rootless_allowed(config: &Config, caller_tty: Option<&Path>, vt: VtNumber) -> bool {
    config.rootless_xorg && (config.daemon_mode || caller_tty == Some(vt.device_path().as_path()))
}

pub fn server_args(config: &Config, vt: VtNumber, display: &Display, rootless: bool) -> Vec<String> {
    let mut args = vec![format!("vt{}", *vt), display.to_string()];
    if rootless {
        args.push("-keeptty".into());
    }
    args.extend(split_words(&config.xorg_args));
    args
}

/// Resources held for one X display. Released once the server is gone.
#[derive(Debug)]
pub struct XorgLease {
    display: Display,
    authority: Authority,
    tty: Option<TtyLease>,
}

impl XorgLease {
    fn release(&mut self) -> Result<()> {
        let tty = match &mut self.tty {
            Some(tty) => tty.restore(),
            None => Ok(()),
        };
        let authority = self.authority.remove();

        tty.and(authority)
    }
}

fn watch_stderr(server: &ProcessHandle) {
    let Some(stderr) = server.take_stderr() else {
        return;
    };

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "xorg", "{line}");
        }
    });
}

pub struct XorgCarrier {
    config: Config,
    allocator: Box<dyn DisplayAllocator>,
    caller_tty: Option<PathBuf>,

    server: Option<ProcessHandle>,
    lease: Option<XorgLease>,
    connector: DisplayConnector,
    window_path: Option<WindowPath>,
}

impl XorgCarrier {
    pub fn new(config: Config, allocator: Box<dyn DisplayAllocator>) -> Self {
        Self {
            config,
            allocator,
            caller_tty: current_tty(),
            server: None,
            lease: None,
            connector: DisplayConnector::new(),
            window_path: None,
        }
    }

    fn display_env(&self) -> Env {
        match &self.lease {
            Some(lease) => Env::empty().set((
                lease.display.clone(),
                XAuthority(lease.authority.path().to_path_buf()),
            )),
            None => Env::empty(),
        }
    }

    async fn handshake(&mut self, server: &ProcessHandle) -> Result<()> {
        let Some(lease) = &self.lease else {
            bail!("X server started without a display lease");
        };

        loop {
            if let Some(status) = server.try_status()? {
                bail!("X server exited with {status} before accepting connections");
            }

            match self.connector.open(&lease.display, lease.authority.cookie()) {
                Ok(()) => return Ok(()),
                Err(error) => debug!("{error}, retrying"),
            }

            tokio::time::sleep(HANDSHAKE_INTERVAL).await;
        }
    }

    async fn launch(&mut self, identity: &Identity, env: &Env) -> Result<ProcessHandle> {
        let vt = VtNumber::from(self.config.tty);
        let x_display = self.allocator.allocate();
        debug!("Allocated display {x_display}");

        let authority =
            Authority::prepare(identity, env, &self.config).context("Failed to set up X authority")?;

        // Leased before anything is written
        let lease = self.lease.insert(XorgLease {
            display: x_display.clone(),
            authority,
            tty: None,
        });
        lease
            .authority
            .write(identity, env, &self.config, &x_display)
            .await
            .context("Failed to set up X authority")?;

        let rootless = rootless_allowed(&self.config, self.caller_tty.as_deref(), vt);
        let args = server_args(&self.config, vt, &x_display, rootless);

        let mut cmd = if rootless {
            lease.tty = Some(TtyLease::lend(&vt.device_path(), identity)?);
            command_as(identity, &self.config.xorg_path, env.clone().merge(self.display_env()))
        } else {
            command(
                &self.config.xorg_path,
                environment::current().merge(self.display_env()),
            )
        };

        cmd.args(&args).stdin(Stdio::null()).stderr(Stdio::piped());

        info!(
            "Starting X server on {x_display} ({})",
            if rootless { "rootless" } else { "as root" }
        );
        let server = ProcessHandle::spawn("Xorg", &mut cmd)?;
        self.server = Some(server.clone());
        watch_stderr(&server);

        self.window_path = Some(WindowPath::previous_plus_vt(&environment::current(), vt));

        Ok(server)
    }
}

#[async_trait(?Send)]
impl Carrier for XorgCarrier {
    fn kind(&self) -> SessionKind {
        SessionKind::X11
    }

    async fn start(&mut self, identity: &Identity, env: &Env) -> Result<ProcessHandle> {
        let server = match self.launch(identity, env).await {
            Ok(server) => server,
            Err(error) => {
                if let Err(cleanup) = self.stop().await {
                    warn!("{cleanup:#}");
                }
                return Err(error);
            }
        };

        if let Err(error) = self.handshake(&server).await {
            if let Err(cleanup) = self.stop().await {
                warn!("{cleanup:#}");
            }
            return Err(error.context("X server did not become ready"));
        }

        info!("X server is ready");
        Ok(server)
    }

    async fn stop(&mut self) -> Result<()> {
        self.connector.close();

        let server = match self.server.take() {
            Some(server) => server.interrupt_and_wait().await.map(|_| ()),
            None => Ok(()),
        };

        // The lease outlives the server, whatever happened to it
        let lease = match self.lease.take() {
            Some(mut lease) => lease.release(),
            None => Ok(()),
        };

        server.and(lease)
    }

    fn pid(&self) -> Option<Pid> {
        self.server.as_ref().map(ProcessHandle::pid)
    }

    fn session_env(&self) -> Env {
        let env = self.display_env().set(SessionKind::X11);

        match &self.window_path {
            Some(window_path) => env.set(window_path.clone()),
            None => env,
        }
    }

    fn record_display(&self) -> String {
        self.lease
            .as_ref()
            .map(|lease| lease.display.to_string())
            .unwrap_or_default()
    }

    fn hosts_client(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use tokio::process::Command;

    use super::*;
    use crate::login::users::Passwd;

    struct Fixed(u8);

    impl DisplayAllocator for Fixed {
        fn allocate(&self) -> Display {
            Display::new(self.0)
        }
    }

    fn config(rootless_xorg: bool, daemon_mode: bool) -> Config {
        Config {
            rootless_xorg,
            daemon_mode,
            ..Config::default()
        }
    }

    #[test]
    fn rootless_needs_permission_and_the_right_terminal() {
        let vt = VtNumber::from(7);
        let on_vt = Some(Path::new("/dev/tty7"));
        let elsewhere = Some(Path::new("/dev/pts/3"));

        assert!(!rootless_allowed(&config(false, false), on_vt, vt));
        assert!(!rootless_allowed(&config(false, true), on_vt, vt));
        assert!(!rootless_allowed(&config(true, false), elsewhere, vt));
        assert!(!rootless_allowed(&config(true, false), None, vt));
        assert!(rootless_allowed(&config(true, false), on_vt, vt));
        assert!(rootless_allowed(&config(true, true), elsewhere, vt));
        assert!(rootless_allowed(&config(true, true), None, vt));
    }

    #[test]
    fn operator_arguments_come_last() {
        let config = Config {
            xorg_args: "-nolisten tcp".into(),
            ..Config::default()
        };

        assert_eq!(
            server_args(&config, VtNumber::from(2), &Display::new(1), true),
            ["vt2", ":1", "-keeptty", "-nolisten", "tcp"]
        );
        assert_eq!(
            server_args(&config, VtNumber::from(2), &Display::new(1), false),
            ["vt2", ":1", "-nolisten", "tcp"]
        );
    }

    #[tokio::test]
    async fn stop_twice_releases_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Passwd.current().unwrap();

        let authority_path = dir.path().join(auth::AUTHORITY_NAME);
        std::fs::write(&authority_path, "cookie").unwrap();

        let tty_path = dir.path().join("tty7");
        std::fs::write(&tty_path, "").unwrap();
        std::fs::set_permissions(&tty_path, PermissionsExt::from_mode(0o600)).unwrap();

        let server = ProcessHandle::spawn("Xorg", Command::new("sleep").arg("30")).unwrap();

        let mut carrier = XorgCarrier::new(Config::default(), Box::new(Fixed(5)));
        carrier.server = Some(server.clone());
        carrier.lease = Some(XorgLease {
            display: Display::new(5),
            authority: Authority {
                path: authority_path.clone(),
                cookie: "00".into(),
                owned: true,
            },
            tty: Some(TtyLease::lend(&tty_path, &identity).unwrap()),
        });

        assert_eq!(carrier.record_display(), ":5");
        assert_eq!(carrier.pid(), Some(server.pid()));
        let env = carrier.session_env();
        assert_eq!(env.get_raw("DISPLAY").unwrap(), ":5");
        assert_eq!(env.get_raw("XDG_SESSION_TYPE").unwrap(), "x11");

        carrier.stop().await.unwrap();
        carrier.stop().await.unwrap();

        assert!(server.has_exited());
        assert!(!authority_path.exists());
        assert_eq!(std::fs::metadata(&tty_path).unwrap().mode() & 0o777, 0o600);
        assert_eq!(carrier.pid(), None);
        assert_eq!(carrier.record_display(), "");
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let mut carrier = XorgCarrier::new(Config::default(), Box::new(Fixed(0)));

        carrier.stop().await.unwrap();
        assert!(carrier.session_env().get_raw("DISPLAY").is_none());
    }

    #[tokio::test]
    async fn abandoned_start_still_removes_the_authority() {
        let runtime = tempfile::tempdir().unwrap();
        let identity = Passwd.current().unwrap();

        // A cookie generator that is still busy when the start is abandoned
        let mcookie = runtime.path().join("slow-mcookie");
        std::fs::write(&mcookie, "#!/bin/sh\ntouch \"$XAUTHORITY\"\nsleep 5\n").unwrap();
        std::fs::set_permissions(&mcookie, PermissionsExt::from_mode(0o755)).unwrap();

        let env = Env::empty()
            .set(crate::login::context::RuntimeDir(runtime.path().to_path_buf()))
            .set_raw("PATH", "/usr/bin:/bin");
        let config = Config {
            mcookie_path: mcookie,
            ..Config::default()
        };
        let authority_path = runtime.path().join(auth::AUTHORITY_NAME);

        let mut carrier = XorgCarrier::new(config, Box::new(Fixed(0)));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(500), carrier.start(&identity, &env)).await;
        assert!(abandoned.is_err());
        assert!(authority_path.exists());

        carrier.stop().await.unwrap();
        assert!(!authority_path.exists());
        assert_eq!(carrier.record_display(), "");
    }

    #[tokio::test]
    async fn failed_authority_setup_starts_no_server() {
        let runtime = tempfile::tempdir().unwrap();
        let identity = Passwd.current().unwrap();
        let env = Env::empty().set(crate::login::context::RuntimeDir(runtime.path().to_path_buf()));
        let config = Config {
            mcookie_path: "/bin/false".into(),
            xorg_path: "/nonexistent/Xorg".into(),
            ..Config::default()
        };

        let mut carrier = XorgCarrier::new(config, Box::new(Fixed(0)));
        let result = carrier.start(&identity, &env).await;

        assert!(result.is_err());
        assert_eq!(carrier.pid(), None);
        assert!(!runtime.path().join(auth::AUTHORITY_NAME).exists());
    }
}
