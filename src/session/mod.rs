pub mod client;
pub mod metadata;
pub mod wayland;
pub mod x11;

use std::ffi::OsString;

use anyhow::{Result, bail};
use async_trait::async_trait;
use rustix::process::Pid;

use crate::{
    environment::prelude::*,
    login::{subprocess::ProcessHandle, users::Identity},
    utils::config::Config,
};
use metadata::SessionDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    X11,
    Wayland,
}

impl EnvVar for SessionKind {
    const KEY: &str = "XDG_SESSION_TYPE";
}

impl EnvParser for SessionKind {
    fn serialize(&self) -> OsString {
        match self {
            Self::X11 => "x11".into(),
            Self::Wayland => "wayland".into(),
        }
    }

    fn deserialize(value: OsString) -> Result<Self> {
        match value.try_to_string()?.as_str() {
            "x11" => Ok(Self::X11),
            "wayland" => Ok(Self::Wayland),
            other => bail!("Unknown session type {other}"),
        }
    }
}

/// The process that provides the graphical environment a session runs in.
///
/// `stop` has to be safe to call at any point after construction, including
/// after a `start` that failed or was abandoned halfway, and more than once.
#[async_trait(?Send)]
pub trait Carrier {
    fn kind(&self) -> SessionKind;

    async fn start(&mut self, identity: &Identity, env: &Env) -> Result<ProcessHandle>;

    async fn stop(&mut self) -> Result<()>;

    /// None when the carrier is not running
    fn pid(&self) -> Option<Pid>;

    /// Variables the session client needs to reach the carrier
    fn session_env(&self) -> Env;

    /// Display identifier for the accounting record
    fn record_display(&self) -> String;

    /// Whether the carrier process is itself the session client
    fn hosts_client(&self) -> bool;
}

pub trait CarrierFactory {
    fn carrier(&self, definition: &SessionDefinition) -> Box<dyn Carrier>;
}

/// Builds the carrier matching a session definition
pub struct Carriers<'a> {
    pub config: &'a Config,
}

impl CarrierFactory for Carriers<'_> {
    fn carrier(&self, definition: &SessionDefinition) -> Box<dyn Carrier> {
        match definition.kind {
            SessionKind::X11 => Box::new(x11::XorgCarrier::new(
                self.config.clone(),
                Box::new(x11::display::LockFileScan::new(&self.config.lock_dir)),
            )),
            SessionKind::Wayland => Box::new(wayland::WaylandCarrier::new(
                client::command_line(definition, self.config, None),
            )),
        }
    }
}
