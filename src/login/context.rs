use std::{ffi::OsString, path::PathBuf};

use anyhow::{Result, bail};
use shrinkwraprs::Shrinkwrap;

use crate::environment::prelude::*;

#[derive(Shrinkwrap, Clone, Copy, Debug, PartialEq)]
pub struct VtNumber(u16);

impl From<u16> for VtNumber {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl VtNumber {
    pub fn tty_name(&self) -> String {
        format!("tty{}", self.0)
    }

    pub fn device_path(&self) -> PathBuf {
        PathBuf::from("/dev").join(self.tty_name())
    }
}

impl EnvVar for VtNumber {
    const KEY: &str = "XDG_VTNR";
}
env_parser_auto!(VtNumber);

define_env!("XDG_SEAT", pub Seat(String));
env_parser_auto!(Seat);

impl Default for Seat {
    fn default() -> Self {
        // man sd-login says that seat0 always exists
        Self("seat0".into())
    }
}

// Greeter and lock-screen classes have no use here, a login manager only starts user sessions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionClass {
    User,
}

impl EnvVar for SessionClass {
    const KEY: &str = "XDG_SESSION_CLASS";
}

impl EnvParser for SessionClass {
    fn serialize(&self) -> OsString {
        match self {
            Self::User => "user".into(),
        }
    }

    fn deserialize(value: OsString) -> Result<Self> {
        match value.try_to_string()?.as_str() {
            "user" => Ok(Self::User),
            other => bail!("Unsupported session class {other}"),
        }
    }
}

define_env!("USER", pub User(String));
env_parser_auto!(User);

define_env!("LOGNAME", pub LogName(String));
env_parser_auto!(LogName);

define_env!("PWD", pub WorkingDir(PathBuf));
env_parser_raw!(WorkingDir);

define_env!("XDG_CONFIG_HOME", pub ConfigHome(PathBuf));
env_parser_raw!(ConfigHome);

define_env!("XDG_RUNTIME_DIR", pub RuntimeDir(PathBuf));
env_parser_raw!(RuntimeDir);

define_env!("LANG", pub Lang(String));
env_parser_auto!(Lang);

define_env!("PATH", pub SearchPath(OsString));
env_parser_raw!(SearchPath);

define_env!("XDG_SESSION_DESKTOP", pub SessionDesktop(String));
env_parser_auto!(SessionDesktop);

define_env!("XDG_CURRENT_DESKTOP", pub CurrentDesktop(String));
env_parser_auto!(CurrentDesktop);
