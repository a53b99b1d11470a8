use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use nix::unistd::{self, Gid, Uid};

use crate::environment::{Env, EnvContainer};

pub mod env {
    use std::path::PathBuf;

    use crate::environment::prelude::*;

    define_env!("HOME", pub Home(PathBuf));
    env_parser_raw!(Home);

    define_env!("SHELL", pub Shell(PathBuf));
    env_parser_raw!(Shell);
}

/// A validated local account, as seen after authentication
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub username: String,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// Variables contributed before the session environment is built (e.g. by PAM)
    pub env: Env,
}

impl Identity {
    pub fn is_current(&self) -> bool {
        unistd::geteuid().as_raw() == self.uid
    }
}

impl EnvContainer for &Identity {
    fn apply_as_container(self, env: Env) -> Env {
        env.set((
            env::Home(self.home.clone()),
            env::Shell(self.shell.clone()),
        ))
    }
}

pub trait UserInfoProvider {
    fn query(&self, name: &str) -> Result<Identity>;
}

/// Looks accounts up in the system user database
pub struct Passwd;

impl UserInfoProvider for Passwd {
    fn query(&self, name: &str) -> Result<Identity> {
        let user = unistd::User::from_name(name)
            .with_context(|| format!("Failed to look up user {name}"))?
            .ok_or(anyhow!("User {name} does not exist"))?;

        let c_name = std::ffi::CString::new(user.name.as_str())?;
        let groups = unistd::getgrouplist(&c_name, user.gid)
            .with_context(|| format!("Failed to query groups of {name}"))?;

        Ok(Identity {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            groups: groups.into_iter().map(Gid::as_raw).collect(),
            username: user.name,
            home: user.dir,
            shell: user.shell,
            env: Env::empty(),
        })
    }
}

impl Passwd {
    pub fn current(&self) -> Result<Identity> {
        let user = unistd::User::from_uid(Uid::effective())
            .context("Failed to look up the current user")?
            .ok_or(anyhow!("Current user has no passwd entry"))?;

        self.query(&user.name)
    }
}
