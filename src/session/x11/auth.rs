use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs_err as fs;
use tracing::{debug, warn};

use super::display::Display;
use crate::{
    environment::prelude::*,
    login::{
        context::RuntimeDir, privilege::{assume_identity, command_as}, subprocess::output,
        users::Identity,
    },
    utils::config::Config,
};

pub const AUTHORITY_NAME: &str = ".kindle-xauth";

define_env!("XAUTHORITY", pub XAuthority(PathBuf));
env_parser_raw!(XAuthority);

/// An X authority file holding the cookie of one display
#[derive(Debug)]
pub struct Authority {
    pub(super) path: PathBuf,
    pub(super) cookie: String,
    /// Only a per-session file is removed at the end
    pub(super) owned: bool,
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => Ok(other?),
    }
}

impl Authority {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Picks the authority file for `identity` and clears a stale one.
    /// Nothing is written until [`Authority::write`].
    pub fn prepare(identity: &Identity, env: &Env, config: &Config) -> Result<Self> {
        let (path, owned) = if config.default_xauthority {
            (identity.home.join(".Xauthority"), false)
        } else {
            (env.peek::<RuntimeDir>()?.join(AUTHORITY_NAME), true)
        };

        if owned {
            assume_identity(identity, || remove_if_present(&path))
                .context("Failed to remove stale authority")?;
        }

        Ok(Self {
            path,
            cookie: String::new(),
            owned,
        })
    }

    /// Generates a cookie for `x_display` and stores it, acting as `identity`.
    /// On failure the file is removed again.
    pub async fn write(
        &mut self,
        identity: &Identity,
        env: &Env,
        config: &Config,
        x_display: &Display,
    ) -> Result<()> {
        let env = env.clone().set(XAuthority(self.path.clone()));

        let written: Result<String> = async {
            self.cookie = output(
                "mcookie",
                &mut command_as(identity, &config.mcookie_path, env.clone()),
            )
            .await?;

            output(
                "xauth",
                command_as(identity, &config.xauth_path, env)
                    .arg("-f")
                    .arg(&self.path)
                    .args(["add", &x_display.to_string(), ".", &self.cookie]),
            )
            .await
            .context("Failed to store the display cookie")
        }
        .await;

        if let Err(error) = written {
            if let Err(cleanup) = self.remove() {
                warn!("{cleanup:#}");
            }
            return Err(error);
        }

        debug!("Authority for {x_display} written to {}", self.path.display());
        Ok(())
    }

    /// Safe to call more than once
    pub fn remove(&mut self) -> Result<()> {
        if !self.owned {
            return Ok(());
        }

        remove_if_present(&self.path)
            .with_context(|| format!("Failed to remove authority {}", self.path.display()))?;
        self.owned = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_authority_is_removed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTHORITY_NAME);
        std::fs::write(&path, "cookie").unwrap();

        let mut authority = Authority {
            path: path.clone(),
            cookie: "00".into(),
            owned: true,
        };

        authority.remove().unwrap();
        authority.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn shared_authority_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".Xauthority");
        std::fs::write(&path, "cookie").unwrap();

        let mut authority = Authority {
            path: path.clone(),
            cookie: "00".into(),
            owned: false,
        };

        authority.remove().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn failed_cookie_generation_leaves_nothing_behind() {
        let runtime = tempfile::tempdir().unwrap();
        let identity = crate::login::users::Passwd.current().unwrap();
        let env = Env::empty().set(RuntimeDir(runtime.path().to_path_buf()));
        let config = Config {
            mcookie_path: "/bin/false".into(),
            ..Config::default()
        };

        let stale = runtime.path().join(AUTHORITY_NAME);
        std::fs::write(&stale, "old").unwrap();

        let mut authority = Authority::prepare(&identity, &env, &config).unwrap();
        assert_eq!(authority.path(), stale.as_path());
        assert!(!stale.exists());

        let result = authority.write(&identity, &env, &config, &Display::new(0)).await;

        assert!(result.is_err());
        assert!(!stale.exists());
        authority.remove().unwrap();
    }

    #[test]
    fn shared_authority_is_left_in_place_when_prepared() {
        let home = tempfile::tempdir().unwrap();
        let mut identity = crate::login::users::Passwd.current().unwrap();
        identity.home = home.path().to_path_buf();
        std::fs::write(home.path().join(".Xauthority"), "shared").unwrap();
        let config = Config {
            default_xauthority: true,
            ..Config::default()
        };

        let mut authority = Authority::prepare(&identity, &Env::empty(), &config).unwrap();

        assert_eq!(authority.path(), home.path().join(".Xauthority").as_path());
        authority.remove().unwrap();
        assert!(home.path().join(".Xauthority").exists());
    }
}
