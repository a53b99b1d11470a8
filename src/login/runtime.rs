use std::{fs, os::unix::fs::DirBuilderExt, path::Path};

use anyhow::{Context, Result};
use nix::unistd::{self, Gid, Uid};
use tracing::debug;

use crate::{
    environment::{self, Env},
    login::{
        context::{
            ConfigHome, Lang, LogName, RuntimeDir, SearchPath, Seat, SessionClass, User, VtNumber,
            WorkingDir,
        },
        users::Identity,
    },
    utils::config::Config,
};

const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/bin";

fn search_path(config: &Config) -> SearchPath {
    if let Some(path) = &config.path {
        return SearchPath(path.into());
    }

    environment::current()
        .peek::<SearchPath>()
        .unwrap_or(SearchPath(FALLBACK_PATH.into()))
}

/// Session environment for `identity`, with its runtime directory in place.
/// Variables already exported for the identity (e.g. by PAM) take precedence.
pub fn build_environment(identity: &Identity, config: &Config, lang: &str) -> Result<Env> {
    let runtime_dir = config.runtime_dir_base.join(identity.uid.to_string());

    let env = Env::empty()
        .set(identity)
        .set((
            WorkingDir(identity.home.clone()),
            User(identity.username.clone()),
            LogName(identity.username.clone()),
            ConfigHome(identity.home.join(".config")),
            RuntimeDir(runtime_dir),
            Seat::default(),
            SessionClass::User,
            VtNumber::from(config.tty),
        ))
        .set((Lang(lang.to_string()), search_path(config)))
        .merge(identity.env.clone());

    let runtime_dir = env.peek::<RuntimeDir>()?;
    create_runtime_dir(&runtime_dir, identity)?;

    Ok(env)
}

fn create_runtime_dir(path: &Path, identity: &Identity) -> Result<()> {
    fs::DirBuilder::new()
        .mode(0o700)
        .recursive(true)
        .create(path)
        .with_context(|| format!("Failed to create runtime directory {}", path.display()))?;

    unistd::chown(
        path,
        Some(Uid::from_raw(identity.uid)),
        Some(Gid::from_raw(identity.gid)),
    )
    .with_context(|| format!("Failed to hand {} over to {}", path.display(), identity.username))?;

    debug!("Runtime directory {} ready", path.display());
    Ok(())
}
