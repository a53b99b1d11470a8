use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tokio::process::Command;

use super::{SessionKind, metadata::SessionDefinition};
use crate::{
    environment::Env,
    login::{privilege::command_as, users::Identity},
    utils::config::Config,
};

const LOGIN_SCRIPT: &str = ".xinitrc";

/// `~/.xinitrc`, when an X session may be started through it
pub fn login_script(identity: &Identity, definition: &SessionDefinition, config: &Config) -> Option<PathBuf> {
    if definition.kind != SessionKind::X11 || !config.xinitrc_launch {
        return None;
    }

    Some(identity.home.join(LOGIN_SCRIPT)).filter(|path| path.is_file())
}

/// The words to execute for a session, with launch prefixes applied
pub fn command_line(definition: &SessionDefinition, config: &Config, login_script: Option<&Path>) -> Vec<String> {
    let mut words = definition.exec.clone();
    let mut allow_prefix = definition.allow_prefix;

    if let Some(script) = login_script {
        if allow_prefix && !words.iter().any(|word| word.contains(LOGIN_SCRIPT)) {
            let script = script.to_string_lossy().into_owned();
            words.splice(0..0, ["/bin/sh".to_string(), script]);
            // The script decides how to start the session from here on
            allow_prefix = false;
        }
    }

    if config.dbus_launch && allow_prefix && !words.iter().any(|word| word.contains("dbus-launch")) {
        words.insert(0, config.dbus_launch_path.to_string_lossy().into_owned());
    }

    words
}

pub fn command(identity: &Identity, words: &[String], env: Env) -> Result<Command> {
    let (program, args) = words
        .split_first()
        .ok_or(anyhow!("Session command is empty"))?;

    let mut cmd = command_as(identity, program, env);
    cmd.args(args);
    Ok(cmd)
}
