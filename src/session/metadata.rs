use std::{
    collections::BTreeMap,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use freedesktop_entry_parser::Entry;
use fs_err as fs;
use tracing::debug;

use super::SessionKind;
use crate::{
    environment::{Env, EnvContainer},
    login::{
        context::{CurrentDesktop, SessionDesktop},
        privilege::assume_identity,
        users::Identity,
    },
    utils::misc::split_words,
};

pub const USER_DESCRIPTOR: &str = ".kindle";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionDefinition {
    pub name: String,
    pub exec: Vec<String>,
    pub kind: SessionKind,
    /// Whether launch prefixes (login script, session bus) may wrap `exec`
    pub allow_prefix: bool,
}

impl EnvContainer for &SessionDefinition {
    fn apply_as_container(self, env: Env) -> Env {
        env.set((
            SessionDesktop(self.name.clone()),
            CurrentDesktop(self.name.clone()),
            self.kind,
        ))
    }
}

/// Contents of a user's own session descriptor
#[derive(Debug, Default, PartialEq)]
pub struct UserDescriptor {
    /// Absent when the descriptor only sets a locale
    pub definition: Option<SessionDefinition>,
    pub lang: Option<String>,
}

/// `KEY=value` lines; `#` starts a comment and a leading `export ` is ignored
fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let key = key.replace("export ", "").trim().to_uppercase();
            let value = value.split('#').next().unwrap_or_default().trim();
            (key, value.to_string())
        })
        .collect()
}

fn descriptor_from(path: &Path, text: &str, executable: bool) -> UserDescriptor {
    let properties = parse_properties(text);

    let kind = match properties.get("ENVIRONMENT").map(String::as_str) {
        Some("wayland") => SessionKind::Wayland,
        _ => SessionKind::X11,
    };

    let exec = properties.get("EXEC").map(|exec| split_words(exec));
    let definition = match exec {
        Some(exec) if !exec.is_empty() => Some((exec, true)),
        // The descriptor is a launch script in its own right
        _ if executable => Some((vec![path.to_string_lossy().into_owned()], false)),
        _ => None,
    }
    .map(|(exec, allow_prefix)| SessionDefinition {
        name: properties
            .get("NAME")
            .cloned()
            .unwrap_or_else(|| USER_DESCRIPTOR.trim_start_matches('.').to_string()),
        exec,
        kind,
        allow_prefix,
    });

    UserDescriptor {
        definition,
        lang: properties.get("LANG").filter(|lang| !lang.is_empty()).cloned(),
    }
}

/// Reads `~/.kindle` with the user's filesystem identity
pub fn user_descriptor(identity: &Identity) -> Result<UserDescriptor> {
    let path = identity.home.join(USER_DESCRIPTOR);

    assume_identity(identity, || {
        let text = match fs::read_to_string(&path) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(UserDescriptor::default()),
            other => other,
        }?;
        let executable = fs::metadata(&path)?.permissions().mode() & 0o100 != 0;

        debug!("Using session descriptor {}", path.display());
        Ok(descriptor_from(&path, &text, executable))
    })
}

/// Directories with system session entries, searched in order
pub struct SessionDirs(pub Vec<(PathBuf, SessionKind)>);

impl Default for SessionDirs {
    fn default() -> Self {
        Self(vec![
            ("/usr/share/wayland-sessions".into(), SessionKind::Wayland),
            ("/usr/share/xsessions".into(), SessionKind::X11),
        ])
    }
}

fn parse_desktop_entry(bytes: Vec<u8>, kind: SessionKind, fallback_name: &str) -> Result<SessionDefinition> {
    let entry = Entry::parse(bytes)?;
    let section = entry.section("Desktop Entry");

    let exec: Vec<String> = split_words(
        section
            .attr("Exec")
            .ok_or(anyhow!("Session does not define an executable"))?,
    )
    .into_iter()
    // Field codes make no sense without files to open
    .filter(|word| !word.starts_with('%'))
    .collect();

    if exec.is_empty() {
        return Err(anyhow!("Session executable is empty"));
    }

    Ok(SessionDefinition {
        name: section.attr("Name").unwrap_or(fallback_name).to_string(),
        exec,
        kind,
        allow_prefix: true,
    })
}

impl SessionDirs {
    pub fn lookup(&self, id: &str) -> Result<SessionDefinition> {
        for (dir, kind) in &self.0 {
            let path = dir.join(format!("{id}.desktop"));

            let bytes = match fs::read(&path) {
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                other => other,
            }?;

            return parse_desktop_entry(bytes, *kind, id)
                .with_context(|| format!("Session definition {} is incorrect", path.display()));
        }

        Err(anyhow!("Session {id} is not defined"))
    }

    /// Every parseable entry, by id. Broken entries are skipped.
    pub fn all(&self) -> BTreeMap<String, SessionDefinition> {
        let mut sessions = BTreeMap::new();

        for (dir, kind) in &self.0 {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                let Some(id) = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.strip_suffix(".desktop"))
                else {
                    continue;
                };

                if let Ok(definition) = fs::read(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| parse_desktop_entry(bytes, *kind, id))
                {
                    // Earlier directories win
                    sessions.entry(id.to_string()).or_insert(definition);
                }
            }
        }

        sessions
    }
}

/// The session to start for `identity`, and the locale it asks for
pub fn resolve(
    identity: &Identity,
    requested: Option<&str>,
    dirs: &SessionDirs,
) -> Result<(SessionDefinition, Option<String>)> {
    let descriptor = user_descriptor(identity).context("Failed to read session descriptor")?;

    let definition = match descriptor.definition {
        Some(definition) => definition,
        None => {
            let id = requested.ok_or(anyhow!(
                "No session configured. Set default_session or create ~/{USER_DESCRIPTOR}"
            ))?;
            dirs.lookup(id)?
        }
    };

    Ok((definition, descriptor.lang))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::users::Passwd;

    #[test]
    fn properties_ignore_comments_and_export() {
        let properties = parse_properties(
            "# my session\nexport Exec=/usr/bin/sway # the compositor\nEnvironment = wayland\n",
        );

        assert_eq!(properties["EXEC"], "/usr/bin/sway");
        assert_eq!(properties["ENVIRONMENT"], "wayland");
        assert_eq!(properties.len(), 2);
    }

    #[test]
    fn wayland_descriptor_is_recognised() {
        let descriptor = descriptor_from(
            Path::new("/home/a/.kindle"),
            "Name=Sway\nExec=sway --unsupported-gpu\nEnvironment=wayland\nLang=cs_CZ.UTF-8\n",
            false,
        );

        let definition = descriptor.definition.unwrap();
        assert_eq!(definition.kind, SessionKind::Wayland);
        assert_eq!(definition.exec, ["sway", "--unsupported-gpu"]);
        assert!(definition.allow_prefix);
        assert_eq!(descriptor.lang.as_deref(), Some("cs_CZ.UTF-8"));
    }

    #[test]
    fn executable_descriptor_runs_itself_without_prefixes() {
        let descriptor = descriptor_from(Path::new("/home/a/.kindle"), "#!/bin/sh\nexec i3\n", true);

        let definition = descriptor.definition.unwrap();
        assert_eq!(definition.kind, SessionKind::X11);
        assert_eq!(definition.exec, ["/home/a/.kindle"]);
        assert!(!definition.allow_prefix);
    }

    #[test]
    fn locale_only_descriptor_has_no_definition() {
        let descriptor = descriptor_from(Path::new("/home/a/.kindle"), "Lang=de_DE.UTF-8\n", false);

        assert!(descriptor.definition.is_none());
        assert_eq!(descriptor.lang.as_deref(), Some("de_DE.UTF-8"));
    }

    fn session_dirs() -> (tempfile::TempDir, SessionDirs) {
        let root = tempfile::tempdir().unwrap();
        let wayland = root.path().join("wayland-sessions");
        let x11 = root.path().join("xsessions");
        fs::create_dir(&wayland).unwrap();
        fs::create_dir(&x11).unwrap();

        fs::write(
            wayland.join("sway.desktop"),
            "[Desktop Entry]\nName=Sway\nExec=sway\nType=Application\n",
        )
        .unwrap();
        fs::write(
            x11.join("sway.desktop"),
            "[Desktop Entry]\nName=Sway on X\nExec=sway-x\n",
        )
        .unwrap();
        fs::write(
            x11.join("i3.desktop"),
            "[Desktop Entry]\nName=i3\nExec=i3 %U\n",
        )
        .unwrap();
        fs::write(x11.join("broken.desktop"), "[Desktop Entry]\nName=Broken\n").unwrap();

        let dirs = SessionDirs(vec![(wayland, SessionKind::Wayland), (x11, SessionKind::X11)]);
        (root, dirs)
    }

    #[test]
    fn wayland_entries_take_precedence() {
        let (_root, dirs) = session_dirs();

        let sway = dirs.lookup("sway").unwrap();
        assert_eq!(sway.kind, SessionKind::Wayland);
        assert_eq!(sway.name, "Sway");

        let i3 = dirs.lookup("i3").unwrap();
        assert_eq!(i3.kind, SessionKind::X11);
        assert_eq!(i3.exec, ["i3"]);
    }

    #[test]
    fn missing_and_broken_entries_are_errors() {
        let (_root, dirs) = session_dirs();

        assert!(dirs.lookup("gnome").is_err());
        assert!(dirs.lookup("broken").is_err());
    }

    #[test]
    fn listing_skips_broken_entries() {
        let (_root, dirs) = session_dirs();
        let all = dirs.all();

        assert_eq!(all.keys().collect::<Vec<_>>(), ["i3", "sway"]);
        assert_eq!(all["sway"].kind, SessionKind::Wayland);
    }

    #[test]
    fn definition_exports_desktop_variables() {
        let (_root, dirs) = session_dirs();
        let env = Env::empty().set(&dirs.lookup("i3").unwrap());

        assert_eq!(env.get_raw("XDG_SESSION_DESKTOP").unwrap(), "i3");
        assert_eq!(env.get_raw("XDG_CURRENT_DESKTOP").unwrap(), "i3");
        assert_eq!(env.get_raw("XDG_SESSION_TYPE").unwrap(), "x11");
    }

    #[test]
    fn requested_session_is_used_without_descriptor() {
        let (_root, dirs) = session_dirs();
        let home = tempfile::tempdir().unwrap();
        let mut identity = Passwd.current().unwrap();
        identity.home = home.path().to_path_buf();

        let (definition, lang) = resolve(&identity, Some("i3"), &dirs).unwrap();
        assert_eq!(definition.name, "i3");
        assert!(lang.is_none());

        assert!(resolve(&identity, None, &dirs).is_err());
    }

    #[test]
    fn descriptor_overrides_requested_session() {
        let (_root, dirs) = session_dirs();
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join(USER_DESCRIPTOR), "Exec=openbox\n").unwrap();
        let mut identity = Passwd.current().unwrap();
        identity.home = home.path().to_path_buf();

        let (definition, _) = resolve(&identity, Some("i3"), &dirs).unwrap();

        assert_eq!(definition.exec, ["openbox"]);
        assert_eq!(definition.kind, SessionKind::X11);
    }
}
