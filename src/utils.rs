pub mod misc {
    use std::{ffi::OsString, io};

    pub trait OsStringExt {
        fn try_to_string(self) -> io::Result<String>;
    }

    impl OsStringExt for OsString {
        fn try_to_string(self) -> io::Result<String> {
            self.into_string().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "String is not valid unicode (UTF-8)",
                )
            })
        }
    }

    /// Splits a command line on whitespace. No quoting rules apply.
    pub fn split_words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_owned).collect()
    }
}

pub mod config {
    use std::{
        convert::Infallible,
        io::{ErrorKind, Read},
        path::{Path, PathBuf},
    };

    use anyhow::{Context, Result};
    use fs_err::File;
    use pico_args::Arguments;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone)]
    #[serde(default, deny_unknown_fields)]
    pub struct Config {
        /// Virtual terminal the session runs on
        pub tty: u16,
        pub lang: String,

        pub daemon_mode: bool,
        pub autologin: Option<String>,
        pub default_session: Option<String>,
        pub pam_service: String,

        pub xinitrc_launch: bool,
        pub dbus_launch: bool,
        pub rootless_xorg: bool,
        pub default_xauthority: bool,
        pub xorg_args: String,

        pub xorg_path: PathBuf,
        pub mcookie_path: PathBuf,
        pub xauth_path: PathBuf,
        pub dbus_launch_path: PathBuf,

        pub runtime_dir_base: PathBuf,
        pub lock_dir: PathBuf,

        /// Overrides the PATH given to the session
        pub path: Option<String>,
        pub log_path: Option<PathBuf>,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                tty: 7,
                lang: "en_US.UTF-8".into(),
                daemon_mode: false,
                autologin: None,
                default_session: None,
                pam_service: "kindle".into(),
                xinitrc_launch: false,
                dbus_launch: true,
                rootless_xorg: false,
                default_xauthority: false,
                xorg_args: String::new(),
                xorg_path: "/usr/bin/Xorg".into(),
                mcookie_path: "/usr/bin/mcookie".into(),
                xauth_path: "/usr/bin/xauth".into(),
                dbus_launch_path: "/usr/bin/dbus-launch".into(),
                runtime_dir_base: "/run/user".into(),
                lock_dir: "/tmp".into(),
                path: None,
                log_path: None,
            }
        }
    }

    impl Config {
        pub fn from_args(args: &mut Arguments, default_path: &str) -> Result<Self> {
            let config_path = args
                .opt_value_from_os_str::<_, _, Infallible>(["-c", "--config"], |path| {
                    Ok(PathBuf::from(path))
                })?
                .unwrap_or(PathBuf::from(default_path));

            Self::from_file(&config_path).context("Failed to read config")
        }

        pub fn from_file(path: &Path) -> Result<Self> {
            let mut file = match File::open(path) {
                Err(e) if matches!(e.kind(), ErrorKind::NotFound) => return Ok(Self::default()),
                other => other,
            }?;

            let mut buf = String::new();
            file.read_to_string(&mut buf)?;

            toml::from_str(&buf).context("Invalid config")
        }
    }

}
