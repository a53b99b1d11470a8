use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Result, anyhow};
use tracing::warn;

use crate::{environment::prelude::*, login::context::VtNumber};

/// Display numbers in [0, DISPLAY_SLOTS) are candidates
pub const DISPLAY_SLOTS: u8 = 32;

define_env!("DISPLAY", pub Display(u8));

impl Display {
    pub fn new(number: u8) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    pub fn local_socket(&self) -> String {
        format!("/tmp/.X11-unix/X{}", self.0)
    }

    pub fn lock_file(&self, lock_dir: &Path) -> PathBuf {
        lock_dir.join(format!(".X{}-lock", self.0))
    }
}

impl fmt::Display for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl EnvParser for Display {
    fn serialize(&self) -> OsString {
        self.to_string().into()
    }

    fn deserialize(value: OsString) -> Result<Self> {
        Ok(Self(
            value
                .try_to_string()?
                .strip_prefix(":")
                .ok_or(anyhow!("display should start with :"))?
                .parse()?,
        ))
    }
}

define_env!("WINDOWPATH", pub WindowPath(String));
env_parser_auto!(WindowPath);

impl WindowPath {
    pub fn previous_plus_vt(env: &Env, vt: VtNumber) -> Self {
        Self(match env.peek::<Self>() {
            Ok(path) => format!("{}:{}", *path, *vt),
            Err(_) => vt.to_string(),
        })
    }
}

pub trait DisplayAllocator {
    fn allocate(&self) -> Display;
}

/// Picks the lowest display without an X lock file.
/// There is no locking against a server starting concurrently.
pub struct LockFileScan {
    lock_dir: PathBuf,
}

impl LockFileScan {
    pub fn new(lock_dir: &Path) -> Self {
        Self {
            lock_dir: lock_dir.to_path_buf(),
        }
    }
}

impl DisplayAllocator for LockFileScan {
    fn allocate(&self) -> Display {
        (0..DISPLAY_SLOTS)
            .map(Display::new)
            .find(|display| !display.lock_file(&self.lock_dir).exists())
            .unwrap_or_else(|| {
                warn!("All {DISPLAY_SLOTS} displays seem taken, falling back to :0");
                Display::new(0)
            })
    }
}
