pub mod control;

use std::{
    os::{
        fd::AsFd,
        unix::{ffi::OsStringExt as _, fs::PermissionsExt},
    },
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs_err as fs;
use nix::unistd::{self, Gid, Uid};
use rustix::{
    fs::{Mode, OFlags},
    process::setsid,
    termios,
};
use tracing::{debug, warn};

pub use crate::login::context::VtNumber;
use crate::login::users::Identity;
use control::VTAccessor;

/// Path of the terminal attached to our stdin, if there is one
pub fn current_tty() -> Option<PathBuf> {
    let name = termios::ttyname(std::io::stdin().as_fd(), Vec::new()).ok()?;
    Some(PathBuf::from(std::ffi::OsString::from_vec(name.into_bytes())))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ownership {
    uid: u32,
    gid: u32,
    mode: u32,
}

/// A terminal device temporarily handed to a user.
/// The previous owner and mode come back on `restore`.
#[derive(Debug)]
pub struct TtyLease {
    path: PathBuf,
    previous: Option<Ownership>,
}

impl TtyLease {
    /// The group is kept, so `tty` group members can still write to it
    pub fn lend(path: &Path, identity: &Identity) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = fs::metadata(path)?;
        let previous = Ownership {
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode() & 0o7777,
        };

        unistd::chown(path, Some(Uid::from_raw(identity.uid)), None)
            .with_context(|| format!("Failed to hand {} over to {}", path.display(), identity.username))?;

        let lease = Self {
            path: path.to_path_buf(),
            previous: Some(previous),
        };

        fs::set_permissions(path, PermissionsExt::from_mode(0o620))?;

        debug!("Lent {} to {}", path.display(), identity.username);
        Ok(lease)
    }

    /// Safe to call more than once
    pub fn restore(&mut self) -> Result<()> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };

        unistd::chown(
            &self.path,
            Some(Uid::from_raw(previous.uid)),
            Some(Gid::from_raw(previous.gid)),
        )
        .with_context(|| format!("Failed to restore owner of {}", self.path.display()))?;

        fs::set_permissions(&self.path, PermissionsExt::from_mode(previous.mode))?;

        debug!("Restored {}", self.path.display());
        Ok(())
    }
}

impl Drop for TtyLease {
    fn drop(&mut self) {
        if let Err(error) = self.restore() {
            warn!("{error:#}");
        }
    }
}

/// Makes `/dev/tty<N>` our controlling terminal and switches the console to it
pub fn take_over(number: VtNumber) -> Result<()> {
    let fd = rustix::fs::open(
        number.device_path(),
        OFlags::RDWR | OFlags::NOCTTY,
        Mode::empty(),
    )
    .with_context(|| format!("Failed to open {}", number.tty_name()))?;

    let vt = VTAccessor::from_fd(fd)?;

    if let Err(error) = setsid() {
        // Already a session leader, e.g. when started from a service manager
        debug!("setsid: {error}");
    }

    vt.set_as_controlling_tty()
        .context("Failed to acquire controlling terminal")?;
    vt.bind_stdio().context("Failed to bind stdio")?;

    let previous = vt.get_common_state().map(|state| state.active_number);
    vt.activate(number)
        .with_context(|| format!("Failed to activate {}", number.tty_name()))?;
    vt.clear()?;

    if let Ok(previous) = previous {
        debug!("Switched from tty{previous} to {}", number.tty_name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::login::users::Passwd;

    #[test]
    fn lease_restores_mode_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(file.path(), PermissionsExt::from_mode(0o600)).unwrap();
        let identity = Passwd.current().unwrap();

        let mut lease = TtyLease::lend(file.path(), &identity).unwrap();
        assert_eq!(fs::metadata(file.path()).unwrap().mode() & 0o777, 0o620);

        lease.restore().unwrap();
        lease.restore().unwrap();

        let metadata = fs::metadata(file.path()).unwrap();
        assert_eq!(metadata.mode() & 0o777, 0o600);
        assert_eq!(metadata.uid(), identity.uid);
    }

    #[test]
    fn dropping_a_lease_restores_it() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(file.path(), PermissionsExt::from_mode(0o644)).unwrap();
        let identity = Passwd.current().unwrap();

        drop(TtyLease::lend(file.path(), &identity).unwrap());

        assert_eq!(fs::metadata(file.path()).unwrap().mode() & 0o777, 0o644);
    }

    #[test]
    fn missing_device_cannot_be_lent() {
        let identity = Passwd.current().unwrap();

        assert!(TtyLease::lend(Path::new("/nonexistent/tty63"), &identity).is_err());
    }
}
