use std::{cell::Cell, ffi::OsStr, marker::PhantomData};

use anyhow::{Result, bail};
use nix::unistd::{self, Gid, Uid};
use rustix::process::{self, Signal};
use tokio::process::Command;
use tracing::debug;

use crate::{
    environment::{Env, EnvRecipient},
    login::users::Identity,
};

thread_local! {
    // fsuid/fsgid are per-thread attributes on Linux
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Filesystem identity of the calling thread switched to another user.
/// Dropping the guard switches it back.
pub struct FsIdentityGuard {
    previous_uid: Uid,
    previous_gid: Gid,
    // Must not cross an await point or a thread boundary
    _not_send: PhantomData<*const ()>,
}

// Passing an invalid id makes the call fail and report the current value
fn current_fsuid() -> Uid {
    unistd::setfsuid(Uid::from_raw(u32::MAX))
}

fn current_fsgid() -> Gid {
    unistd::setfsgid(Gid::from_raw(u32::MAX))
}

impl FsIdentityGuard {
    pub fn assume(identity: &Identity) -> Result<Self> {
        if ACTIVE.get() {
            bail!("Filesystem identity is already switched on this thread");
        }

        let previous_gid = unistd::setfsgid(Gid::from_raw(identity.gid));
        let previous_uid = unistd::setfsuid(Uid::from_raw(identity.uid));

        let guard = Self {
            previous_uid,
            previous_gid,
            _not_send: PhantomData,
        };
        ACTIVE.set(true);

        if current_fsuid().as_raw() != identity.uid || current_fsgid().as_raw() != identity.gid {
            // guard is dropped here, reverting the partial switch
            bail!(
                "Failed to switch filesystem identity to {}",
                identity.username
            );
        }

        debug!("Filesystem identity switched to {}", identity.username);
        Ok(guard)
    }
}

impl Drop for FsIdentityGuard {
    fn drop(&mut self) {
        unistd::setfsuid(self.previous_uid);
        unistd::setfsgid(self.previous_gid);
        ACTIVE.set(false);
    }
}

/// Runs `f` with the filesystem identity of `identity`.
/// The previous identity is back in place whether `f` succeeds or not.
pub fn assume_identity<T>(identity: &Identity, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = FsIdentityGuard::assume(identity)?;
    f()
}

/// A command that dies with us
pub fn command(program: impl AsRef<OsStr>, env: Env) -> Command {
    let mut cmd = Command::new(program);
    cmd.set_env(env);

    unsafe {
        cmd.pre_exec(|| {
            process::set_parent_process_death_signal(Some(Signal::TERM))?;
            Ok(())
        });
    }

    cmd
}

/// A command that runs with the full credentials of `identity`, from their home directory.
/// It dies with us as well.
pub fn command_as(identity: &Identity, program: impl AsRef<OsStr>, env: Env) -> Command {
    let mut cmd = command(program, env);
    cmd.current_dir(&identity.home);

    // Dropping privileges is only possible (and needed) when we are someone else
    if !identity.is_current() {
        let uid = Uid::from_raw(identity.uid);
        let gid = Gid::from_raw(identity.gid);
        let groups: Vec<Gid> = identity.groups.iter().copied().map(Gid::from_raw).collect();

        unsafe {
            cmd.pre_exec(move || {
                unistd::setgroups(&groups)?;
                unistd::setgid(gid)?;
                unistd::setuid(uid)?;
                // Changing credentials clears the death signal
                process::set_parent_process_death_signal(Some(Signal::TERM))?;
                Ok(())
            });
        }
    }

    cmd
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use anyhow::anyhow;

    use super::*;
    use crate::login::users::{Passwd, UserInfoProvider};

    #[test]
    fn identity_is_restored_when_f_fails() {
        let identity = Passwd.current().unwrap();
        let before = (current_fsuid(), current_fsgid());

        let result: Result<()> = assume_identity(&identity, || Err(anyhow!("boom")));

        assert!(result.is_err());
        assert_eq!((current_fsuid(), current_fsgid()), before);
        assert!(!ACTIVE.get());
    }

    #[test]
    fn nested_guards_are_refused() {
        let identity = Passwd.current().unwrap();

        let outer = FsIdentityGuard::assume(&identity).unwrap();
        assert!(FsIdentityGuard::assume(&identity).is_err());
        drop(outer);

        assert!(FsIdentityGuard::assume(&identity).is_ok());
    }

    #[test]
    fn value_is_passed_through() {
        let identity = Passwd.current().unwrap();

        let value = assume_identity(&identity, || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn command_as_runs_with_the_given_environment() {
        let identity = Passwd.current().unwrap();
        let env = Env::empty().set_raw("KINDLE_MARKER", "present");

        let output = command_as(&identity, "/bin/sh", env)
            .args(["-c", "printf %s \"$KINDLE_MARKER\""])
            .output()
            .await
            .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, b"present");
    }

    #[test]
    fn children_die_with_the_thread_that_spawned_them() {
        // Root exercises the credential switch, anyone else the plain path
        let identity = if unistd::geteuid().is_root() {
            Passwd.query("nobody").unwrap()
        } else {
            Passwd.current().unwrap()
        };

        let pid = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let env = Env::empty().set_raw("PATH", "/usr/bin:/bin");
                let mut cmd = command_as(&identity, "sleep", env);
                cmd.arg("30").current_dir("/");
                cmd.spawn().unwrap().id().unwrap()
            })
        })
        .join()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok();
            // Gone, or a zombie nobody reaped yet
            if stat.is_none_or(|stat| stat.split_whitespace().nth(2) == Some("Z")) {
                break;
            }
            assert!(Instant::now() < deadline, "sleep outlived the thread that spawned it");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
