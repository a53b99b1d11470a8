use std::{
    io::IsTerminal,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
};

use anyhow::{Result, bail};
use rustix::{
    io::{self, write},
    ioctl, stdio,
};

use super::VtNumber;

pub struct VTAccessor(OwnedFd);

impl VTAccessor {
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        if !fd.is_terminal() {
            bail!("descriptor is not a terminal")
        };
        Ok(Self(fd))
    }
}

impl AsFd for VTAccessor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

macro_rules! vt_property {
    ($model:ty, get = $opcode_get:expr) => {
        paste::paste! {
            impl VTAccessor {
                pub fn [<get_ $model:snake>](&self) -> io::Result<$model> {
                    unsafe { ioctl::ioctl(&self.0, ioctl::Getter::<$opcode_get, $model>::new()) }
                }
            }
        }
    };
}

// VT_GETSTATE
#[repr(C)]
pub struct CommonState {
    pub active_number: u16,
    pub signal: u16,
    pub state: u16,
}

vt_property!(CommonState, get = 0x5603);

// VT_ACTIVATE and VT_WAITACTIVE take the console number by value
type IoActivateVT = ioctl::IntegerSetter<0x5606>;
type IoWaitVT = ioctl::IntegerSetter<0x5607>;

impl VTAccessor {
    pub fn activate(&self, number: VtNumber) -> io::Result<()> {
        unsafe {
            ioctl::ioctl(&self.0, IoActivateVT::new_usize(*number as usize))?;
            ioctl::ioctl(&self.0, IoWaitVT::new_usize(*number as usize))?;
        };

        Ok(())
    }
}

// TIOCSCTTY, with force
type IoSetCtty = ioctl::IntegerSetter<0x540E>;

impl VTAccessor {
    pub fn set_as_controlling_tty(&self) -> io::Result<()> {
        unsafe { ioctl::ioctl(&self.0, IoSetCtty::new_usize(1)) }
    }
}

impl VTAccessor {
    pub fn clear(&self) -> io::Result<()> {
        write(&self.0, b"\x1B[H\x1B[2J")?;
        Ok(())
    }

    pub fn bind_stdio(&self) -> io::Result<()> {
        stdio::dup2_stdin(&self.0)?;
        stdio::dup2_stdout(&self.0)?;
        stdio::dup2_stderr(&self.0)?;
        Ok(())
    }
}
