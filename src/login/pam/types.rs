// Flag values from pam_sys::types, in a form that composes

type Flag = i32;
// Combined flags are just a union
type Flags = Flag;

pub mod flags {
    use super::Flag;

    /// Authentication service should not generate any messages
    pub const SILENT: Flag = 0x8000;

    /// The authentication service should return AUTH_ERROR
    /// if the user has a null authentication token
    pub const DISALLOW_NULL_AUTHTOK: Flag = 0x0001;

    pub(super) const ESTABLISH_CRED: Flag = 0x0002;
    pub(super) const DELETE_CRED: Flag = 0x0004;

    pub const NONE: Flag = 0x0000;
}

#[derive(Debug, Clone, Copy)]
pub enum CredentialsOP {
    // Initialize the credentials for the user.
    Establish,

    // Delete the user's credentials.
    Delete,
}

impl From<CredentialsOP> for Flag {
    fn from(op: CredentialsOP) -> Self {
        match op {
            CredentialsOP::Establish => flags::ESTABLISH_CRED,
            CredentialsOP::Delete => flags::DELETE_CRED,
        }
    }
}

pub struct FlagsBuilder(Flags);

impl FlagsBuilder {
    pub fn new() -> Self {
        Self(flags::NONE)
    }

    pub fn from(value: Flags) -> Self {
        Self(value)
    }

    #[inline]
    pub fn set_if(self, condition: bool, flag: Flag) -> Self {
        if condition { Self(self.0 | flag) } else { self }
    }

    pub fn finish(self) -> Flags {
        self.0
    }
}
