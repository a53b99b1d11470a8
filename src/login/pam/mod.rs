mod converse;
pub use converse::{Console, PamDisplay};

mod types;
pub use types::CredentialsOP;
use types::{FlagsBuilder, flags};

use anyhow::{Context, Result, anyhow, bail};
use pam_sys::{PamConversation, PamHandle, PamItemType, PamReturnCode};
use tracing::{debug, warn};

use std::{
    ffi::{CStr, CString, OsString, c_void},
    os::{raw::c_char, unix::ffi::OsStringExt},
    ptr,
};

use converse::PamConversationHandler;

use crate::environment::Env;

/// An open PAM transaction. Ended on drop if [`Pam::end`] was not called.
pub struct Pam {
    handle: *mut PamHandle,
    last_code: PamReturnCode,

    // PAM keeps pointers to both for the whole transaction
    _conversation: Box<PamConversation>,
    _handler: Box<PamConversationHandler>,

    silent: bool,
    ended: bool,
}

// The handle is only ever used by one thread at a time, which is all PAM asks for
unsafe impl Send for Pam {}

// NOTE: we are using the raw api, since the flag definitions in pam_sys::wrapped are too inflexible
macro_rules! pam_call {
    (let $ret:ident = $self:ident.$method:ident( $($args:tt)* )) => {
        let code = PamReturnCode::from(
            unsafe { pam_sys::raw::$method($self.handle, $($args)* ) }
        );

        let $ret = $self.handle_ret(code, stringify!($method));
    };
}

impl Pam {
    pub fn start(
        service_name: &str,
        display: impl PamDisplay + 'static,

        // If None, PAM will query for it via prompt() on PamDisplay
        username: Option<&str>,

        silent: bool,
    ) -> Result<Self> {
        let service = CString::new(service_name).context("Invalid PAM service name")?;
        let username = username
            .map(CString::new)
            .transpose()
            .context("Invalid username")?;

        let mut handler = PamConversationHandler::with_display(display);
        let conversation = Box::new(handler.conversation());

        let mut handle: *mut PamHandle = ptr::null_mut();
        let code = PamReturnCode::from(unsafe {
            pam_sys::raw::pam_start(
                service.as_ptr(),
                username.as_ref().map_or(ptr::null(), |name| name.as_ptr()),
                &*conversation,
                &mut handle as *mut *mut PamHandle as *mut *const PamHandle,
            )
        });

        match code {
            PamReturnCode::SUCCESS if !handle.is_null() => {
                debug!("Started PAM transaction for service {service_name}");
                Ok(Self {
                    handle,
                    last_code: PamReturnCode::SUCCESS,
                    _conversation: conversation,
                    _handler: handler,
                    silent,
                    ended: false,
                })
            }
            PamReturnCode::SUCCESS => bail!("pam_start returned no handle"),
            err => bail!("pam error at `pam_start`: {err}"),
        }
    }

    fn handle_ret(&mut self, ret: PamReturnCode, fn_name: &str) -> Result<()> {
        self.last_code = ret;
        match self.last_code {
            PamReturnCode::SUCCESS => Ok(()),
            err => Err(anyhow!("pam error at `{fn_name}`: {err}")),
        }
    }

    fn base_flags(&self) -> FlagsBuilder {
        FlagsBuilder::new().set_if(self.silent, flags::SILENT)
    }

    pub fn authenticate(&mut self, require_auth_token: bool) -> Result<()> {
        let flags = self
            .base_flags()
            .set_if(require_auth_token, flags::DISALLOW_NULL_AUTHTOK)
            .finish();

        pam_call!(let ret = self.pam_authenticate(flags));
        ret
    }

    pub fn assert_account_is_valid(&mut self, require_auth_token: bool) -> Result<()> {
        let flags = self
            .base_flags()
            .set_if(require_auth_token, flags::DISALLOW_NULL_AUTHTOK)
            .finish();

        pam_call!(let ret = self.pam_acct_mgmt(flags));
        ret
    }

    pub fn credentials(&mut self, op: CredentialsOP) -> Result<()> {
        let flags = FlagsBuilder::from(op.into())
            .set_if(self.silent, flags::SILENT)
            .finish();

        pam_call!(let ret = self.pam_setcred(flags));
        ret
    }

    pub fn open_session(&mut self) -> Result<()> {
        let flags = self.base_flags().finish();

        pam_call!(let ret = self.pam_open_session(flags));
        ret
    }

    pub fn close_session(&mut self) -> Result<()> {
        let flags = self.base_flags().finish();

        pam_call!(let ret = self.pam_close_session(flags));
        ret
    }

    pub fn set_item(&mut self, item: PamItemType, value: &str) -> Result<()> {
        let s = CString::new(value).with_context(|| format!("Invalid PAM item value {value:?}"))?;
        pam_call!(let ret = self.pam_set_item(item as i32, s.as_ptr() as *const c_void));
        ret
    }

    /// The name PAM settled on, which modules are free to rewrite
    pub fn get_username(&mut self) -> Result<String> {
        let mut p: *const c_char = ptr::null();
        pam_call!(let ret = self.pam_get_user(&mut p, ptr::null()));
        ret?;

        if p.is_null() {
            bail!("PAM did not report a username");
        }
        Ok(unsafe { CStr::from_ptr(p) }
            .to_str()
            .context("Username is not valid unicode")?
            .to_string())
    }

    pub fn put_env(&mut self, env: &Env) -> Result<()> {
        for pair in env.to_vec() {
            let pair = CString::new(pair.into_vec()).context("Environment contains a NUL byte")?;
            pam_call!(let ret = self.pam_putenv(pair.as_ptr()));
            ret?;
        }
        Ok(())
    }

    /// Everything PAM modules exported into the transaction
    pub fn get_env(&mut self) -> Result<Env> {
        let list = unsafe { pam_sys::raw::pam_getenvlist(self.handle) };
        if list.is_null() {
            bail!("pam_getenvlist failed");
        }

        let mut values = Vec::new();
        let mut cursor = list;
        unsafe {
            while !(*cursor).is_null() {
                let pair = CStr::from_ptr(*cursor).to_bytes();
                if let Some(split) = pair.iter().position(|b| *b == b'=') {
                    match String::from_utf8(pair[..split].to_vec()) {
                        Ok(key) => values.push((key, OsString::from_vec(pair[split + 1..].to_vec()))),
                        Err(_) => warn!("Ignoring PAM variable with a non-unicode name"),
                    }
                }

                libc::free(*cursor as *mut c_void);
                cursor = cursor.add(1);
            }
            libc::free(list as *mut c_void);
        }

        Ok(Env::from_values(values))
    }

    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        let status = self.last_code as i32;
        pam_call!(let ret = self.pam_end(status));
        ret
    }
}

impl Drop for Pam {
    fn drop(&mut self) {
        if !self.ended {
            self.ended = true;
            let status = self.last_code as i32;
            pam_call!(let ret = self.pam_end(status));
            if let Err(error) = ret {
                warn!("{error}");
            }
        }
    }
}
