use std::{
    error::Error,
    ffi::CStr,
    io::{self, BufRead, Write},
    mem,
    os::fd::{AsFd, BorrowedFd},
};

use libc::{c_char, c_int, c_void, calloc, free, memcpy, size_t};
use pam_sys::{PamConversation, PamMessage, PamMessageStyle, PamResponse, PamReturnCode};
use rustix::{
    event::{self, PollFd, PollFlags, Timespec},
    io::Errno,
    termios::{self, LocalModes, OptionalActions},
};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use zeroize::Zeroize;

pub struct ConversationError;

impl<E: Error> From<E> for ConversationError {
    fn from(value: E) -> Self {
        // We cannot pass any error context to pam
        warn!("PAM conversation failed: {value}");
        Self
    }
}

impl From<ConversationError> for PamReturnCode {
    fn from(_: ConversationError) -> Self {
        PamReturnCode::CONV_ERR
    }
}

pub enum MessageLevel {
    Error,
    Info,
}

pub trait PamDisplay: Send {
    fn prompt(&self, text: &str, show: bool) -> Result<String, ConversationError>;
    fn message(&self, text: &str, level: MessageLevel) -> Result<(), ConversationError>;
}

// How often a waiting prompt looks at the cancellation token
const CANCEL_CHECK: Timespec = Timespec {
    tv_sec: 0,
    tv_nsec: 100_000_000,
};

/// Blocks until `fd` has input, or fails with `Interrupted` once `cancel` fires
fn wait_readable(fd: BorrowedFd<'_>, cancel: &CancellationToken) -> io::Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "prompt cancelled"));
        }

        let mut fds = [PollFd::from_borrowed_fd(fd, PollFlags::IN)];
        match event::poll(&mut fds, Some(&CANCEL_CHECK)) {
            Ok(0) | Err(Errno::INTR) => continue,
            Ok(_) => return Ok(()),
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Prompts on the controlling terminal until `cancel` fires
pub struct Console {
    cancel: CancellationToken,
}

impl Console {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    fn read_line(&self, show: bool) -> io::Result<String> {
        let stdin = io::stdin();

        // Echo is turned back on even if reading fails
        let saved = if show {
            None
        } else {
            let saved = termios::tcgetattr(&stdin)?;
            let mut hidden = saved.clone();
            hidden.local_modes.remove(LocalModes::ECHO);
            termios::tcsetattr(&stdin, OptionalActions::Now, &hidden)?;
            Some(saved)
        };

        let mut line = String::new();
        let read = wait_readable(stdin.as_fd(), &self.cancel)
            .and_then(|()| stdin.lock().read_line(&mut line));

        if let Some(saved) = saved {
            termios::tcsetattr(&stdin, OptionalActions::Now, &saved)?;
            println!();
        }

        read?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        line.zeroize();
        Ok(trimmed)
    }
}

impl PamDisplay for Console {
    fn prompt(&self, text: &str, show: bool) -> Result<String, ConversationError> {
        let mut stdout = io::stdout();
        write!(stdout, "{text}")?;
        stdout.flush()?;

        Ok(self.read_line(show)?)
    }

    fn message(&self, text: &str, level: MessageLevel) -> Result<(), ConversationError> {
        match level {
            MessageLevel::Error => eprintln!("{text}"),
            MessageLevel::Info => println!("{text}"),
        }
        Ok(())
    }
}

unsafe fn to_cstr(mut s: String) -> *mut c_char {
    unsafe {
        let a = calloc(1, s.len() + 1) as *mut c_char;
        if !a.is_null() {
            memcpy(a as *mut c_void, s.as_ptr() as *const c_void, s.len());
        }
        s.zeroize();
        a
    }
}

pub struct PamConversationHandler {
    display: Box<dyn PamDisplay>,
}

impl PamConversationHandler {
    pub fn with_display(display: impl PamDisplay + 'static) -> Box<Self> {
        Box::new(Self {
            display: Box::new(display),
        })
    }

    fn handle(
        &self,
        message: &PamMessage,
        response_sender: &mut PamResponse,
    ) -> Result<(), ConversationError> {
        let text = unsafe { CStr::from_ptr(message.msg) }.to_str()?;

        let respond = |response_sender: &mut PamResponse, response: String| {
            response_sender.resp = unsafe { to_cstr(response) };
            if response_sender.resp.is_null() {
                Err(ConversationError)
            } else {
                Ok(())
            }
        };

        match PamMessageStyle::from(message.msg_style) {
            PamMessageStyle::PROMPT_ECHO_ON => respond(response_sender, self.display.prompt(text, true)?),
            PamMessageStyle::PROMPT_ECHO_OFF => respond(response_sender, self.display.prompt(text, false)?),
            PamMessageStyle::ERROR_MSG => self.display.message(text, MessageLevel::Error),
            PamMessageStyle::TEXT_INFO => self.display.message(text, MessageLevel::Info),
        }
    }

    extern "C" fn converse(
        num_msg: c_int,
        msg: *mut *mut PamMessage,
        out_resp: *mut *mut PamResponse,
        appdata_ptr: *mut c_void,
    ) -> c_int {
        // allocate space for responses
        let resp = unsafe {
            calloc(num_msg as usize, mem::size_of::<PamResponse>() as size_t) as *mut PamResponse
        };
        if resp.is_null() {
            return PamReturnCode::BUF_ERR as c_int;
        }

        let wrapped_self = unsafe { &*(appdata_ptr as *const Self) };

        let mut pam_ret = PamReturnCode::SUCCESS;
        for i in 0..num_msg as isize {
            let message: &PamMessage = unsafe { &**(msg.offset(i)) };
            let response_ptr: &mut PamResponse = unsafe { &mut *(resp.offset(i)) };

            if let Err(error) = wrapped_self.handle(message, response_ptr) {
                pam_ret = error.into();
                break;
            }
        }

        if pam_ret != PamReturnCode::SUCCESS {
            // Free any strdup'd response strings
            for i in 0..num_msg as isize {
                let r: &mut PamResponse = unsafe { &mut *(resp.offset(i)) };
                if !r.resp.is_null() {
                    unsafe { free(r.resp as *mut c_void) };
                }
            }

            unsafe { free(resp as *mut c_void) };
        } else {
            unsafe { *out_resp = resp };
        }

        pam_ret as c_int
    }

    /// The handler has to stay at the same address for as long as PAM may call it
    pub fn conversation(self: &mut Box<Self>) -> PamConversation {
        PamConversation {
            conv: Some(Self::converse),
            data_ptr: &mut **self as *mut Self as *mut c_void,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::CString,
        os::unix::net::UnixStream,
        ptr,
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn cancelled_prompt_stops_waiting() {
        let (input, _writer) = UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let error = wait_readable(input.as_fd(), &cancel).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn typed_input_ends_the_wait() {
        let (input, mut writer) = UnixStream::pair().unwrap();
        writer.write_all(b"hunter2\n").unwrap();

        wait_readable(input.as_fd(), &CancellationToken::new()).unwrap();
    }

    struct Scripted {
        answer: Option<&'static str>,
    }

    impl PamDisplay for Scripted {
        fn prompt(&self, _text: &str, _show: bool) -> Result<String, ConversationError> {
            self.answer.map(str::to_string).ok_or(ConversationError)
        }

        fn message(&self, _text: &str, _level: MessageLevel) -> Result<(), ConversationError> {
            Ok(())
        }
    }

    fn converse_once(display: Scripted, style: PamMessageStyle) -> (c_int, *mut PamResponse) {
        let mut handler = PamConversationHandler::with_display(display);
        let conversation = handler.conversation();

        let text = CString::new("Password: ").unwrap();
        let mut message = PamMessage {
            msg_style: style as c_int,
            msg: text.as_ptr(),
        };
        let mut messages = [&mut message as *mut PamMessage];
        let mut responses: *mut PamResponse = ptr::null_mut();

        let converse = conversation.conv.unwrap();
        let code = converse(1, messages.as_mut_ptr(), &mut responses, conversation.data_ptr);
        (code, responses)
    }

    #[test]
    fn prompt_answers_are_handed_to_pam() {
        let display = Scripted { answer: Some("hunter2") };
        let (code, responses) = converse_once(display, PamMessageStyle::PROMPT_ECHO_OFF);

        assert_eq!(code, PamReturnCode::SUCCESS as c_int);
        assert!(!responses.is_null());

        unsafe {
            let answer = CStr::from_ptr((*responses).resp);
            assert_eq!(answer.to_str().unwrap(), "hunter2");

            free((*responses).resp as *mut c_void);
            free(responses as *mut c_void);
        }
    }

    #[test]
    fn failed_prompt_is_a_conversation_error() {
        let display = Scripted { answer: None };
        let (code, responses) = converse_once(display, PamMessageStyle::PROMPT_ECHO_ON);

        assert_eq!(code, PamReturnCode::CONV_ERR as c_int);
        assert!(responses.is_null());
    }

    #[test]
    fn messages_need_no_answer() {
        let display = Scripted { answer: None };
        let (code, responses) = converse_once(display, PamMessageStyle::TEXT_INFO);

        assert_eq!(code, PamReturnCode::SUCCESS as c_int);
        unsafe { free(responses as *mut c_void) };
    }
}
