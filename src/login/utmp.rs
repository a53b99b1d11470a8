use std::{
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Key of one login accounting entry
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub username: String,
    pub pid: i32,
    /// Terminal line, e.g. `tty7`
    pub line: String,
    /// X display such as `:0`, empty for other sessions
    pub display: String,
}

/// An open accounting entry. Closing consumes it.
#[derive(Debug)]
#[must_use = "every opened record has to be closed"]
pub struct RecordHandle {
    entry: SessionEntry,
}

impl RecordHandle {
    pub fn issue(entry: SessionEntry) -> Self {
        Self { entry }
    }

    pub fn entry(&self) -> &SessionEntry {
        &self.entry
    }
}

pub trait Accountant {
    fn open(&self, entry: SessionEntry) -> Result<RecordHandle>;
    fn close(&self, record: RecordHandle) -> Result<()>;
}

unsafe extern "C" {
    fn updwtmpx(file: *const libc::c_char, ut: *const libc::utmpx);
}

/// The system utmp and wtmp databases
pub struct Utmp {
    wtmp_path: PathBuf,
}

impl Default for Utmp {
    fn default() -> Self {
        Self {
            wtmp_path: "/var/log/wtmp".into(),
        }
    }
}

// utmp fields are NUL padded, not NUL terminated
fn fill(buf: &mut [libc::c_char], src: &str) {
    for (slot, byte) in buf.iter_mut().zip(src.as_bytes()) {
        *slot = *byte as libc::c_char;
    }
}

// Like getty, the id is the tail of the line name
fn line_id(line: &str) -> &str {
    let start = line.len().saturating_sub(4);
    line.get(start..).unwrap_or(line)
}

fn build_record(entry: &SessionEntry, kind: libc::c_short, now: SystemTime) -> libc::utmpx {
    let mut record: libc::utmpx = unsafe { std::mem::zeroed() };

    record.ut_type = kind;
    record.ut_pid = entry.pid;
    fill(&mut record.ut_line, &entry.line);
    fill(&mut record.ut_id, line_id(&entry.line));
    fill(&mut record.ut_host, &entry.display);

    if kind == libc::USER_PROCESS {
        fill(&mut record.ut_user, &entry.username);
    }

    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    record.ut_tv.tv_sec = since_epoch.as_secs() as _;
    record.ut_tv.tv_usec = since_epoch.subsec_micros() as _;

    record
}

impl Utmp {
    pub fn with_wtmp(path: &Path) -> Self {
        Self {
            wtmp_path: path.to_path_buf(),
        }
    }

    fn write(&self, record: &libc::utmpx) -> Result<()> {
        let wtmp = CString::new(self.wtmp_path.as_os_str().as_bytes())
            .context("wtmp path contains a NUL byte")?;

        unsafe {
            libc::setutxent();
            let written = libc::pututxline(record);
            libc::endutxent();

            // A host without a writable utmp should not prevent logins
            if written.is_null() {
                warn!(
                    "Failed to write utmp record: {}",
                    std::io::Error::last_os_error()
                );
            }

            updwtmpx(wtmp.as_ptr(), record);
        }

        Ok(())
    }
}

impl Accountant for Utmp {
    fn open(&self, entry: SessionEntry) -> Result<RecordHandle> {
        let record = build_record(&entry, libc::USER_PROCESS, SystemTime::now());
        self.write(&record)?;

        debug!("Opened accounting record for {} on {}", entry.username, entry.line);
        Ok(RecordHandle::issue(entry))
    }

    fn close(&self, record: RecordHandle) -> Result<()> {
        let entry = record.entry;
        let record = build_record(&entry, libc::DEAD_PROCESS, SystemTime::now());
        self.write(&record)?;

        debug!("Closed accounting record for {} on {}", entry.username, entry.line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn entry() -> SessionEntry {
        SessionEntry {
            username: "alice".into(),
            pid: 4242,
            line: "tty7".into(),
            display: ":0".into(),
        }
    }

    fn text(buf: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = buf.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn user_process_record_carries_the_key() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let record = build_record(&entry(), libc::USER_PROCESS, now);

        assert_eq!(record.ut_type, libc::USER_PROCESS);
        assert_eq!(record.ut_pid, 4242);
        assert_eq!(text(&record.ut_line), "tty7");
        assert_eq!(text(&record.ut_id), "tty7");
        assert_eq!(text(&record.ut_user), "alice");
        assert_eq!(text(&record.ut_host), ":0");
        assert_eq!(record.ut_tv.tv_sec as i64, 1_700_000_000);
    }

    #[test]
    fn dead_process_record_has_no_user() {
        let record = build_record(&entry(), libc::DEAD_PROCESS, SystemTime::now());

        assert_eq!(record.ut_type, libc::DEAD_PROCESS);
        assert_eq!(text(&record.ut_user), "");
        assert_eq!(text(&record.ut_line), "tty7");
    }

    #[test]
    fn long_values_are_truncated() {
        let mut buf = [0 as libc::c_char; 4];
        fill(&mut buf, "tty12");

        assert_eq!(text(&buf), "tty1");
        assert_eq!(line_id("tty12"), "ty12");
    }

    #[test]
    fn wtmp_receives_both_records() {
        let dir = tempfile::tempdir().unwrap();
        let wtmp = dir.path().join("wtmp");
        // updwtmpx only appends to existing files
        std::fs::File::create(&wtmp).unwrap();
        let utmp = Utmp::with_wtmp(&wtmp);

        let record = utmp.open(entry()).unwrap();
        utmp.close(record).unwrap();

        let size = std::fs::metadata(&wtmp).unwrap().len() as usize;
        assert_eq!(size, 2 * std::mem::size_of::<libc::utmpx>());
    }
}
