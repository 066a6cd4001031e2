// ABOUTME: External commands used while tearing down a mount point.
// ABOUTME: Wraps the operation template, mounted check, fuser discovery and fuser signalling.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

use crate::catalog::MountPath;
use crate::config::Config;

/// Signal sent to processes holding a mount point open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Term,
    Kill,
}

impl Escalation {
    pub fn signal_name(self) -> &'static str {
        match self {
            Escalation::Term => "TERM",
            Escalation::Kill => "KILL",
        }
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signal_name())
    }
}

/// Process ids reported as holding a mount point.
pub type Holders = BTreeSet<u32>;

/// Everything the executor needs from the outside world.
///
/// `Err` means the command could not be started at all; `Ok(false)` means it
/// ran and reported failure.
pub trait MountTools: Sync {
    /// Run the unmount/remount operation against `path`.
    fn run_operation(&self, path: &MountPath) -> io::Result<bool>;

    /// Ask the enumerator whether `path` is still mounted.
    fn is_mounted(&self, path: &MountPath) -> io::Result<bool>;

    /// List the processes using `path`. Empty means nobody was found.
    fn find_holders(&self, path: &MountPath) -> io::Result<Holders>;

    /// Signal every process using `path`.
    fn signal_holders(&self, path: &MountPath, escalation: Escalation) -> io::Result<bool>;

    fn own_pid(&self) -> u32;

    /// Give signalled processes time to let go.
    fn pause(&self, duration: Duration);
}

#[cfg(target_os = "linux")]
const FUSER_MOUNT_OPTS: &[&str] = &["-m"];
#[cfg(not(target_os = "linux"))]
const FUSER_MOUNT_OPTS: &[&str] = &["-m", "-c"];

/// `MountTools` backed by real subprocesses.
pub struct SystemTools {
    operation: String,
    shell: String,
    enumerator: String,
    fuser: String,
    timeout: String,
    discovery_timeout: String,
    pid: u32,
}

impl SystemTools {
    pub fn new(operation: &str, config: &Config) -> Self {
        Self {
            operation: operation.to_string(),
            shell: config.tools.shell.clone(),
            enumerator: config.tools.enumerator.clone(),
            fuser: config.tools.fuser.clone(),
            timeout: config.tools.timeout.clone(),
            discovery_timeout: config.discovery_timeout().to_string(),
            pid: rustix::process::getpid().as_raw_nonzero().get().unsigned_abs(),
        }
    }

    /// The shell command line run for one mount point. The path bytes are
    /// carried through unchanged.
    pub fn operation_command(&self, path: &MountPath) -> OsString {
        let mut line = self.operation.clone().into_bytes();
        line.push(b' ');
        line.extend(shell_quote(path.as_bytes()));
        line.extend_from_slice(b" 2>/dev/null");
        OsString::from_vec(line)
    }

    fn discovery_command(&self, path: &MountPath) -> Command {
        let mut cmd = Command::new(&self.timeout);
        cmd.args(["-s", "KILL"])
            .arg(&self.discovery_timeout)
            .arg(&self.fuser)
            .args(FUSER_MOUNT_OPTS)
            .arg(path.as_os_str());
        cmd
    }

    fn signal_command(&self, path: &MountPath, escalation: Escalation) -> Command {
        let mut cmd = Command::new(&self.fuser);
        #[cfg(target_os = "linux")]
        cmd.arg(format!("-{}", escalation.signal_name()));
        #[cfg(not(target_os = "linux"))]
        cmd.args(["-s", escalation.signal_name()]);
        cmd.arg("-k").args(FUSER_MOUNT_OPTS).arg(path.as_os_str());
        cmd
    }
}

impl MountTools for SystemTools {
    fn run_operation(&self, path: &MountPath) -> io::Result<bool> {
        let line = self.operation_command(path);
        debug!(command = %line.to_string_lossy(), "running operation");
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn is_mounted(&self, path: &MountPath) -> io::Result<bool> {
        let status = Command::new(&self.enumerator)
            .arg("--quiet")
            .arg(path.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn find_holders(&self, path: &MountPath) -> io::Result<Holders> {
        // fuser exits 1 when nothing uses the path, so only stdout matters.
        let output = self
            .discovery_command(path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        Ok(parse_holders(&String::from_utf8_lossy(&output.stdout)))
    }

    fn signal_holders(&self, path: &MountPath, escalation: Escalation) -> io::Result<bool> {
        let status = self
            .signal_command(path, escalation)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn own_pid(&self) -> u32 {
        self.pid
    }

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Parse fuser's pid list. Access-mode suffixes such as `1234c` or `88m` are
/// stripped; anything without a leading number is ignored.
pub fn parse_holders(output: &str) -> Holders {
    output
        .split_whitespace()
        .filter_map(|token| {
            let digits = token.trim_end_matches(|c: char| !c.is_ascii_digit());
            digits.parse().ok()
        })
        .collect()
}

/// Quote `s` for a POSIX shell.
fn shell_quote(s: &[u8]) -> Vec<u8> {
    let mut quoted = Vec::with_capacity(s.len() + 2);
    quoted.push(b'\'');
    for &b in s {
        if b == b'\'' {
            quoted.extend_from_slice(br"'\''");
        } else {
            quoted.push(b);
        }
    }
    quoted.push(b'\'');
    quoted
}

/// Check that `program` resolves through the shell's `command -v`.
pub fn command_available(shell: &str, program: &str) -> bool {
    let mut line = b"command -v ".to_vec();
    line.extend(shell_quote(program.as_bytes()));
    line.extend_from_slice(b" >/dev/null 2>&1");

    Command::new(shell)
        .arg("-c")
        .arg(OsString::from_vec(line))
        .stdin(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}


#[cfg(test)]
pub mod fake {
    //! Scripted `MountTools` for executor and scheduler tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub const FAKE_PID: u32 = 31337;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Operation(String),
        OperationDone(String),
        Mounted(String),
        Discover(String),
        Signal(String, Escalation),
        Pause,
    }

    #[derive(Default)]
    pub struct FakeTools {
        failures: HashMap<String, usize>,
        operation_spawn_fails: HashSet<String>,
        holders: HashMap<String, Vec<u32>>,
        discovery_fails: HashSet<String>,
        not_mounted: HashSet<String>,
        mounted_check_fails: bool,
        signal_fails: bool,
        delays: HashMap<String, Duration>,
        attempts: Mutex<HashMap<String, usize>>,
        calls: Mutex<Vec<Call>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeTools {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the first `times` operations on `path`.
        pub fn failing(mut self, path: &str, times: usize) -> Self {
            self.failures.insert(path.to_string(), times);
            self
        }

        pub fn operation_spawn_fails(mut self, path: &str) -> Self {
            self.operation_spawn_fails.insert(path.to_string());
            self
        }

        pub fn holders(mut self, path: &str, pids: &[u32]) -> Self {
            self.holders.insert(path.to_string(), pids.to_vec());
            self
        }

        pub fn discovery_fails(mut self, path: &str) -> Self {
            self.discovery_fails.insert(path.to_string());
            self
        }

        pub fn not_mounted(mut self, path: &str) -> Self {
            self.not_mounted.insert(path.to_string());
            self
        }

        pub fn mounted_check_fails(mut self) -> Self {
            self.mounted_check_fails = true;
            self
        }

        pub fn signal_fails(mut self) -> Self {
            self.signal_fails = true;
            self
        }

        /// Make each operation on `path` take `delay`.
        pub fn delay(mut self, path: &str, delay: Duration) -> Self {
            self.delays.insert(path.to_string(), delay);
            self
        }

        fn record(&self, call: Call) {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(call);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn operation_count(&self, path: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Operation(p) if p == path))
                .count()
        }

        pub fn discovery_count(&self, path: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Discover(p) if p == path))
                .count()
        }

        pub fn signals(&self, path: &str) -> Vec<Escalation> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Signal(p, e) if p == path => Some(e),
                    _ => None,
                })
                .collect()
        }

        pub fn pause_count(&self) -> usize {
            self.calls().iter().filter(|c| **c == Call::Pause).count()
        }

        /// Position of the first matching call.
        pub fn position(&self, call: &Call) -> usize {
            self.calls()
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("{call:?} never happened"))
        }

        /// Most operations ever observed running at the same time.
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    impl MountTools for FakeTools {
        fn run_operation(&self, path: &MountPath) -> io::Result<bool> {
            let key = path.to_string();
            self.record(Call::Operation(key.clone()));

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&key) {
                std::thread::sleep(*delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.record(Call::OperationDone(key.clone()));

            if self.operation_spawn_fails.contains(&key) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no shell"));
            }

            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(key.clone()).or_insert(0);
            *n += 1;
            let fail_count = self.failures.get(&key).copied().unwrap_or(0);
            Ok(*n > fail_count)
        }

        fn is_mounted(&self, path: &MountPath) -> io::Result<bool> {
            self.record(Call::Mounted(path.to_string()));
            if self.mounted_check_fails {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no mountinfo"));
            }
            Ok(!self.not_mounted.contains(&path.to_string()))
        }

        fn find_holders(&self, path: &MountPath) -> io::Result<Holders> {
            let key = path.to_string();
            self.record(Call::Discover(key.clone()));
            if self.discovery_fails.contains(&key) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no timeout"));
            }
            Ok(self
                .holders
                .get(&key)
                .map(|pids| pids.iter().copied().collect())
                .unwrap_or_default())
        }

        fn signal_holders(&self, path: &MountPath, escalation: Escalation) -> io::Result<bool> {
            self.record(Call::Signal(path.to_string(), escalation));
            if self.signal_fails {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no fuser"));
            }
            Ok(true)
        }

        fn own_pid(&self) -> u32 {
            FAKE_PID
        }

        fn pause(&self, _duration: Duration) {
            self.record(Call::Pause);
        }
    }
}
