// ABOUTME: Reporting of per-mount outcomes after all workers have finished.
// ABOUTME: Prints one begin/end progress line per mount point and derives the exit status.

use std::io::{self, Write};
use std::process::ExitCode;
use tracing::{info, warn};

use crate::catalog::MountPath;
use crate::executor::{MountOutcome, Outcome};

/// What the operation command does, as shown in progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unmount,
    RemountReadOnly,
}

impl Mode {
    pub fn from_command(command: &str) -> Self {
        if command.contains("-r") || command.contains("remount") {
            Mode::RemountReadOnly
        } else {
            Mode::Unmount
        }
    }

    pub fn describe(self, path: &MountPath) -> String {
        match self {
            Mode::Unmount => format!("Unmounting {path}"),
            Mode::RemountReadOnly => format!("Remounting {path} read-only"),
        }
    }
}

/// Failure text for `outcome`, or `None` on success.
pub fn failure_message(outcome: Outcome, path: &MountPath) -> Option<String> {
    let message = match outcome {
        Outcome::Success => return None,
        Outcome::BusyBySelf => format!("failed because we are using {path}"),
        Outcome::BusyUnknownHolder => "in use but discovery finds nothing".to_string(),
        Outcome::DiscoveryFailed => "in use but discovery command failed".to_string(),
        Outcome::EscalationFailed => "in use but failed to terminate process".to_string(),
        Outcome::GenericFailure => "failed".to_string(),
    };
    Some(message)
}

/// Begin/end style progress output.
pub struct Progress<W: Write> {
    out: W,
}

impl<W: Write> Progress<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn begin(&mut self, action: &str) -> io::Result<()> {
        write!(self.out, " * {action} ...")
    }

    pub fn end(&mut self, failure: Option<&str>) -> io::Result<()> {
        match failure {
            None => writeln!(self.out, " [ ok ]"),
            Some(message) => writeln!(self.out, " {message} [ !! ]"),
        }?;
        self.out.flush()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub failed: usize,
    /// A mount point ended in `GenericFailure`.
    pub fatal: bool,
}

impl Summary {
    pub fn exit_code(&self) -> ExitCode {
        if self.fatal {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}

/// Print one line per result, in catalog order, and summarise.
pub fn report<W: Write>(mode: Mode, results: &[MountOutcome], out: W) -> io::Result<Summary> {
    let mut progress = Progress::new(out);
    let mut summary = Summary {
        total: results.len(),
        ..Summary::default()
    };

    for result in results {
        let message = failure_message(result.outcome, &result.path);

        progress.begin(&mode.describe(&result.path))?;
        progress.end(message.as_deref())?;

        match &message {
            None => info!(path = %result.path, "done"),
            Some(message) => {
                warn!(path = %result.path, outcome = ?result.outcome, "{message}");
                summary.failed += 1;
            }
        }

        if result.outcome == Outcome::GenericFailure {
            summary.fatal = true;
        }
    }

    Ok(summary)
}
