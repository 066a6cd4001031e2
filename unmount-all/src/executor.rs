// ABOUTME: Per-mount teardown with retry and signal escalation.
// ABOUTME: Runs the operation, finds holders with fuser, signals them TERM then KILL, and classifies the result.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::MountPath;
use crate::shared::SharedMountSet;
use crate::tools::{Escalation, MountTools};

/// Operation attempts per mount point: TERM, sleep, TERM, sleep, KILL, sleep.
pub const RETRY_BUDGET: u32 = 4;

pub const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// This process is one of the holders.
    BusyBySelf,
    /// Busy, but discovery never named a holder.
    BusyUnknownHolder,
    /// The discovery command could not be run.
    DiscoveryFailed,
    /// The final KILL could not be sent.
    EscalationFailed,
    /// Holders were signalled and the mount point still would not go.
    GenericFailure,
}

/// The final outcome for one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOutcome {
    pub path: MountPath,
    pub outcome: Outcome,
}

pub struct Executor<'a, T: MountTools> {
    tools: &'a T,
    shared: &'a SharedMountSet,
    shared_lock: &'a Mutex<()>,
}

impl<'a, T: MountTools> Executor<'a, T> {
    /// `shared_lock` serialises every shared-mount teardown in the run.
    pub fn new(tools: &'a T, shared: &'a SharedMountSet, shared_lock: &'a Mutex<()>) -> Self {
        Self {
            tools,
            shared,
            shared_lock,
        }
    }

    /// Unmount (or remount) `path`, escalating against holders as needed.
    pub fn teardown(&self, path: &MountPath) -> Outcome {
        if !self.shared.contains(path) {
            return self.unmount_with_retries(path);
        }

        let _guard = self
            .shared_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match self.tools.is_mounted(path) {
            Ok(false) => {
                debug!(path = %path, "shared mount already gone");
                return Outcome::Success;
            }
            Ok(true) => {}
            Err(e) => {
                warn!(path = %path, error = %e, "mounted check failed, assuming still mounted");
            }
        }

        self.unmount_with_retries(path)
    }

    fn attempt(&self, path: &MountPath, attempt: u32) -> bool {
        match self.tools.run_operation(path) {
            Ok(true) => true,
            Ok(false) => {
                debug!(path = %path, attempt, "operation failed");
                false
            }
            Err(e) => {
                warn!(path = %path, attempt, error = %e, "failed to run operation");
                false
            }
        }
    }

    fn unmount_with_retries(&self, path: &MountPath) -> Outcome {
        let mut remaining = RETRY_BUDGET;
        let mut holder_seen = false;

        loop {
            let attempt = RETRY_BUDGET - remaining + 1;
            if self.attempt(path, attempt) {
                return Outcome::Success;
            }

            let holders = match self.tools.find_holders(path) {
                Ok(holders) => holders,
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to run fuser");
                    return Outcome::DiscoveryFailed;
                }
            };

            if holders.contains(&self.tools.own_pid()) {
                warn!(path = %path, "mount point is held by this process");
                return Outcome::BusyBySelf;
            }
            holder_seen |= !holders.is_empty();

            remaining -= 1;
            if remaining == 0 {
                return if holder_seen {
                    Outcome::GenericFailure
                } else {
                    Outcome::BusyUnknownHolder
                };
            }

            if !holders.is_empty() {
                let escalation = if remaining == 1 {
                    Escalation::Kill
                } else {
                    Escalation::Term
                };
                info!(path = %path, signal = %escalation, ?holders, "signalling holders");

                match self.tools.signal_holders(path, escalation) {
                    Ok(true) => {}
                    Ok(false) => debug!(path = %path, signal = %escalation, "fuser signalled nothing"),
                    Err(e) if escalation == Escalation::Kill => {
                        warn!(path = %path, error = %e, "failed to run fuser -KILL");
                        return Outcome::EscalationFailed;
                    }
                    Err(e) => warn!(path = %path, error = %e, "failed to run fuser -TERM"),
                }
            }

            self.tools.pause(RETRY_PAUSE);
        }
    }
}
