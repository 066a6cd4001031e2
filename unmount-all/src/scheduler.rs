// ABOUTME: Concurrent teardown scheduler.
// ABOUTME: Runs one worker thread per catalog entry; each waits for its sub-mounts to finish first.

use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use tracing::{debug, error};

use crate::catalog::{Catalog, MountPath};
use crate::executor::{Executor, MountOutcome, Outcome};
use crate::tools::MountTools;

/// A flag that is set once and can be waited on by any number of threads.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_all();
    }

    /// Block until `complete` has been called.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Sets the completion when dropped, including during unwinding.
struct CompleteOnDrop<'a>(&'a Completion);

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

struct WorkerState {
    index: usize,
    path: MountPath,
    done: Completion,
    outcome: OnceLock<Outcome>,
}

/// Tear down every catalog entry concurrently and return outcomes in
/// catalog order.
pub fn run<T: MountTools>(catalog: &Catalog, executor: &Executor<'_, T>) -> Vec<MountOutcome> {
    let states: Vec<WorkerState> = catalog
        .iter()
        .enumerate()
        .map(|(index, path)| WorkerState {
            index,
            path: path.clone(),
            done: Completion::new(),
            outcome: OnceLock::new(),
        })
        .collect();

    thread::scope(|scope| {
        let all = &states;
        let handles: Vec<_> = states
            .iter()
            .map(|state| {
                let spawned = thread::Builder::new()
                    .name(format!("unmount-{}", state.index))
                    .spawn_scoped(scope, move || run_worker(catalog, all, state, executor));

                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!(path = %state.path, error = %e, "failed to spawn worker");
                        let _ = state.outcome.set(Outcome::GenericFailure);
                        state.done.complete();
                        None
                    }
                }
            })
            .collect();

        for (state, handle) in states.iter().zip(handles) {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!(path = %state.path, "worker panicked");
                }
            }
        }
    });

    states
        .into_iter()
        .map(|state| MountOutcome {
            path: state.path,
            outcome: state.outcome.into_inner().unwrap_or(Outcome::GenericFailure),
        })
        .collect()
}

fn run_worker<T: MountTools>(
    catalog: &Catalog,
    states: &[WorkerState],
    state: &WorkerState,
    executor: &Executor<'_, T>,
) {
    let _complete = CompleteOnDrop(&state.done);

    for child in catalog.children_of(state.index) {
        debug!(path = %state.path, child = %states[child].path, "waiting for sub-mount");
        states[child].done.wait();
    }

    let outcome = executor.teardown(&state.path);
    debug!(path = %state.path, ?outcome, "teardown finished");
    let _ = state.outcome.set(outcome);
}
