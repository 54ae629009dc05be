// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reusable worker threads, each running one job at a time.

use super::util::Status;
use crate::job::{JobError, JobOutcome};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Identifier of a worker: the index of its slot in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct WorkerId(pub usize);

impl WorkerId {
    /// Returns the slot index of this worker.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker #{}", self.0)
    }
}

/// Owner of a set of workers, receiving their notifications.
///
/// All the methods are called on the worker's own thread.
pub(crate) trait WorkerContext: Send + Sync + Sized + 'static {
    type Job: Send + 'static;
    type Output;

    /// Runs a job. Panics are caught by the caller.
    fn execute(&self, id: WorkerId, job: &Self::Job) -> JobOutcome<Self::Output>;

    /// Called once per finished job. The owner may hand a new job to the
    /// worker via [`Worker::assign()`] before returning.
    fn completed(&self, id: WorkerId, job: Self::Job, outcome: JobOutcome<Self::Output>);

    /// Called exactly once when the worker loop exits, including when it
    /// unwinds from a panic.
    fn terminated(self: Arc<Self>, id: WorkerId);
}

/// Job slot of a worker, written by the owner and consumed by the worker
/// thread.
struct Mailbox<J> {
    job: Option<J>,
    stop_requested: bool,
}

/// Handle to a worker thread.
///
/// The thread is expected to have reported its termination by the time the
/// handle is turned back into its [`JoinHandle`].
pub(crate) struct Worker<J> {
    id: WorkerId,
    mailbox: Arc<Status<Mailbox<J>>>,
    thread: JoinHandle<()>,
}

/// Error returned when the worker thread couldn't be spawned. The job that was
/// meant for the worker is handed back.
pub(crate) struct SpawnError<J> {
    pub job: J,
    pub error: std::io::Error,
}

impl<J: Send + 'static> Worker<J> {
    /// Spawns a new worker thread, whose first job is the given one.
    pub fn spawn<C: WorkerContext<Job = J>>(
        id: WorkerId,
        job: J,
        context: Arc<C>,
        pin_to_cpu: Option<usize>,
    ) -> Result<Self, SpawnError<J>> {
        if injected_spawn_failure() {
            return Err(SpawnError {
                job,
                error: std::io::Error::other("injected spawn failure"),
            });
        }

        let mailbox = Arc::new(Status::new(Mailbox {
            job: None,
            stop_requested: false,
        }));

        let spawned = std::thread::Builder::new()
            .name(format!("loadpool-worker-{}", id.index()))
            .spawn({
                let mailbox = mailbox.clone();
                move || {
                    if let Some(cpu) = pin_to_cpu {
                        pin_current_thread(id, cpu);
                    }
                    run(id, &mailbox, context)
                }
            });

        match spawned {
            Ok(thread) => {
                log_debug!("[{id}] Spawned");
                let worker = Self {
                    id,
                    mailbox,
                    thread,
                };
                worker.assign(job);
                Ok(worker)
            }
            Err(error) => Err(SpawnError { job, error }),
        }
    }

    /// Consumes this handle, returning the handle of the underlying thread.
    pub fn into_thread(self) -> JoinHandle<()> {
        self.thread
    }

    /// Hands a job to this idle worker.
    pub fn assign(&self, job: J) {
        log_trace!("[{}] Assigning a job", self.id);
        self.mailbox.notify_with(|mailbox| {
            debug_assert!(mailbox.job.is_none(), "{} is already busy", self.id);
            mailbox.job = Some(job);
        });
    }

    /// Asks this worker to exit once it has finished its current job, instead
    /// of waiting for more work. Doesn't interrupt a job in progress.
    pub fn request_stop(&self) {
        log_trace!("[{}] Requesting stop", self.id);
        self.mailbox
            .notify_with(|mailbox| mailbox.stop_requested = true);
    }
}

/// Main function run by a worker thread.
fn run<C: WorkerContext>(id: WorkerId, mailbox: &Status<Mailbox<C::Job>>, context: Arc<C>) {
    // Whether the loop exits normally or unwinds, the owner must be told that
    // this worker is gone.
    let notifier = TerminationNotifier { id, context };
    let context = &*notifier.context;

    loop {
        let job = {
            let mut mailbox = mailbox.wait_while(|m| m.job.is_none() && !m.stop_requested);
            match mailbox.job.take() {
                Some(job) => job,
                None => {
                    log_debug!("[{id}] Received stop request");
                    break;
                }
            }
        };

        log_trace!("[{id}] Running a job");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| context.execute(id, &job))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let error = JobError::from_panic(payload);
                log_warn!("[{id}] Caught panic in job: {error}");
                Err(error)
            }
        };
        context.completed(id, job, outcome);
    }

    // Explicit drop for clarity.
    drop(notifier);
}

/// Object whose destructor notifies the owner that a worker thread has exited
/// (or has panicked).
struct TerminationNotifier<C: WorkerContext> {
    id: WorkerId,
    context: Arc<C>,
}

impl<C: WorkerContext> Drop for TerminationNotifier<C> {
    fn drop(&mut self) {
        let id = self.id;
        if std::thread::panicking() {
            log_error!("[{id}] Detected panic in this worker, notifying the pool");
        } else {
            log_debug!("[{id}] Exiting");
        }
        self.context.clone().terminated(id);
    }
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: WorkerId, cpu: usize) {
    let mut cpu_set = CpuSet::new();
    if let Err(_e) = cpu_set.set(cpu) {
        log_warn!("[{id}] Failed to set CPU affinity to CPU #{cpu}: {_e}");
    } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        log_warn!("[{id}] Failed to set CPU affinity to CPU #{cpu}: {_e}");
    } else {
        log_debug!("[{id}] Pinned to CPU #{cpu}");
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: WorkerId, _cpu: usize) {}

/// Spawn failures injected by tests, counted per calling thread.
#[cfg(test)]
thread_local! {
    static SPAWN_FAILURES: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Makes the next `count` calls to [`Worker::spawn()`] on this thread fail.
#[cfg(test)]
pub(crate) fn fail_next_spawns(count: usize) {
    SPAWN_FAILURES.with(|failures| failures.set(count));
}

#[cfg(test)]
fn injected_spawn_failure() -> bool {
    SPAWN_FAILURES.with(|failures| {
        let count = failures.get();
        failures.set(count.saturating_sub(1));
        count != 0
    })
}

#[cfg(not(test))]
#[inline(always)]
fn injected_spawn_failure() -> bool {
    false
}
